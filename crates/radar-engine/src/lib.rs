//! Run orchestration: executor, scheduler, alerting, task, template and video services.

use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use radar_core::ValidationError;
use radar_source::{SourceError, VideoSource};
use radar_storage::{Repository, StoreError};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

mod alerts;
mod executor;
mod scheduler;
mod settings;
mod tasks;
mod templates;
mod videos;

#[cfg(test)]
pub(crate) mod test_support;

pub use alerts::AlertManager;
pub use executor::{DryRunReport, DryRunSample, RunExecutor, DEFAULT_DRY_RUN_LIMIT};
pub use scheduler::{TaskScheduler, TickReport, DEFAULT_TICK_CRON};
pub use settings::SettingsHandle;
pub use tasks::TaskService;
pub use templates::TemplateStore;
pub use videos::VideoService;

pub const CRATE_NAME: &str = "radar-engine";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("task {task_id} already has an active run")]
    ConcurrentRunConflict { task_id: Uuid },
    #[error("fetch failed: {0}")]
    Fetch(#[from] SourceError),
    /// Per-item failure; recorded in the run's error detail, never fatal to the run.
    #[error("item {bvid} could not be classified: {message}")]
    ItemClassification { bvid: String, message: String },
    #[error("persistence failed: {0}")]
    Persistence(StoreError),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::ConcurrentRunConflict { .. } => "concurrent_run_conflict",
            Self::Fetch(_) => "fetch",
            Self::ItemClassification { .. } => "item_classification",
            Self::Persistence(_) => "persistence",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::ActiveRunExists { task_id } => Self::ConcurrentRunConflict { task_id },
            other => Self::Persistence(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Timezone for schedules that do not name one.
    pub default_tz: Tz,
    /// Fail runs left `running` by a previous process.
    pub recover_orphaned_runs: bool,
    /// Insert the built-in templates when the template store is empty.
    pub seed_templates: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_tz: Tz::UTC,
            recover_orphaned_runs: false,
            seed_templates: true,
        }
    }
}

/// Wired set of services sharing one repository, one source and one settings handle.
#[derive(Clone)]
pub struct Engine {
    pub repo: Arc<dyn Repository>,
    pub settings: SettingsHandle,
    pub alerts: Arc<AlertManager>,
    pub executor: Arc<RunExecutor>,
    pub scheduler: Arc<TaskScheduler>,
    pub tasks: TaskService,
    pub templates: TemplateStore,
    pub videos: VideoService,
}

impl Engine {
    pub async fn bootstrap(
        repo: Arc<dyn Repository>,
        source: Arc<dyn VideoSource>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let settings = SettingsHandle::load(Arc::clone(&repo)).await?;

        if options.recover_orphaned_runs {
            let abandoned = repo
                .abandon_running_runs(Utc::now(), "run interrupted by process restart")
                .await?;
            if abandoned > 0 {
                warn!(abandoned, "failed runs orphaned by a previous process");
            }
        }

        let templates = TemplateStore::new(Arc::clone(&repo));
        if options.seed_templates {
            let seeded = templates.seed_presets().await?;
            if seeded > 0 {
                info!(seeded, "seeded built-in rule templates");
            }
        }

        let alerts = Arc::new(AlertManager::new(Arc::clone(&repo)));
        let executor = Arc::new(RunExecutor::new(
            Arc::clone(&repo),
            source,
            settings.clone(),
            Arc::clone(&alerts),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&repo),
            Arc::clone(&executor),
            options.default_tz,
        ));
        let tasks = TaskService::new(Arc::clone(&repo));
        let videos = VideoService::new(Arc::clone(&repo));

        Ok(Self {
            repo,
            settings,
            alerts,
            executor,
            scheduler,
            tasks,
            templates,
            videos,
        })
    }
}
