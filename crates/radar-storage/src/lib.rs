//! Persistence and outbound HTTP plumbing for the radar.
//!
//! Repositories are split per aggregate (tasks, runs, videos, alerts,
//! templates, settings) and bundled behind [`Repository`] so the engine can
//! hold a single `Arc<dyn Repository>`. [`MemoryStore`] backs tests and the
//! no-database mode; [`PgStore`] is the Postgres implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{
    Alert, HotTag, Page, PageRequest, ProcessStatus, RunRecord, Settings, Task, TaskStatus,
    Template, VideoRecord, VideoSort,
};
use thiserror::Error;
use uuid::Uuid;

mod http;
mod memory;
mod postgres;

pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, TokenBucket,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "radar-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("task {task_id} already has an active run")]
    ActiveRunExists { task_id: Uuid },
    #[error("run {0} is already terminal")]
    RunFinalized(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt stored value in {column}: {message}")]
    Corrupt { column: &'static str, message: String },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    /// Case-insensitive substring match on the task name or any keyword.
    pub q: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        match self.q.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(q) => {
                let q = q.to_lowercase();
                task.name.to_lowercase().contains(&q)
                    || task.keywords.iter().any(|k| k.to_lowercase().contains(&q))
            }
        }
    }
}

/// Narrowing for the stored video listing. Every bound is inclusive and
/// every unset field matches all rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoFilter {
    pub task_id: Option<Uuid>,
    pub tag: Option<HotTag>,
    pub process_status: Option<ProcessStatus>,
    pub publish_from: Option<DateTime<Utc>>,
    pub publish_to: Option<DateTime<Utc>>,
    pub fetch_from: Option<DateTime<Utc>>,
    pub fetch_to: Option<DateTime<Utc>>,
    pub min_views: Option<u64>,
    pub min_fav: Option<u64>,
    pub min_coin: Option<u64>,
    pub min_reply: Option<u64>,
    pub min_fav_rate: Option<f64>,
    pub min_coin_rate: Option<f64>,
    pub min_reply_rate: Option<f64>,
    pub min_fav_fan_ratio: Option<f64>,
    /// Upper bound on the uploader's follower count.
    pub fan_max: Option<u64>,
}

impl VideoFilter {
    pub fn matches(&self, video: &VideoRecord) -> bool {
        fn at_least<T: PartialOrd>(bound: Option<T>, value: T) -> bool {
            bound.map_or(true, |b| value >= b)
        }
        fn at_most<T: PartialOrd>(bound: Option<T>, value: T) -> bool {
            bound.map_or(true, |b| value <= b)
        }

        if let Some(task_id) = self.task_id {
            if !video.source_task_ids.contains(&task_id) {
                return false;
            }
        }
        if let Some(tag) = self.tag {
            if !video.has_tag(tag) {
                return false;
            }
        }
        if self.process_status.is_some_and(|s| s != video.process_status) {
            return false;
        }
        // Rows without a publish time fall outside any publish window.
        if self.publish_from.is_some() || self.publish_to.is_some() {
            let Some(published) = video.publish_time else {
                return false;
            };
            if !at_least(self.publish_from, published) || !at_most(self.publish_to, published) {
                return false;
            }
        }
        let stats = &video.stats;
        let rates = &video.rates;
        at_least(self.fetch_from, video.fetch_time)
            && at_most(self.fetch_to, video.fetch_time)
            && at_least(self.min_views, stats.views)
            && at_least(self.min_fav, stats.fav)
            && at_least(self.min_coin, stats.coin)
            && at_least(self.min_reply, stats.reply)
            && at_least(self.min_fav_rate, rates.fav_rate)
            && at_least(self.min_coin_rate, rates.coin_rate)
            && at_least(self.min_reply_rate, rates.reply_rate)
            && at_least(self.min_fav_fan_ratio, rates.fav_fan_ratio)
            && at_most(self.fan_max, video.follower_count)
    }
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;
    /// Writes configuration, status and `updated_at`. The failure streak is
    /// only touched through the streak methods below.
    async fn update_task(&self, task: &Task) -> Result<(), StoreError>;
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;
    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: PageRequest,
    ) -> Result<Page<Task>, StoreError>;
    async fn enabled_tasks(&self) -> Result<Vec<Task>, StoreError>;
    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError>;
    /// Atomically increments the streak, returning `(previous, current)`.
    async fn bump_failure_streak(&self, id: Uuid) -> Result<(u32, u32), StoreError>;
    /// Atomically zeroes the streak, returning the previous value.
    async fn reset_failure_streak(&self, id: Uuid) -> Result<u32, StoreError>;
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Fails with [`StoreError::ActiveRunExists`] when `run` is running and
    /// the task already has a running record.
    async fn insert_run(&self, run: &RunRecord) -> Result<(), StoreError>;
    /// Stores the terminal state of a running record. Terminal records are
    /// never rewritten.
    async fn finish_run(&self, run: &RunRecord) -> Result<(), StoreError>;
    async fn get_run(&self, id: Uuid) -> Result<Option<RunRecord>, StoreError>;
    /// Newest first.
    async fn list_runs(
        &self,
        task_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<RunRecord>, StoreError>;
    async fn active_run(&self, task_id: Uuid) -> Result<Option<RunRecord>, StoreError>;
    async fn scheduled_run_since(
        &self,
        task_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Fails one record if it is still running. Returns false when the
    /// record is missing or already terminal.
    async fn fail_running_run(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        summary: &str,
    ) -> Result<bool, StoreError>;
    /// Fails every record still marked running. Used at startup to clear
    /// runs orphaned by a previous process.
    async fn abandon_running_runs(
        &self,
        now: DateTime<Utc>,
        summary: &str,
    ) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait VideoRepository: Send + Sync {
    /// Upserts the video and links it to `task_id`, keeping the stored
    /// `process_status` and `note`. Returns true when the video was new to
    /// the store.
    async fn upsert_video(&self, task_id: Uuid, video: &VideoRecord) -> Result<bool, StoreError>;
    async fn get_video(&self, bvid: &str) -> Result<Option<VideoRecord>, StoreError>;
    async fn list_videos(
        &self,
        filter: &VideoFilter,
        sort: VideoSort,
        page: PageRequest,
    ) -> Result<Page<VideoRecord>, StoreError>;
    async fn set_video_process_status(
        &self,
        bvid: &str,
        status: ProcessStatus,
    ) -> Result<VideoRecord, StoreError>;
    /// `None` clears the note.
    async fn set_video_note(
        &self,
        bvid: &str,
        note: Option<String>,
    ) -> Result<VideoRecord, StoreError>;
    /// Sorted union of trimmed, non-empty task and video tags.
    async fn list_tags(&self) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError>;
    async fn list_alerts(
        &self,
        unread_only: bool,
        page: PageRequest,
    ) -> Result<Page<Alert>, StoreError>;
    /// Sets `read_at` if unset and returns the stored alert.
    async fn mark_alert_read(&self, id: Uuid, now: DateTime<Utc>) -> Result<Alert, StoreError>;
    async fn mark_all_alerts_read(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
    async fn unread_alert_count(&self) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn insert_template(&self, template: &Template) -> Result<(), StoreError>;
    async fn update_template(&self, template: &Template) -> Result<(), StoreError>;
    async fn get_template(&self, id: Uuid) -> Result<Option<Template>, StoreError>;
    async fn list_templates(&self) -> Result<Vec<Template>, StoreError>;
    async fn delete_template(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn load_settings(&self) -> Result<Option<Settings>, StoreError>;
    async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError>;
}

pub trait Repository:
    TaskRepository
    + RunRepository
    + VideoRepository
    + AlertRepository
    + TemplateRepository
    + SettingsRepository
{
}

impl<T> Repository for T where
    T: TaskRepository
        + RunRepository
        + VideoRepository
        + AlertRepository
        + TemplateRepository
        + SettingsRepository
{
}
