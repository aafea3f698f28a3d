use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use radar_core::{
    Alert, AlertKind, AlertLevel, Page, PageRequest, RunRecord, RunStatus, Settings, Task,
};
use radar_storage::Repository;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::EngineError;

/// Tracks per-task failure streaks and raises an alert when a streak first
/// reaches the configured threshold.
pub struct AlertManager {
    repo: Arc<dyn Repository>,
    task_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl AlertManager {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Entries nobody holds are dropped here, so the map only tracks tasks
    /// with an outcome in flight.
    async fn task_lock(&self, task_id: Uuid) -> Arc<Mutex<()>> {
        let mut map = self.task_locks.lock().await;
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.entry(task_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Applies a terminal run to the task's streak. Returns the alert created
    /// by this call, if any.
    pub async fn record_outcome(
        &self,
        task: &Task,
        run: &RunRecord,
        settings: &Settings,
    ) -> Result<Option<Alert>, EngineError> {
        let lock = self.task_lock(task.id).await;
        let _guard = lock.lock().await;

        match run.status {
            RunStatus::Success => {
                let previous = self.repo.reset_failure_streak(task.id).await?;
                if previous > 0 {
                    info!(task_id = %task.id, previous, "failure streak reset");
                }
                Ok(None)
            }
            RunStatus::Failed => {
                let (previous, current) = self.repo.bump_failure_streak(task.id).await?;
                let threshold = settings.alert_consecutive_failures;
                if previous >= threshold || current < threshold {
                    return Ok(None);
                }
                let alert = streak_alert(task, run, current, threshold);
                self.repo.insert_alert(&alert).await?;
                warn!(task_id = %task.id, streak = current, threshold, "consecutive failure alert raised");
                Ok(Some(alert))
            }
            RunStatus::Queued | RunStatus::Running => Ok(None),
        }
    }

    pub async fn list(&self, unread_only: bool, page: PageRequest) -> Result<Page<Alert>, EngineError> {
        Ok(self.repo.list_alerts(unread_only, page).await?)
    }

    pub async fn mark_read(&self, id: Uuid) -> Result<Alert, EngineError> {
        Ok(self.repo.mark_alert_read(id, Utc::now()).await?)
    }

    pub async fn mark_all_read(&self) -> Result<u64, EngineError> {
        Ok(self.repo.mark_all_alerts_read(Utc::now()).await?)
    }

    pub async fn unread_count(&self) -> Result<u64, EngineError> {
        Ok(self.repo.unread_alert_count().await?)
    }
}

fn streak_alert(task: &Task, run: &RunRecord, streak: u32, threshold: u32) -> Alert {
    let last_error = run.error_summary.as_deref().unwrap_or("no summary recorded");
    Alert {
        id: Uuid::new_v4(),
        task_id: Some(task.id),
        kind: AlertKind::ConsecutiveFailure,
        level: AlertLevel::Warning,
        title: format!("Task failing repeatedly: {}", task.name),
        message: format!(
            "Task \"{}\" has failed {streak} runs in a row. Last error: {last_error}",
            task.name
        ),
        meta: json!({
            "task_id": task.id,
            "run_id": run.id,
            "consecutive_failures": streak,
            "threshold": threshold,
        }),
        created_at: Utc::now(),
        read_at: None,
    }
}
