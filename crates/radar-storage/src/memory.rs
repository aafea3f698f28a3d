use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{
    Alert, Page, PageRequest, ProcessStatus, RunRecord, RunStatus, RunTrigger, Settings, Task,
    Template, VideoRecord, VideoSort,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    AlertRepository, RunRepository, SettingsRepository, StoreError, TaskFilter, TaskRepository,
    TemplateRepository, VideoFilter, VideoRepository,
};

/// In-process store. Every operation takes one lock, so each call is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: HashMap<Uuid, Task>,
    runs: HashMap<Uuid, RunRecord>,
    videos: HashMap<String, VideoRecord>,
    alerts: HashMap<Uuid, Alert>,
    templates: HashMap<Uuid, Template>,
    settings: Option<Settings>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        self.state.lock().await.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::not_found("task", task.id))?;
        let streak = stored.consecutive_failures;
        *stored = task.clone();
        stored.consecutive_failures = streak;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.state.lock().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: PageRequest,
    ) -> Result<Page<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(Page::from_vec(tasks, page))
    }

    async fn enabled_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.is_enabled())
            .cloned()
            .collect())
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let removed = state.tasks.remove(&id).is_some();
        if removed {
            state.runs.retain(|_, run| run.task_id != id);
            for alert in state.alerts.values_mut() {
                if alert.task_id == Some(id) {
                    alert.task_id = None;
                }
            }
            for video in state.videos.values_mut() {
                video.source_task_ids.retain(|t| *t != id);
            }
        }
        Ok(removed)
    }

    async fn bump_failure_streak(&self, id: Uuid) -> Result<(u32, u32), StoreError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("task", id))?;
        let previous = task.consecutive_failures;
        task.consecutive_failures = previous.saturating_add(1);
        Ok((previous, task.consecutive_failures))
    }

    async fn reset_failure_streak(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("task", id))?;
        Ok(std::mem::take(&mut task.consecutive_failures))
    }
}

#[async_trait]
impl RunRepository for MemoryStore {
    async fn insert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if run.status == RunStatus::Running
            && state
                .runs
                .values()
                .any(|r| r.task_id == run.task_id && r.status == RunStatus::Running)
        {
            return Err(StoreError::ActiveRunExists {
                task_id: run.task_id,
            });
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn finish_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| StoreError::not_found("run", run.id))?;
        if stored.status.is_terminal() {
            return Err(StoreError::RunFinalized(run.id));
        }
        *stored = run.clone();
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.state.lock().await.runs.get(&id).cloned())
    }

    async fn list_runs(
        &self,
        task_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<RunRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<RunRecord> = state
            .runs
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.start_at.cmp(&a.start_at));
        Ok(Page::from_vec(runs, page))
    }

    async fn active_run(&self, task_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .find(|r| r.task_id == task_id && r.status == RunStatus::Running)
            .cloned())
    }

    async fn scheduled_run_since(
        &self,
        task_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.runs.values().any(|r| {
            r.task_id == task_id && r.trigger == RunTrigger::Schedule && r.start_at >= since
        }))
    }

    async fn fail_running_run(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        summary: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&id) {
            Some(run) if run.status == RunStatus::Running => {
                fail_in_place(run, now, summary);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn abandon_running_runs(
        &self,
        now: DateTime<Utc>,
        summary: &str,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for run in state.runs.values_mut() {
            if run.status == RunStatus::Running {
                fail_in_place(run, now, summary);
                count += 1;
            }
        }
        Ok(count)
    }
}

fn fail_in_place(run: &mut RunRecord, now: DateTime<Utc>, summary: &str) {
    run.status = RunStatus::Failed;
    run.end_at = Some(now);
    run.duration_ms = Some((now - run.start_at).num_milliseconds().max(0) as u64);
    run.error_summary = Some(summary.to_string());
}

#[async_trait]
impl VideoRepository for MemoryStore {
    async fn upsert_video(&self, task_id: Uuid, video: &VideoRecord) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.videos.get_mut(&video.bvid) {
            Some(stored) => {
                let mut linked = std::mem::take(&mut stored.source_task_ids);
                if !linked.contains(&task_id) {
                    linked.push(task_id);
                }
                let process_status = stored.process_status;
                let note = stored.note.take();
                *stored = video.clone();
                stored.source_task_ids = linked;
                stored.process_status = process_status;
                stored.note = note;
                Ok(false)
            }
            None => {
                let mut fresh = video.clone();
                fresh.source_task_ids = vec![task_id];
                state.videos.insert(fresh.bvid.clone(), fresh);
                Ok(true)
            }
        }
    }

    async fn get_video(&self, bvid: &str) -> Result<Option<VideoRecord>, StoreError> {
        Ok(self.state.lock().await.videos.get(bvid).cloned())
    }

    async fn list_videos(
        &self,
        filter: &VideoFilter,
        sort: VideoSort,
        page: PageRequest,
    ) -> Result<Page<VideoRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut videos: Vec<VideoRecord> = state
            .videos
            .values()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect();
        videos.sort_by(|a, b| descending(sort, a, b).then_with(|| a.bvid.cmp(&b.bvid)));
        Ok(Page::from_vec(videos, page))
    }

    async fn set_video_process_status(
        &self,
        bvid: &str,
        status: ProcessStatus,
    ) -> Result<VideoRecord, StoreError> {
        let mut state = self.state.lock().await;
        let video = state
            .videos
            .get_mut(bvid)
            .ok_or_else(|| StoreError::not_found("video", bvid))?;
        video.process_status = status;
        Ok(video.clone())
    }

    async fn set_video_note(
        &self,
        bvid: &str,
        note: Option<String>,
    ) -> Result<VideoRecord, StoreError> {
        let mut state = self.state.lock().await;
        let video = state
            .videos
            .get_mut(bvid)
            .ok_or_else(|| StoreError::not_found("video", bvid))?;
        video.note = note;
        Ok(video.clone())
    }

    async fn list_tags(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let tags: BTreeSet<String> = state
            .tasks
            .values()
            .flat_map(|t| t.tags.iter())
            .chain(state.videos.values().flat_map(|v| v.tags.iter()))
            .map(|tag| tag.trim())
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect();
        Ok(tags.into_iter().collect())
    }
}

fn descending(sort: VideoSort, a: &VideoRecord, b: &VideoRecord) -> Ordering {
    let order = match sort {
        VideoSort::Views => a.stats.views.cmp(&b.stats.views),
        VideoSort::Fav => a.stats.fav.cmp(&b.stats.fav),
        VideoSort::Coin => a.stats.coin.cmp(&b.stats.coin),
        VideoSort::Reply => a.stats.reply.cmp(&b.stats.reply),
        VideoSort::FavRate => a.rates.fav_rate.total_cmp(&b.rates.fav_rate),
        VideoSort::CoinRate => a.rates.coin_rate.total_cmp(&b.rates.coin_rate),
        VideoSort::ReplyRate => a.rates.reply_rate.total_cmp(&b.rates.reply_rate),
        VideoSort::FavFanRatio => a.rates.fav_fan_ratio.total_cmp(&b.rates.fav_fan_ratio),
        // `None < Some`, so unknown publish times trail.
        VideoSort::PublishTime => a.publish_time.cmp(&b.publish_time),
        VideoSort::FetchTime => a.fetch_time.cmp(&b.fetch_time),
    };
    order.reverse()
}

#[async_trait]
impl AlertRepository for MemoryStore {
    async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.state.lock().await.alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn list_alerts(
        &self,
        unread_only: bool,
        page: PageRequest,
    ) -> Result<Page<Alert>, StoreError> {
        let state = self.state.lock().await;
        let mut alerts: Vec<Alert> = state
            .alerts
            .values()
            .filter(|a| !unread_only || a.read_at.is_none())
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(Page::from_vec(alerts, page))
    }

    async fn mark_alert_read(&self, id: Uuid, now: DateTime<Utc>) -> Result<Alert, StoreError> {
        let mut state = self.state.lock().await;
        let alert = state
            .alerts
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("alert", id))?;
        alert.mark_read(now);
        Ok(alert.clone())
    }

    async fn mark_all_alerts_read(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .alerts
            .values_mut()
            .map(|a| a.mark_read(now))
            .filter(|changed| *changed)
            .count() as u64)
    }

    async fn unread_alert_count(&self) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.alerts.values().filter(|a| a.read_at.is_none()).count() as u64)
    }
}

#[async_trait]
impl TemplateRepository for MemoryStore {
    async fn insert_template(&self, template: &Template) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .templates
            .insert(template.id, template.clone());
        Ok(())
    }

    async fn update_template(&self, template: &Template) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .templates
            .get_mut(&template.id)
            .ok_or_else(|| StoreError::not_found("template", template.id))?;
        *stored = template.clone();
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<Template>, StoreError> {
        Ok(self.state.lock().await.templates.get(&id).cloned())
    }

    async fn list_templates(&self) -> Result<Vec<Template>, StoreError> {
        let state = self.state.lock().await;
        let mut templates: Vec<Template> = state.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(templates)
    }

    async fn delete_template(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.templates.remove(&id).is_some())
    }
}

#[async_trait]
impl SettingsRepository for MemoryStore {
    async fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        Ok(self.state.lock().await.settings)
    }

    async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        self.state.lock().await.settings = Some(*settings);
        Ok(())
    }
}
