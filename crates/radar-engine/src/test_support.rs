//! Scripted source and fixtures shared by the engine's unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{
    Alert, Page, PageRequest, ProcessStatus, RunRecord, Settings, Task, TaskDraft, Template,
    VideoRecord, VideoSort, VideoStats,
};
use radar_source::{FetchedVideo, SearchQuery, SourceError, VideoSource, SEARCH_PAGE_SIZE};
use radar_storage::{
    AlertRepository, MemoryStore, Repository, RunRepository, SettingsRepository, StoreError,
    TaskFilter, TaskRepository, TemplateRepository, VideoFilter, VideoRepository,
};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::{AlertManager, RunExecutor, SettingsHandle};

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Timeout,
    Unreachable,
    RateLimited,
    Status(u16),
}

impl Fault {
    fn error(self, what: &str) -> SourceError {
        match self {
            Self::Timeout => SourceError::Timeout(what.to_string()),
            Self::Unreachable => SourceError::Unreachable(what.to_string()),
            Self::RateLimited => SourceError::RateLimited(what.to_string()),
            Self::Status(status) => SourceError::Http {
                status,
                url: what.to_string(),
            },
        }
    }
}

#[derive(Default)]
pub struct ScriptedSource {
    hits: Mutex<HashMap<String, Vec<FetchedVideo>>>,
    search_faults: Mutex<HashMap<String, Fault>>,
    detail_faults: Mutex<HashMap<String, VecDeque<Fault>>>,
    gone: Mutex<HashSet<String>>,
    slow: Mutex<HashMap<String, Duration>>,
    crash: Mutex<HashSet<String>>,
    gate: Option<Arc<Semaphore>>,
    pub search_calls: AtomicUsize,
    pub detail_calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detail calls block until the returned semaphore gets permits.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let source = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (source, gate)
    }

    pub fn with_hits(self, keyword: &str, videos: Vec<FetchedVideo>) -> Self {
        self.hits
            .lock()
            .expect("hits lock")
            .insert(keyword.to_string(), videos);
        self
    }

    pub fn fail_search(self, keyword: &str, fault: Fault) -> Self {
        self.search_faults
            .lock()
            .expect("fault lock")
            .insert(keyword.to_string(), fault);
        self
    }

    /// The next `faults.len()` detail calls for `bvid` fail in order.
    pub fn fail_detail(self, bvid: &str, faults: &[Fault]) -> Self {
        self.detail_faults
            .lock()
            .expect("fault lock")
            .insert(bvid.to_string(), faults.iter().copied().collect());
        self
    }

    pub fn vanish(self, bvid: &str) -> Self {
        self.gone.lock().expect("gone lock").insert(bvid.to_string());
        self
    }

    /// Detail calls for `bvid` take `delay` before answering.
    pub fn slow_detail(self, bvid: &str, delay: Duration) -> Self {
        self.slow.lock().expect("slow lock").insert(bvid.to_string(), delay);
        self
    }

    /// The next detail call for `bvid` panics.
    pub fn crash_detail(self, bvid: &str) -> Self {
        self.crash.lock().expect("crash lock").insert(bvid.to_string());
        self
    }

    fn find(&self, bvid: &str) -> Option<FetchedVideo> {
        self.hits
            .lock()
            .expect("hits lock")
            .values()
            .flatten()
            .find(|v| v.bvid == bvid)
            .cloned()
    }
}

#[async_trait]
impl VideoSource for ScriptedSource {
    fn source_id(&self) -> &'static str {
        "scripted"
    }

    async fn search_page(
        &self,
        query: &SearchQuery,
        page: u32,
    ) -> Result<Vec<FetchedVideo>, SourceError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.search_faults.lock().expect("fault lock").get(&query.keyword) {
            return Err(fault.error(&query.keyword));
        }
        let hits = self.hits.lock().expect("hits lock");
        let all = hits.get(&query.keyword).cloned().unwrap_or_default();
        let skip = (page.max(1) - 1) as usize * SEARCH_PAGE_SIZE as usize;
        Ok(all
            .into_iter()
            .skip(skip)
            .take(SEARCH_PAGE_SIZE as usize)
            .collect())
    }

    async fn video_detail(&self, bvid: &str) -> Result<Option<FetchedVideo>, SourceError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.crash.lock().expect("crash lock").remove(bvid) {
            panic!("detail decoder crashed on {bvid}");
        }
        let delay = self.slow.lock().expect("slow lock").get(bvid).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fault = self
            .detail_faults
            .lock()
            .expect("fault lock")
            .get_mut(bvid)
            .and_then(VecDeque::pop_front);
        if let Some(fault) = fault {
            return Err(fault.error(bvid));
        }
        if self.gone.lock().expect("gone lock").contains(bvid) {
            return Ok(None);
        }
        Ok(self.find(bvid))
    }

    async fn follower_count(&self, up_id: &str) -> Result<u64, SourceError> {
        Ok(self
            .hits
            .lock()
            .expect("hits lock")
            .values()
            .flatten()
            .find(|v| v.up_id == up_id)
            .and_then(|v| v.follower_count)
            .unwrap_or(0))
    }
}

pub fn video(bvid: &str, title: &str, stats: VideoStats, followers: u64) -> FetchedVideo {
    FetchedVideo {
        bvid: bvid.to_string(),
        title: title.to_string(),
        up_id: format!("up-{bvid}"),
        up_name: "uploader".to_string(),
        publish_time: Some(Utc::now()),
        cover_url: None,
        stats,
        follower_count: Some(followers),
    }
}

pub fn stats(views: u64, fav: u64, coin: u64, reply: u64) -> VideoStats {
    VideoStats {
        views,
        fav,
        coin,
        reply,
        ..VideoStats::default()
    }
}

pub fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

pub fn draft(keywords: &[&str]) -> TaskDraft {
    TaskDraft {
        name: "kitchen radar".to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        tags: vec!["appliance".to_string()],
        ..TaskDraft::default()
    }
}

pub async fn stored_task(repo: &Arc<MemoryStore>) -> Task {
    insert_task(repo, draft(&["air fryer"])).await
}

pub async fn insert_task(repo: &Arc<MemoryStore>, draft: TaskDraft) -> Task {
    let task = draft
        .normalized()
        .expect("valid draft")
        .into_task(Utc::now());
    repo.insert_task(&task).await.expect("insert task");
    task
}

pub fn fast_settings() -> Settings {
    Settings {
        rate_limit_per_sec: 1_000,
        retry_times: 2,
        timeout_seconds: 5,
        alert_consecutive_failures: 3,
    }
}

pub fn executor(repo: &Arc<MemoryStore>, source: Arc<dyn VideoSource>) -> Arc<RunExecutor> {
    executor_with(repo, source, fast_settings())
}

pub fn executor_with(
    repo: &Arc<MemoryStore>,
    source: Arc<dyn VideoSource>,
    settings: Settings,
) -> Arc<RunExecutor> {
    executor_over(repo.clone(), source, settings)
}

pub fn executor_over(
    repo: Arc<dyn Repository>,
    source: Arc<dyn VideoSource>,
    settings: Settings,
) -> Arc<RunExecutor> {
    let settings = SettingsHandle::with_settings(Arc::clone(&repo), settings);
    let alerts = Arc::new(AlertManager::new(Arc::clone(&repo)));
    Arc::new(RunExecutor::new(repo, source, settings, alerts))
}

/// Polls until a background run reaches a terminal status, then gives the
/// run task a moment to record its outcome and release its claim.
pub async fn wait_for_terminal(repo: &Arc<MemoryStore>, run_id: uuid::Uuid) -> radar_core::RunRecord {
    use radar_storage::RunRepository;
    for _ in 0..400 {
        let run = repo.get_run(run_id).await.expect("get run").expect("run exists");
        if run.status.is_terminal() {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            return run;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("run {run_id} never finished");
}

/// Memory store whose `finish_run` rejects writes while `reject_finish` is set.
pub struct FlakyFinish {
    pub inner: Arc<MemoryStore>,
    pub reject_finish: AtomicBool,
}

impl FlakyFinish {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            reject_finish: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl TaskRepository for FlakyFinish {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        self.inner.insert_task(task).await
    }
    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        self.inner.update_task(task).await
    }
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        self.inner.get_task(id).await
    }
    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: PageRequest,
    ) -> Result<Page<Task>, StoreError> {
        self.inner.list_tasks(filter, page).await
    }
    async fn enabled_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.inner.enabled_tasks().await
    }
    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.delete_task(id).await
    }
    async fn bump_failure_streak(&self, id: Uuid) -> Result<(u32, u32), StoreError> {
        self.inner.bump_failure_streak(id).await
    }
    async fn reset_failure_streak(&self, id: Uuid) -> Result<u32, StoreError> {
        self.inner.reset_failure_streak(id).await
    }
}

#[async_trait]
impl RunRepository for FlakyFinish {
    async fn insert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.inner.insert_run(run).await
    }
    async fn finish_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        if self.reject_finish.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt {
                column: "runs",
                message: "write rejected".to_string(),
            });
        }
        self.inner.finish_run(run).await
    }
    async fn get_run(&self, id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        self.inner.get_run(id).await
    }
    async fn list_runs(
        &self,
        task_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<RunRecord>, StoreError> {
        self.inner.list_runs(task_id, page).await
    }
    async fn active_run(&self, task_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        self.inner.active_run(task_id).await
    }
    async fn scheduled_run_since(
        &self,
        task_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.scheduled_run_since(task_id, since).await
    }
    async fn fail_running_run(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        summary: &str,
    ) -> Result<bool, StoreError> {
        self.inner.fail_running_run(id, now, summary).await
    }
    async fn abandon_running_runs(
        &self,
        now: DateTime<Utc>,
        summary: &str,
    ) -> Result<u64, StoreError> {
        self.inner.abandon_running_runs(now, summary).await
    }
}

#[async_trait]
impl VideoRepository for FlakyFinish {
    async fn upsert_video(&self, task_id: Uuid, video: &VideoRecord) -> Result<bool, StoreError> {
        self.inner.upsert_video(task_id, video).await
    }
    async fn get_video(&self, bvid: &str) -> Result<Option<VideoRecord>, StoreError> {
        self.inner.get_video(bvid).await
    }
    async fn list_videos(
        &self,
        filter: &VideoFilter,
        sort: VideoSort,
        page: PageRequest,
    ) -> Result<Page<VideoRecord>, StoreError> {
        self.inner.list_videos(filter, sort, page).await
    }
    async fn set_video_process_status(
        &self,
        bvid: &str,
        status: ProcessStatus,
    ) -> Result<VideoRecord, StoreError> {
        self.inner.set_video_process_status(bvid, status).await
    }
    async fn set_video_note(
        &self,
        bvid: &str,
        note: Option<String>,
    ) -> Result<VideoRecord, StoreError> {
        self.inner.set_video_note(bvid, note).await
    }
    async fn list_tags(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_tags().await
    }
}

#[async_trait]
impl AlertRepository for FlakyFinish {
    async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.inner.insert_alert(alert).await
    }
    async fn list_alerts(
        &self,
        unread_only: bool,
        page: PageRequest,
    ) -> Result<Page<Alert>, StoreError> {
        self.inner.list_alerts(unread_only, page).await
    }
    async fn mark_alert_read(&self, id: Uuid, now: DateTime<Utc>) -> Result<Alert, StoreError> {
        self.inner.mark_alert_read(id, now).await
    }
    async fn mark_all_alerts_read(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.mark_all_alerts_read(now).await
    }
    async fn unread_alert_count(&self) -> Result<u64, StoreError> {
        self.inner.unread_alert_count().await
    }
}

#[async_trait]
impl TemplateRepository for FlakyFinish {
    async fn insert_template(&self, template: &Template) -> Result<(), StoreError> {
        self.inner.insert_template(template).await
    }
    async fn update_template(&self, template: &Template) -> Result<(), StoreError> {
        self.inner.update_template(template).await
    }
    async fn get_template(&self, id: Uuid) -> Result<Option<Template>, StoreError> {
        self.inner.get_template(id).await
    }
    async fn list_templates(&self) -> Result<Vec<Template>, StoreError> {
        self.inner.list_templates().await
    }
    async fn delete_template(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.delete_template(id).await
    }
}

#[async_trait]
impl SettingsRepository for FlakyFinish {
    async fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        self.inner.load_settings().await
    }
    async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        self.inner.save_settings(settings).await
    }
}
