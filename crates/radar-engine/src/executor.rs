use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use radar_core::{
    classify, ClassificationResult, DerivedRates, ErrorEntry, ErrorStage, RunCounts, RunRecord,
    RunStatus, RunTrigger, Settings, TagResult, Task, VideoItem, VideoRecord, VideoStats,
    MAX_ERROR_DETAIL,
};
use radar_source::{
    pages_for_limit, FetchedVideo, SearchQuery, SourceError, VideoSource, MAX_RESULTS_PER_KEYWORD,
};
use radar_storage::{Repository, StoreError, TokenBucket};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{AlertManager, EngineError, SettingsHandle};

pub const DEFAULT_DRY_RUN_LIMIT: u32 = 20;
const MAX_DRY_RUN_LIMIT: u32 = 100;

/// Preview of one classified video; nothing behind it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunSample {
    pub bvid: String,
    pub title: String,
    pub up_name: String,
    pub follower_count: u64,
    pub publish_time: Option<DateTime<Utc>>,
    pub stats: VideoStats,
    pub rates: DerivedRates,
    pub basic_hot: TagResult,
    pub low_fan_hot: TagResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunReport {
    pub task_id: Uuid,
    pub limit: u32,
    pub counts: RunCounts,
    pub samples: Vec<DryRunSample>,
    pub errors: Vec<ErrorEntry>,
}

/// Drives runs through `running -> success | failed`.
///
/// At most one run per task is active: an in-process claim rejects a second
/// trigger before anything is written, and the store's own uniqueness check
/// covers triggers arriving from another process.
pub struct RunExecutor {
    repo: Arc<dyn Repository>,
    source: Arc<dyn VideoSource>,
    settings: SettingsHandle,
    limiter: Arc<TokenBucket>,
    alerts: Arc<AlertManager>,
    active: Arc<StdMutex<HashSet<Uuid>>>,
}

struct ActiveClaim {
    active: Arc<StdMutex<HashSet<Uuid>>>,
    task_id: Uuid,
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task_id);
    }
}

/// Capped error list; entries past the cap are only counted.
#[derive(Default)]
struct ErrorLog {
    entries: Vec<ErrorEntry>,
    overflow: u32,
}

impl ErrorLog {
    fn push(&mut self, entry: ErrorEntry) {
        if self.entries.len() < MAX_ERROR_DETAIL {
            self.entries.push(entry);
        } else {
            self.overflow += 1;
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.overflow == 0
    }
}

enum Abort {
    Engine(EngineError),
    AllSearchesFailed(usize),
    AllItemsFailed(u32),
}

impl Abort {
    fn summary(&self) -> String {
        match self {
            Self::Engine(err) => err.to_string(),
            Self::AllSearchesFailed(n) => format!("all {n} keyword search(es) failed"),
            Self::AllItemsFailed(n) => format!("all {n} item(s) failed after retries"),
        }
    }
}

impl From<SourceError> for Abort {
    fn from(err: SourceError) -> Self {
        Self::Engine(EngineError::Fetch(err))
    }
}

enum ItemFailure {
    Source { stage: ErrorStage, error: SourceError },
    Unclassifiable(EngineError),
    Persist(StoreError),
}

impl ItemFailure {
    fn retryable(&self) -> bool {
        !matches!(self, Self::Unclassifiable(_))
    }

    fn entry(&self, bvid: &str, attempts: u32) -> ErrorEntry {
        let entry = match self {
            Self::Source { stage, error } => ErrorEntry::new(*stage, error.to_string()),
            Self::Unclassifiable(error) => ErrorEntry::new(ErrorStage::Classify, error.to_string()),
            Self::Persist(error) => ErrorEntry::new(ErrorStage::Persist, error.to_string()),
        };
        entry
            .with("bvid", bvid)
            .with("attempts", attempts.to_string())
    }
}

struct Classified {
    video: FetchedVideo,
    follower_count: u64,
    result: ClassificationResult,
}

impl Classified {
    fn sample(self) -> DryRunSample {
        DryRunSample {
            bvid: self.video.bvid,
            title: self.video.title,
            up_name: self.video.up_name,
            follower_count: self.follower_count,
            publish_time: self.video.publish_time,
            stats: self.video.stats,
            rates: self.result.rates,
            basic_hot: self.result.basic_hot,
            low_fan_hot: self.result.low_fan_hot,
        }
    }
}

impl RunExecutor {
    pub fn new(
        repo: Arc<dyn Repository>,
        source: Arc<dyn VideoSource>,
        settings: SettingsHandle,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            repo,
            source,
            limiter: settings.limiter(),
            settings,
            alerts,
            active: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Starts a run in the background and returns its `running` record.
    pub async fn start(
        self: &Arc<Self>,
        task_id: Uuid,
        trigger: RunTrigger,
    ) -> Result<RunRecord, EngineError> {
        let task = self.load_task(task_id).await?;
        self.spawn(task, trigger, None).await
    }

    /// Re-executes the task behind `run_id` with its current configuration.
    /// The original record is left untouched.
    pub async fn retry(self: &Arc<Self>, run_id: Uuid) -> Result<RunRecord, EngineError> {
        let original = self.load_run(run_id).await?;
        let task = self.load_task(original.task_id).await?;
        self.spawn(task, RunTrigger::Retry, Some(original.id)).await
    }

    pub async fn run_to_completion(
        &self,
        task_id: Uuid,
        trigger: RunTrigger,
    ) -> Result<RunRecord, EngineError> {
        let task = self.load_task(task_id).await?;
        let (run, _claim) = self.begin(&task, trigger, None).await?;
        self.execute(task, run).await
    }

    pub async fn retry_to_completion(&self, run_id: Uuid) -> Result<RunRecord, EngineError> {
        let original = self.load_run(run_id).await?;
        let task = self.load_task(original.task_id).await?;
        let (run, _claim) = self.begin(&task, RunTrigger::Retry, Some(original.id)).await?;
        self.execute(task, run).await
    }

    /// Fetches and classifies up to `limit` videos without writing anything.
    pub async fn dry_run(
        &self,
        task_id: Uuid,
        limit: Option<u32>,
    ) -> Result<DryRunReport, EngineError> {
        let task = self.load_task(task_id).await?;
        let limit = limit
            .unwrap_or(DEFAULT_DRY_RUN_LIMIT)
            .clamp(1, MAX_DRY_RUN_LIMIT);
        let settings = self.settings.current();
        let mut counts = RunCounts::default();
        let mut log = ErrorLog::default();

        let outcome = async {
            let mut candidates = self
                .gather(&task, &settings, &mut counts, &mut log, Some(limit as usize))
                .await?;
            candidates.truncate(limit as usize);
            self.process(&task, &settings, candidates, 0, false, &mut counts, &mut log)
                .await
        }
        .instrument(info_span!("dry_run", task_id = %task.id, limit))
        .await;

        let samples = match outcome {
            Ok(classified) => classified.into_iter().map(Classified::sample).collect(),
            Err(Abort::Engine(err)) => return Err(err),
            Err(Abort::AllSearchesFailed(_) | Abort::AllItemsFailed(_)) => Vec::new(),
        };
        Ok(DryRunReport {
            task_id: task.id,
            limit,
            counts,
            samples,
            errors: log.entries,
        })
    }

    async fn load_task(&self, task_id: Uuid) -> Result<Task, EngineError> {
        self.repo
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))
    }

    async fn load_run(&self, run_id: Uuid) -> Result<RunRecord, EngineError> {
        self.repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }

    async fn spawn(
        self: &Arc<Self>,
        task: Task,
        trigger: RunTrigger,
        retry_of: Option<Uuid>,
    ) -> Result<RunRecord, EngineError> {
        let (run, claim) = self.begin(&task, trigger, retry_of).await?;
        let run_id = run.id;
        let this = Arc::clone(self);
        let started = run.clone();
        // The claim is held until the record is terminal, even if the run panics.
        tokio::spawn(async move {
            let worker = Arc::clone(&this);
            let joined = tokio::spawn(async move { worker.execute(task, run).await }).await;
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => error!(%run_id, error = %err, "run could not be finalized"),
                Err(err) => {
                    error!(%run_id, error = %err, "run task aborted");
                    this.fail_stuck_run(run_id, &format!("run aborted: {err}"))
                        .await;
                }
            }
            drop(claim);
        });
        Ok(started)
    }

    /// Last-resort write so a run that cannot finish normally does not keep
    /// its task blocked.
    async fn fail_stuck_run(&self, run_id: Uuid, summary: &str) {
        match self.repo.fail_running_run(run_id, Utc::now(), summary).await {
            Ok(true) => warn!(%run_id, summary, "run marked failed"),
            Ok(false) => {}
            Err(err) => error!(
                %run_id,
                error = %err,
                "run left running until orphan recovery"
            ),
        }
    }

    fn claim(&self, task_id: Uuid) -> Option<ActiveClaim> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(task_id) {
            return None;
        }
        Some(ActiveClaim {
            active: Arc::clone(&self.active),
            task_id,
        })
    }

    async fn begin(
        &self,
        task: &Task,
        trigger: RunTrigger,
        retry_of: Option<Uuid>,
    ) -> Result<(RunRecord, ActiveClaim), EngineError> {
        let claim = self
            .claim(task.id)
            .ok_or(EngineError::ConcurrentRunConflict { task_id: task.id })?;
        let run = RunRecord::start(task.id, trigger, retry_of, Utc::now());
        self.repo.insert_run(&run).await?;
        info!(run_id = %run.id, task_id = %task.id, trigger = trigger.as_str(), "run started");
        Ok((run, claim))
    }

    async fn execute(&self, task: Task, mut run: RunRecord) -> Result<RunRecord, EngineError> {
        let span = info_span!(
            "run",
            run_id = %run.id,
            task_id = %task.id,
            trigger = run.trigger.as_str()
        );
        async move {
            let settings = self.settings.current();
            let started = Instant::now();
            let mut log = ErrorLog::default();
            let mut counts = RunCounts::default();

            let outcome = async {
                let candidates = self
                    .gather(&task, &settings, &mut counts, &mut log, None)
                    .await?;
                self.process(
                    &task,
                    &settings,
                    candidates,
                    settings.retry_times,
                    true,
                    &mut counts,
                    &mut log,
                )
                .await
                .map(|_| ())
            }
            .await;

            run.counts = counts;
            run.end_at = Some(Utc::now());
            run.duration_ms = Some(started.elapsed().as_millis() as u64);
            match outcome {
                Ok(()) => {
                    run.status = RunStatus::Success;
                    run.error_summary = partial_summary(&counts, &log);
                }
                Err(abort) => {
                    let summary = abort.summary();
                    log.push(ErrorEntry::new(ErrorStage::Run, summary.clone()));
                    run.status = RunStatus::Failed;
                    run.error_summary = Some(summary);
                }
            }
            if log.overflow > 0 {
                debug!(overflow = log.overflow, "error detail truncated");
            }
            run.error_detail = log.entries;

            if let Err(err) = self.repo.finish_run(&run).await {
                self.fail_stuck_run(run.id, &format!("run could not be finalized: {err}"))
                    .await;
                return Err(err.into());
            }
            match run.status {
                RunStatus::Success => info!(
                    fetched = counts.fetched,
                    inserted = counts.inserted,
                    basic_hot = counts.basic_hot,
                    low_fan_hot = counts.low_fan_hot,
                    failed_items = counts.failed_items,
                    duration_ms = run.duration_ms,
                    "run succeeded"
                ),
                _ => warn!(
                    summary = run.error_summary.as_deref().unwrap_or_default(),
                    "run failed"
                ),
            }

            if let Err(err) = self.alerts.record_outcome(&task, &run, &settings).await {
                error!(error = %err, "failure streak not updated");
            }
            Ok(run)
        }
        .instrument(span)
        .await
    }

    /// Takes a limiter token, then bounds the call by the configured timeout.
    async fn call<T, F>(&self, settings: &Settings, what: &str, fut: F) -> Result<T, SourceError>
    where
        F: Future<Output = Result<T, SourceError>>,
    {
        self.limiter.take().await;
        match tokio::time::timeout(Duration::from_secs(settings.timeout_seconds), fut).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(format!(
                "{what} exceeded {}s",
                settings.timeout_seconds
            ))),
        }
    }

    /// Searches every keyword, then applies the age cutoff, exclude words and
    /// bvid dedupe. `cap` stops pagination once enough candidates are known.
    async fn gather(
        &self,
        task: &Task,
        settings: &Settings,
        counts: &mut RunCounts,
        log: &mut ErrorLog,
        cap: Option<usize>,
    ) -> Result<Vec<FetchedVideo>, Abort> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(task.scope.days_limit));
        let per_keyword = task.scope.fetch_limit.min(MAX_RESULTS_PER_KEYWORD) as usize;
        let exclude: Vec<String> = task.exclude_words.iter().map(|w| w.to_lowercase()).collect();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut searched = 0usize;

        for keyword in &task.keywords {
            if cap.is_some_and(|cap| candidates.len() >= cap) {
                break;
            }
            let query = SearchQuery::for_keyword(keyword, &task.scope);
            let mut hits = Vec::new();
            let mut keyword_failed = false;
            for page in 1..=pages_for_limit(task.scope.fetch_limit) {
                match self
                    .call(settings, "search", self.source.search_page(&query, page))
                    .await
                {
                    Ok(batch) if batch.is_empty() => break,
                    Ok(batch) => hits.extend(batch),
                    Err(err) if err.is_fatal() => return Err(err.into()),
                    Err(err) => {
                        warn!(keyword = %keyword, page, error = %err, "search page failed");
                        log.push(
                            ErrorEntry::new(ErrorStage::Search, err.to_string())
                                .with("keyword", keyword.as_str())
                                .with("page", page.to_string()),
                        );
                        keyword_failed = page == 1;
                        break;
                    }
                }
                if hits.len() >= per_keyword {
                    break;
                }
            }
            if !keyword_failed {
                searched += 1;
            }
            hits.truncate(per_keyword);

            for hit in hits {
                if hit.publish_time.is_some_and(|at| at < cutoff) {
                    continue;
                }
                counts.fetched += 1;
                let title = hit.title.to_lowercase();
                if exclude.iter().any(|word| title.contains(word.as_str())) {
                    counts.excluded += 1;
                    continue;
                }
                if hit.bvid.trim().is_empty() {
                    counts.failed_items += 1;
                    log.push(
                        ErrorEntry::new(ErrorStage::Classify, "search hit has no bvid")
                            .with("keyword", keyword.as_str())
                            .with("title", hit.title.as_str()),
                    );
                    continue;
                }
                if !seen.insert(hit.bvid.clone()) {
                    counts.deduped += 1;
                    continue;
                }
                candidates.push(hit);
            }
        }

        if searched == 0 && !task.keywords.is_empty() {
            return Err(Abort::AllSearchesFailed(task.keywords.len()));
        }
        debug!(candidates = candidates.len(), "search finished");
        Ok(candidates)
    }

    /// Detail, classify and (optionally) persist each candidate, re-attempting
    /// retryable failures for up to `retry_rounds` extra passes.
    #[allow(clippy::too_many_arguments)]
    async fn process(
        &self,
        task: &Task,
        settings: &Settings,
        candidates: Vec<FetchedVideo>,
        retry_rounds: u32,
        persist: bool,
        counts: &mut RunCounts,
        log: &mut ErrorLog,
    ) -> Result<Vec<Classified>, Abort> {
        let total = candidates.len() as u32;
        let mut done = Vec::with_capacity(candidates.len());
        let mut pending = candidates;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut retry = Vec::new();
            for hit in pending {
                match self.process_item(task, settings, &hit, persist).await {
                    Ok((classified, inserted)) => {
                        if inserted {
                            counts.inserted += 1;
                        }
                        if classified.result.basic_hot.is_hit {
                            counts.basic_hot += 1;
                        }
                        if classified.result.low_fan_hot.is_hit {
                            counts.low_fan_hot += 1;
                        }
                        done.push(classified);
                    }
                    Err(ItemFailure::Source { error, .. }) if error.is_fatal() => {
                        return Err(error.into());
                    }
                    Err(failure) if failure.retryable() && attempt <= retry_rounds => {
                        debug!(bvid = %hit.bvid, attempt, "item failed; will retry");
                        retry.push(hit);
                    }
                    Err(failure) => {
                        counts.failed_items += 1;
                        log.push(failure.entry(&hit.bvid, attempt));
                    }
                }
            }
            if retry.is_empty() {
                break;
            }
            pending = retry;
        }

        if total > 0 && done.is_empty() {
            return Err(Abort::AllItemsFailed(total));
        }
        Ok(done)
    }

    async fn process_item(
        &self,
        task: &Task,
        settings: &Settings,
        hit: &FetchedVideo,
        persist: bool,
    ) -> Result<(Classified, bool), ItemFailure> {
        let detail = self
            .call(settings, "detail", self.source.video_detail(&hit.bvid))
            .await
            .map_err(|error| ItemFailure::Source {
                stage: ErrorStage::Detail,
                error,
            })?
            .ok_or_else(|| unclassifiable(&hit.bvid, "video is no longer available upstream"))?;
        let video = merge_detail(hit, detail);

        let follower_count = match video.follower_count {
            Some(count) => count,
            None if video.up_id.is_empty() => {
                return Err(unclassifiable(
                    &video.bvid,
                    "uploader id missing; follower count unknown",
                ))
            }
            None => self
                .call(settings, "follower_count", self.source.follower_count(&video.up_id))
                .await
                .map_err(|error| ItemFailure::Source {
                    stage: ErrorStage::Detail,
                    error,
                })?,
        };

        let item = VideoItem {
            stats: video.stats,
            follower_count,
        };
        let result = classify(&item, &task.rules);

        let mut inserted = false;
        if persist {
            let existing = self
                .repo
                .get_video(&video.bvid)
                .await
                .map_err(ItemFailure::Persist)?;
            let record = video_record(task, &video, follower_count, &result, existing);
            inserted = self
                .repo
                .upsert_video(task.id, &record)
                .await
                .map_err(ItemFailure::Persist)?;
        }

        Ok((
            Classified {
                video,
                follower_count,
                result,
            },
            inserted,
        ))
    }
}

fn unclassifiable(bvid: &str, message: &str) -> ItemFailure {
    ItemFailure::Unclassifiable(EngineError::ItemClassification {
        bvid: bvid.to_string(),
        message: message.to_string(),
    })
}

/// Detail values win; search values fill what the detail call left empty.
fn merge_detail(hit: &FetchedVideo, detail: FetchedVideo) -> FetchedVideo {
    FetchedVideo {
        bvid: hit.bvid.clone(),
        title: if detail.title.is_empty() {
            hit.title.clone()
        } else {
            detail.title
        },
        up_id: if detail.up_id.is_empty() {
            hit.up_id.clone()
        } else {
            detail.up_id
        },
        up_name: if detail.up_name.is_empty() {
            hit.up_name.clone()
        } else {
            detail.up_name
        },
        publish_time: detail.publish_time.or(hit.publish_time),
        cover_url: detail.cover_url.or_else(|| hit.cover_url.clone()),
        stats: detail.stats,
        follower_count: detail.follower_count.or(hit.follower_count),
    }
}

fn video_record(
    task: &Task,
    video: &FetchedVideo,
    follower_count: u64,
    result: &ClassificationResult,
    existing: Option<VideoRecord>,
) -> VideoRecord {
    let (mut tags, process_status, note) = match existing {
        Some(v) => (v.tags, v.process_status, v.note),
        None => Default::default(),
    };
    for tag in &task.tags {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    VideoRecord {
        bvid: video.bvid.clone(),
        title: video.title.clone(),
        up_id: video.up_id.clone(),
        up_name: video.up_name.clone(),
        follower_count,
        publish_time: video.publish_time,
        cover_url: video.cover_url.clone(),
        stats: video.stats,
        rates: result.rates,
        basic_hot: result.basic_hot.clone(),
        low_fan_hot: result.low_fan_hot.clone(),
        tags,
        source_task_ids: vec![task.id],
        fetch_time: Utc::now(),
        process_status,
        note,
    }
}

fn partial_summary(counts: &RunCounts, log: &ErrorLog) -> Option<String> {
    if log.is_empty() {
        return None;
    }
    let mut summary = if counts.failed_items > 0 {
        format!("{} item(s) failed; see error detail", counts.failed_items)
    } else {
        format!("{} non-fatal error(s) recorded", log.entries.len())
    };
    if log.overflow > 0 {
        summary.push_str(&format!(" ({} more not stored)", log.overflow));
    }
    Some(summary)
}
