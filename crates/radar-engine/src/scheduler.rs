use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use anyhow::Context;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use radar_core::{RunTrigger, Task};
use radar_storage::Repository;
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{EngineError, RunExecutor};

/// Default tick: second zero of every minute.
pub const DEFAULT_TICK_CRON: &str = "0 * * * * *";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub started: Vec<Uuid>,
    pub already_fired: usize,
    pub conflicts: usize,
    pub errors: usize,
}

/// Fires each enabled task once per local day at its `HH:MM`.
pub struct TaskScheduler {
    repo: Arc<dyn Repository>,
    executor: Arc<RunExecutor>,
    default_tz: Tz,
    claims: StdMutex<HashSet<(Uuid, NaiveDate)>>,
}

impl TaskScheduler {
    pub fn new(repo: Arc<dyn Repository>, executor: Arc<RunExecutor>, default_tz: Tz) -> Self {
        Self {
            repo,
            executor,
            default_tz,
            claims: StdMutex::new(HashSet::new()),
        }
    }

    /// One scheduling decision pass at `now`. Safe to call repeatedly within
    /// the same minute; a task fires at most once per local calendar day.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let mut report = TickReport::default();
        for task in self.repo.enabled_tasks().await? {
            let Some((tz, local_date)) = self.due_date(&task, now) else {
                continue;
            };
            report.due += 1;

            if !self.claim(task.id, local_date) {
                report.already_fired += 1;
                continue;
            }
            let since = local_midnight(tz, local_date).unwrap_or(now - Days::new(1));
            if self.repo.scheduled_run_since(task.id, since).await? {
                debug!(task_id = %task.id, %local_date, "scheduled run already recorded today");
                report.already_fired += 1;
                continue;
            }

            match self.executor.start(task.id, RunTrigger::Schedule).await {
                Ok(run) => {
                    info!(task_id = %task.id, run_id = %run.id, %local_date, "scheduled run fired");
                    report.started.push(run.id);
                }
                Err(EngineError::ConcurrentRunConflict { .. }) => {
                    warn!(task_id = %task.id, "scheduled run skipped; task already running");
                    report.conflicts += 1;
                }
                Err(err) => {
                    error!(task_id = %task.id, error = %err, "scheduled run could not start");
                    self.release(task.id, local_date);
                    report.errors += 1;
                }
            }
        }
        self.prune(now);
        Ok(report)
    }

    /// Builds the cron job that calls [`tick`](Self::tick). The caller starts it.
    pub async fn cron(self: &Arc<Self>, expression: &str) -> anyhow::Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let this = Arc::clone(self);
        let job = Job::new_async(expression, move |_uuid, _l| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                match this.tick(Utc::now()).await {
                    Ok(report) if report.due > 0 => {
                        info!(
                            due = report.due,
                            started = report.started.len(),
                            conflicts = report.conflicts,
                            errors = report.errors,
                            "scheduler tick"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "scheduler tick failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {expression}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }

    /// `Some((tz, local date))` when `now` falls in the task's scheduled minute.
    fn due_date(&self, task: &Task, now: DateTime<Utc>) -> Option<(Tz, NaiveDate)> {
        let schedule = &task.schedule;
        let (tz, at) = match (schedule.resolve_tz(self.default_tz), schedule.daily_time()) {
            (Ok(tz), Ok(at)) => (tz, at),
            (Err(err), _) | (_, Err(err)) => {
                warn!(task_id = %task.id, error = %err, "task has an unusable schedule");
                return None;
            }
        };
        let local = now.with_timezone(&tz);
        (local.hour() == at.hour() && local.minute() == at.minute())
            .then(|| (tz, local.date_naive()))
    }

    fn claim(&self, task_id: Uuid, date: NaiveDate) -> bool {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((task_id, date))
    }

    fn release(&self, task_id: Uuid, date: NaiveDate) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(task_id, date));
    }

    /// Claims older than yesterday (UTC) can no longer match.
    fn prune(&self, now: DateTime<Utc>) {
        let Some(horizon) = now.date_naive().checked_sub_days(Days::new(2)) else {
            return;
        };
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(_, date)| *date >= horizon);
    }
}

fn local_midnight(tz: Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&date.and_time(NaiveTime::MIN))
        .earliest()
        .map(|at| at.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{draft, executor, insert_task, store, wait_for_terminal, ScriptedSource};
    use radar_core::{Schedule, TaskStatus};
    use radar_storage::{MemoryStore, RunRepository, TaskRepository};

    fn today_at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc::now()
            .date_naive()
            .and_hms_opt(hour, minute, 0)
            .expect("valid time")
            .and_utc()
    }

    async fn task_at(repo: &Arc<MemoryStore>, time: &str, timezone: Option<&str>) -> Task {
        let mut d = draft(&["air fryer"]);
        d.schedule = Schedule {
            time: time.to_string(),
            timezone: timezone.map(str::to_string),
            ..Schedule::default()
        };
        insert_task(repo, d).await
    }

    fn scheduler(repo: &Arc<MemoryStore>) -> (TaskScheduler, Arc<RunExecutor>) {
        let exec = executor(repo, Arc::new(ScriptedSource::new()));
        (
            TaskScheduler::new(repo.clone(), Arc::clone(&exec), Tz::UTC),
            exec,
        )
    }

    #[tokio::test]
    async fn fires_once_per_day_across_repeated_ticks() {
        let repo = store();
        let task = task_at(&repo, "09:00", None).await;
        let (sched, exec) = scheduler(&repo);

        let first = sched.tick(today_at(9, 0)).await.expect("tick");
        assert_eq!(first.started.len(), 1);
        let again = sched.tick(today_at(9, 0)).await.expect("tick");
        assert!(again.started.is_empty());
        assert_eq!(again.already_fired, 1);
        assert!(sched.tick(today_at(9, 1)).await.expect("tick").started.is_empty());

        wait_for_terminal(&repo, first.started[0]).await;

        // A fresh scheduler (restart) still sees today's scheduled run.
        let restarted = TaskScheduler::new(repo.clone(), Arc::clone(&exec), Tz::UTC);
        let after_restart = restarted.tick(today_at(9, 0)).await.expect("tick");
        assert!(after_restart.started.is_empty());
        assert_eq!(after_restart.already_fired, 1);

        let tomorrow = today_at(9, 0) + Days::new(1);
        let next_day = sched.tick(tomorrow).await.expect("tick");
        assert_eq!(next_day.started.len(), 1);
        wait_for_terminal(&repo, next_day.started[0]).await;

        let runs = repo.list_runs(task.id, Default::default()).await.expect("runs");
        assert_eq!(runs.total, 2);
        assert!(runs.items.iter().all(|r| r.trigger == RunTrigger::Schedule));
    }

    #[tokio::test]
    async fn schedule_time_is_task_local() {
        let repo = store();
        task_at(&repo, "09:00", Some("Asia/Shanghai")).await;
        let (sched, _exec) = scheduler(&repo);

        assert_eq!(sched.tick(today_at(9, 0)).await.expect("tick").due, 0);
        let report = sched.tick(today_at(1, 0)).await.expect("tick");
        assert_eq!(report.due, 1);
        assert_eq!(report.started.len(), 1);
        wait_for_terminal(&repo, report.started[0]).await;
    }

    #[tokio::test]
    async fn disabled_tasks_never_fire() {
        let repo = store();
        let mut task = task_at(&repo, "09:00", None).await;
        task.status = TaskStatus::Disabled;
        repo.update_task(&task).await.expect("disable");
        let (sched, _exec) = scheduler(&repo);
        assert_eq!(sched.tick(today_at(9, 0)).await.expect("tick"), TickReport::default());
    }

    #[tokio::test]
    async fn due_task_with_active_run_is_skipped_not_queued() {
        let repo = store();
        let task = task_at(&repo, "09:00", None).await;
        let (source, gate) = ScriptedSource::gated();
        let exec = executor(
            &repo,
            Arc::new(source.with_hits(
                "air fryer",
                vec![crate::test_support::video(
                    "BV1",
                    "Air fryer review",
                    crate::test_support::stats(1, 1, 1, 1),
                    10,
                )],
            )),
        );
        let manual = exec.start(task.id, RunTrigger::Manual).await.expect("manual");
        let sched = TaskScheduler::new(repo.clone(), Arc::clone(&exec), Tz::UTC);

        let report = sched.tick(today_at(9, 0)).await.expect("tick");
        assert_eq!(report.conflicts, 1);
        assert!(report.started.is_empty());
        let runs = repo.list_runs(task.id, Default::default()).await.expect("runs");
        assert_eq!(runs.total, 1);

        gate.add_permits(10);
        wait_for_terminal(&repo, manual.id).await;
    }
}
