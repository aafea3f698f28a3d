use std::sync::Arc;

use chrono::Utc;
use radar_core::{Page, PageRequest, RunRecord, Task, TaskDraft, TaskPatch, TaskStatus};
use radar_storage::{Repository, TaskFilter};
use tracing::info;
use uuid::Uuid;

use crate::EngineError;

/// Task CRUD plus the run history views.
#[derive(Clone)]
pub struct TaskService {
    repo: Arc<dyn Repository>,
}

impl TaskService {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub async fn create(&self, draft: TaskDraft) -> Result<Task, EngineError> {
        let task = draft.normalized()?.into_task(Utc::now());
        self.repo.insert_task(&task).await?;
        info!(task_id = %task.id, name = %task.name, "task created");
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Result<Task, EngineError> {
        self.repo
            .get_task(id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", id))
    }

    pub async fn list(&self, filter: TaskFilter, page: PageRequest) -> Result<Page<Task>, EngineError> {
        Ok(self.repo.list_tasks(&filter, page).await?)
    }

    pub async fn update(&self, id: Uuid, patch: TaskPatch) -> Result<Task, EngineError> {
        let current = self.get(id).await?;
        let next = patch.apply(&current, Utc::now())?;
        self.repo.update_task(&next).await?;
        Ok(next)
    }

    pub async fn set_status(&self, id: Uuid, status: TaskStatus) -> Result<Task, EngineError> {
        let task = self
            .update(
                id,
                TaskPatch {
                    status: Some(status),
                    ..TaskPatch::default()
                },
            )
            .await?;
        info!(task_id = %id, status = status.as_str(), "task status changed");
        Ok(task)
    }

    /// Refused while the task has a running record.
    pub async fn delete(&self, id: Uuid) -> Result<(), EngineError> {
        if self.repo.active_run(id).await?.is_some() {
            return Err(EngineError::ConcurrentRunConflict { task_id: id });
        }
        if !self.repo.delete_task(id).await? {
            return Err(EngineError::not_found("task", id));
        }
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Copies configuration, tags and status under `"<name> (copy)"`; the
    /// failure streak starts over.
    pub async fn clone_task(&self, id: Uuid) -> Result<Task, EngineError> {
        let source = self.get(id).await?;
        let mut draft = source.to_draft();
        draft.name = format!("{} (copy)", source.name);
        let mut copy = draft.normalized()?.into_task(Utc::now());
        copy.status = source.status;
        self.repo.insert_task(&copy).await?;
        info!(task_id = %copy.id, cloned_from = %id, "task cloned");
        Ok(copy)
    }

    /// Copies a template's rules into the stored task. Later template edits
    /// do not reach the task.
    pub async fn apply_template(&self, task_id: Uuid, template_id: Uuid) -> Result<Task, EngineError> {
        let template = self
            .repo
            .get_template(template_id)
            .await?
            .ok_or_else(|| EngineError::not_found("template", template_id))?;
        let current = self.get(task_id).await?;
        let mut draft = current.to_draft();
        template.apply_to(&mut draft);
        let task = self
            .update(
                task_id,
                TaskPatch {
                    rules: Some(draft.rules),
                    ..TaskPatch::default()
                },
            )
            .await?;
        info!(task_id = %task_id, template_id = %template_id, "template applied");
        Ok(task)
    }

    pub async fn list_runs(&self, task_id: Uuid, page: PageRequest) -> Result<Page<RunRecord>, EngineError> {
        self.get(task_id).await?;
        Ok(self.repo.list_runs(task_id, page).await?)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, EngineError> {
        self.repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{draft, store};
    use radar_core::{RunTrigger, ValidationError};
    use radar_storage::{RunRepository, TaskRepository};

    #[tokio::test]
    async fn invalid_draft_is_rejected_before_storage() {
        let repo = store();
        let tasks = TaskService::new(repo.clone());
        let mut bad = draft(&["air fryer"]);
        bad.schedule.time = "25:00".into();
        let err = tasks.create(bad).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError { .. })));
        let page = tasks
            .list(TaskFilter::default(), PageRequest::default())
            .await
            .expect("list");
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn clone_copies_config_and_resets_streak() {
        let repo = store();
        let tasks = TaskService::new(repo.clone());
        let original = tasks.create(draft(&["air fryer"])).await.expect("create");
        tasks
            .set_status(original.id, TaskStatus::Disabled)
            .await
            .expect("disable");
        repo.bump_failure_streak(original.id).await.expect("bump");

        let copy = tasks.clone_task(original.id).await.expect("clone");
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.name, "kitchen radar (copy)");
        assert_eq!(copy.keywords, original.keywords);
        assert_eq!(copy.tags, original.tags);
        assert_eq!(copy.status, TaskStatus::Disabled);
        assert_eq!(copy.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn update_keeps_failure_streak() {
        let repo = store();
        let tasks = TaskService::new(repo.clone());
        let task = tasks.create(draft(&["air fryer"])).await.expect("create");
        repo.bump_failure_streak(task.id).await.expect("bump");

        let updated = tasks
            .update(
                task.id,
                TaskPatch {
                    keywords: Some(vec!["oven".into()]),
                    ..TaskPatch::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.keywords, vec!["oven".to_string()]);
        let stored = repo.get_task(task.id).await.expect("get").expect("task");
        assert_eq!(stored.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn delete_is_refused_during_active_run() {
        let repo = store();
        let tasks = TaskService::new(repo.clone());
        let task = tasks.create(draft(&["air fryer"])).await.expect("create");
        let run = RunRecord::start(task.id, RunTrigger::Manual, None, Utc::now());
        repo.insert_run(&run).await.expect("insert run");

        assert!(matches!(
            tasks.delete(task.id).await,
            Err(EngineError::ConcurrentRunConflict { .. })
        ));

        let mut finished = run.clone();
        finished.status = radar_core::RunStatus::Success;
        finished.end_at = Some(Utc::now());
        repo.finish_run(&finished).await.expect("finish");
        tasks.delete(task.id).await.expect("delete");
        assert!(matches!(
            tasks.get(task.id).await,
            Err(EngineError::NotFound { entity: "task", .. })
        ));
    }

    #[tokio::test]
    async fn apply_template_copies_rules_into_stored_task() {
        let repo = store();
        let tasks = TaskService::new(repo.clone());
        let templates = crate::TemplateStore::new(repo.clone());
        templates.seed_presets().await.expect("seed");
        let strong = templates
            .list()
            .await
            .expect("list")
            .into_iter()
            .find(|t| t.strength == radar_core::Strength::Strong)
            .expect("strong preset");
        let task = tasks.create(draft(&["air fryer"])).await.expect("create");

        let applied = tasks.apply_template(task.id, strong.id).await.expect("apply");
        assert_eq!(applied.rules, strong.rules);
        assert_eq!(applied.keywords, task.keywords);
        assert!(matches!(
            tasks.apply_template(task.id, Uuid::new_v4()).await,
            Err(EngineError::NotFound { entity: "template", .. })
        ));
    }

    #[tokio::test]
    async fn list_runs_of_unknown_task_is_not_found() {
        let tasks = TaskService::new(store());
        assert!(matches!(
            tasks.list_runs(Uuid::new_v4(), PageRequest::default()).await,
            Err(EngineError::NotFound { .. })
        ));
    }
}
