use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use radar_core::{preset_templates, TaskDraft, Template, TemplateDraft, TemplatePatch};
use radar_storage::Repository;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::EngineError;

/// Rule presets. Applying one copies its rules; nothing refers back to the
/// template afterwards.
#[derive(Clone)]
pub struct TemplateStore {
    repo: Arc<dyn Repository>,
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    templates: Vec<TemplateDraft>,
}

impl TemplateStore {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub async fn list(&self) -> Result<Vec<Template>, EngineError> {
        Ok(self.repo.list_templates().await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Template, EngineError> {
        self.repo
            .get_template(id)
            .await?
            .ok_or_else(|| EngineError::not_found("template", id))
    }

    pub async fn create(&self, draft: TemplateDraft) -> Result<Template, EngineError> {
        let template = draft.normalized()?.into_template(Utc::now());
        self.repo.insert_template(&template).await?;
        info!(template_id = %template.id, name = %template.name, "template created");
        Ok(template)
    }

    pub async fn update(&self, id: Uuid, patch: TemplatePatch) -> Result<Template, EngineError> {
        let current = self.get(id).await?;
        let next = patch.apply(&current, Utc::now())?;
        self.repo.update_template(&next).await?;
        Ok(next)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), EngineError> {
        if self.repo.delete_template(id).await? {
            Ok(())
        } else {
            Err(EngineError::not_found("template", id))
        }
    }

    /// Returns `draft` with the template's rules copied in.
    pub async fn apply(&self, id: Uuid, mut draft: TaskDraft) -> Result<TaskDraft, EngineError> {
        let template = self.get(id).await?;
        template.apply_to(&mut draft);
        Ok(draft)
    }

    /// Inserts the built-in presets when no template exists yet.
    pub async fn seed_presets(&self) -> Result<usize, EngineError> {
        if !self.repo.list_templates().await?.is_empty() {
            return Ok(0);
        }
        self.insert_all(preset_templates()).await
    }

    /// Loads additional templates from a YAML file with a top-level
    /// `templates:` list. Every entry is validated before any is stored.
    pub async fn import_yaml(&self, path: &Path) -> anyhow::Result<usize> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let file: TemplateFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        let drafts = file
            .templates
            .into_iter()
            .map(TemplateDraft::normalized)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("validating {}", path.display()))?;
        let count = self.insert_all(drafts).await?;
        info!(count, path = %path.display(), "templates imported");
        Ok(count)
    }

    async fn insert_all(&self, drafts: Vec<TemplateDraft>) -> Result<usize, EngineError> {
        let now = Utc::now();
        let mut count = 0;
        for draft in drafts {
            let template = draft.normalized()?.into_template(now);
            self.repo.insert_template(&template).await?;
            count += 1;
        }
        Ok(count)
    }
}
