use std::sync::Arc;

use radar_core::{normalize_note, Page, PageRequest, ProcessStatus, VideoRecord, VideoSort};
use radar_storage::{Repository, VideoFilter};
use tracing::info;

use crate::EngineError;

/// Read side of the collected videos plus the operator's triage fields.
#[derive(Clone)]
pub struct VideoService {
    repo: Arc<dyn Repository>,
}

impl VideoService {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub async fn list(
        &self,
        filter: VideoFilter,
        sort: VideoSort,
        page: PageRequest,
    ) -> Result<Page<VideoRecord>, EngineError> {
        Ok(self.repo.list_videos(&filter, sort, page).await?)
    }

    pub async fn get(&self, bvid: &str) -> Result<VideoRecord, EngineError> {
        self.repo
            .get_video(bvid)
            .await?
            .ok_or_else(|| EngineError::not_found("video", bvid))
    }

    pub async fn set_process_status(
        &self,
        bvid: &str,
        status: ProcessStatus,
    ) -> Result<VideoRecord, EngineError> {
        let video = self.repo.set_video_process_status(bvid, status).await?;
        info!(bvid, status = status.as_str(), "video process status changed");
        Ok(video)
    }

    /// Blank notes clear the stored note.
    pub async fn set_note(&self, bvid: &str, note: Option<String>) -> Result<VideoRecord, EngineError> {
        Ok(self.repo.set_video_note(bvid, normalize_note(note)).await?)
    }

    pub async fn tags(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.repo.list_tags().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{executor, stats, stored_task, store, video, ScriptedSource};

    #[tokio::test]
    async fn triage_survives_the_next_run() {
        let repo = store();
        let task = stored_task(&repo).await;
        let source = Arc::new(ScriptedSource::new().with_hits(
            "air fryer",
            vec![video("BV1hot", "fryer", stats(200_000, 9_000, 4_000, 900), 2_000)],
        ));
        let exec = executor(&repo, source);
        exec.run_to_completion(task.id, radar_core::RunTrigger::Manual)
            .await
            .expect("first run");

        let videos = VideoService::new(repo.clone());
        videos
            .set_process_status("BV1hot", ProcessStatus::Done)
            .await
            .expect("status");
        let noted = videos
            .set_note("BV1hot", Some("  script drafted ".into()))
            .await
            .expect("note");
        assert_eq!(noted.note.as_deref(), Some("script drafted"));

        exec.run_to_completion(task.id, radar_core::RunTrigger::Manual)
            .await
            .expect("second run");
        let stored = videos.get("BV1hot").await.expect("get");
        assert_eq!(stored.process_status, ProcessStatus::Done);
        assert_eq!(stored.note.as_deref(), Some("script drafted"));

        let todo = videos
            .list(
                VideoFilter {
                    process_status: Some(ProcessStatus::Todo),
                    ..VideoFilter::default()
                },
                VideoSort::default(),
                PageRequest::default(),
            )
            .await
            .expect("list");
        assert_eq!(todo.total, 0);

        let cleared = videos.set_note("BV1hot", Some("   ".into())).await.expect("clear");
        assert_eq!(cleared.note, None);
        assert_eq!(videos.tags().await.expect("tags"), vec!["appliance".to_string()]);
    }

    #[tokio::test]
    async fn unknown_video_is_not_found() {
        let videos = VideoService::new(store());
        assert!(matches!(
            videos.get("BV404").await,
            Err(EngineError::NotFound { entity: "video", .. })
        ));
        assert!(matches!(
            videos.set_process_status("BV404", ProcessStatus::Done).await,
            Err(EngineError::NotFound { entity: "video", .. })
        ));
    }
}
