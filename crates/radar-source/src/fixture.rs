use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use radar_core::SearchSort;
use serde::{Deserialize, Serialize};

use crate::{FetchedVideo, SearchQuery, SourceError, VideoSource, SEARCH_PAGE_SIZE};

/// Catalog entry. Uploader follower counts live beside the video so the
/// catalog can answer follower lookups too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureVideo {
    #[serde(flatten)]
    pub video: FetchedVideo,
    #[serde(default)]
    pub partition_id: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FixtureCatalog {
    videos: Vec<FixtureVideo>,
}

/// Offline source answering searches from a static catalog; used for demos
/// and for running the whole pipeline without network access.
#[derive(Debug, Clone, Default)]
pub struct FixtureSource {
    videos: Vec<FixtureVideo>,
}

impl FixtureSource {
    pub fn new(videos: Vec<FixtureVideo>) -> Self {
        Self { videos }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let catalog: FixtureCatalog =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(catalog.videos))
    }

    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    fn matches(entry: &FixtureVideo, query: &SearchQuery) -> bool {
        let keyword = query.keyword.trim().to_lowercase();
        if !entry.video.title.to_lowercase().contains(&keyword) {
            return false;
        }
        query.partition_ids.is_empty()
            || entry
                .partition_id
                .is_some_and(|p| query.partition_ids.contains(&p))
    }
}

#[async_trait]
impl VideoSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn search_page(
        &self,
        query: &SearchQuery,
        page: u32,
    ) -> Result<Vec<FetchedVideo>, SourceError> {
        let mut hits: Vec<&FixtureVideo> = self
            .videos
            .iter()
            .filter(|entry| Self::matches(entry, query))
            .collect();
        match query.sort {
            SearchSort::Relevance => {}
            SearchSort::New => hits.sort_by(|a, b| b.video.publish_time.cmp(&a.video.publish_time)),
            SearchSort::Views => hits.sort_by(|a, b| b.video.stats.views.cmp(&a.video.stats.views)),
        }
        let skip = (page.max(1) - 1) as usize * SEARCH_PAGE_SIZE as usize;
        Ok(hits
            .into_iter()
            .skip(skip)
            .take(SEARCH_PAGE_SIZE as usize)
            .map(|entry| entry.video.clone())
            .collect())
    }

    async fn video_detail(&self, bvid: &str) -> Result<Option<FetchedVideo>, SourceError> {
        Ok(self
            .videos
            .iter()
            .find(|entry| entry.video.bvid == bvid)
            .map(|entry| entry.video.clone()))
    }

    async fn follower_count(&self, up_id: &str) -> Result<u64, SourceError> {
        Ok(self
            .videos
            .iter()
            .find(|entry| entry.video.up_id == up_id)
            .and_then(|entry| entry.video.follower_count)
            .unwrap_or(0))
    }
}
