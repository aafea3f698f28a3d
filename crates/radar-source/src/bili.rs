use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use radar_core::VideoStats;
use radar_storage::HttpFetcher;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    json_id, json_str, normalize_url, parse_count, parse_time, strip_markup, FetchedVideo,
    SearchQuery, SourceError, VideoSource,
};

/// Upstream code for risk-control throttling.
const CODE_RISK_CONTROL: i64 = -412;
/// Upstream codes meaning the video no longer exists or is hidden.
const CODES_VIDEO_GONE: [i64; 3] = [-404, 62002, 62004];

#[derive(Debug, Clone)]
pub struct BiliWebConfig {
    pub api_base: String,
    pub search_base: String,
}

impl Default for BiliWebConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.bilibili.com".to_string(),
            search_base: "https://search.bilibili.com".to_string(),
        }
    }
}

pub struct BiliWebSource {
    http: Arc<HttpFetcher>,
    config: BiliWebConfig,
}

impl BiliWebSource {
    pub fn new(http: Arc<HttpFetcher>, config: BiliWebConfig) -> Self {
        Self { http, config }
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, SourceError> {
        let resp = self.http.fetch_bytes(self.source_id(), url, query).await?;
        serde_json::from_slice(&resp.body)
            .map_err(|err| SourceError::Malformed(format!("{url}: {err}")))
    }

    async fn search_api(
        &self,
        query: &SearchQuery,
        page: u32,
    ) -> Result<Vec<FetchedVideo>, SourceError> {
        let url = format!("{}/x/web-interface/search/type", self.config.api_base);
        let mut params = vec![
            ("search_type", "video".to_string()),
            ("keyword", query.keyword.clone()),
            ("page", page.to_string()),
            ("order", query.order_param().to_string()),
        ];
        if let Some(tids) = query.tids_param() {
            params.push(("tids", tids));
        }

        let body = self.get_json(&url, &params).await?;
        match response_code(&body) {
            0 => {}
            CODE_RISK_CONTROL => return Err(SourceError::RateLimited(url)),
            code => {
                debug!(code, keyword = %query.keyword, "search api declined, using page fallback");
                return Ok(Vec::new());
            }
        }

        let Some(items) = body.pointer("/data/result").and_then(JsonValue::as_array) else {
            return Ok(Vec::new());
        };
        Ok(items.iter().filter_map(video_from_search_item).collect())
    }

    async fn search_html(
        &self,
        query: &SearchQuery,
        page: u32,
    ) -> Result<Vec<FetchedVideo>, SourceError> {
        let url = format!("{}/video", self.config.search_base);
        let mut params = vec![
            ("keyword", query.keyword.clone()),
            ("page", page.to_string()),
            ("order", query.order_param().to_string()),
        ];
        if let Some(tids) = query.tids_param() {
            params.push(("tids", tids));
        }

        let resp = self.http.fetch_bytes(self.source_id(), &url, &params).await?;
        let text = String::from_utf8_lossy(&resp.body);
        let Some(state) = extract_page_state(&text) else {
            return Ok(Vec::new());
        };
        let mut nodes = Vec::new();
        collect_video_nodes(&state, &mut nodes);
        Ok(nodes.into_iter().filter_map(video_from_search_item).collect())
    }
}

#[async_trait]
impl VideoSource for BiliWebSource {
    fn source_id(&self) -> &'static str {
        "bilibili"
    }

    async fn search_page(
        &self,
        query: &SearchQuery,
        page: u32,
    ) -> Result<Vec<FetchedVideo>, SourceError> {
        let items = self.search_api(query, page).await?;
        if !items.is_empty() {
            return Ok(items);
        }
        self.search_html(query, page).await
    }

    async fn video_detail(&self, bvid: &str) -> Result<Option<FetchedVideo>, SourceError> {
        let url = format!("{}/x/web-interface/view", self.config.api_base);
        let body = self.get_json(&url, &[("bvid", bvid.to_string())]).await?;
        match response_code(&body) {
            0 => {}
            CODE_RISK_CONTROL => return Err(SourceError::RateLimited(url)),
            code if CODES_VIDEO_GONE.contains(&code) => return Ok(None),
            code => {
                return Err(SourceError::Malformed(format!(
                    "view api returned code {code} for {bvid}"
                )))
            }
        }
        let data = body
            .get("data")
            .ok_or_else(|| SourceError::Malformed(format!("view api: no data for {bvid}")))?;
        Ok(Some(video_from_detail(data, bvid)))
    }

    async fn follower_count(&self, up_id: &str) -> Result<u64, SourceError> {
        if up_id.is_empty() {
            return Ok(0);
        }
        let url = format!("{}/x/relation/stat", self.config.api_base);
        let body = self.get_json(&url, &[("vmid", up_id.to_string())]).await?;
        match response_code(&body) {
            0 => Ok(parse_count(body.pointer("/data/follower"))),
            CODE_RISK_CONTROL => Err(SourceError::RateLimited(url)),
            code => Err(SourceError::Malformed(format!(
                "relation api returned code {code} for {up_id}"
            ))),
        }
    }
}

fn response_code(body: &JsonValue) -> i64 {
    body.get("code").and_then(JsonValue::as_i64).unwrap_or(0)
}

fn video_from_search_item(item: &JsonValue) -> Option<FetchedVideo> {
    let bvid = json_str(item, &["bvid"])?.trim();
    if bvid.is_empty() {
        return None;
    }
    let stat = item.get("stat");
    let pick = |keys: &[&str], stat_key: &str| -> u64 {
        keys.iter()
            .find_map(|k| item.get(*k).filter(|v| !v.is_null()))
            .or_else(|| stat.and_then(|s| s.get(stat_key)))
            .map(|v| parse_count(Some(v)))
            .unwrap_or(0)
    };
    Some(FetchedVideo {
        bvid: bvid.to_string(),
        title: strip_markup(json_str(item, &["title"]).unwrap_or_default()),
        up_id: json_id(item.get("mid").or_else(|| item.get("author_mid"))),
        up_name: json_str(item, &["author"])
            .or_else(|| json_str(item, &["up_name"]))
            .unwrap_or_default()
            .to_string(),
        publish_time: parse_time(item.get("pubdate").or_else(|| item.get("ptime")), Utc::now()),
        cover_url: normalize_url(item.get("pic").or_else(|| item.get("cover"))),
        stats: VideoStats {
            views: pick(&["play", "view"], "view"),
            like: pick(&["like"], "like"),
            fav: pick(&["favorites", "fav", "favorite"], "favorite"),
            coin: pick(&["coin"], "coin"),
            reply: pick(&["review", "reply"], "reply"),
            share: pick(&["share"], "share"),
        },
        follower_count: None,
    })
}

fn video_from_detail(data: &JsonValue, bvid: &str) -> FetchedVideo {
    let stat = |key: &str| parse_count(data.get("stat").and_then(|s| s.get(key)));
    FetchedVideo {
        bvid: json_str(data, &["bvid"]).unwrap_or(bvid).to_string(),
        title: strip_markup(json_str(data, &["title"]).unwrap_or_default()),
        up_id: json_id(data.pointer("/owner/mid")),
        up_name: json_str(data, &["owner", "name"])
            .unwrap_or_default()
            .to_string(),
        publish_time: parse_time(data.get("pubdate"), Utc::now()),
        cover_url: normalize_url(data.get("pic")),
        stats: VideoStats {
            views: stat("view"),
            like: stat("like"),
            fav: stat("favorite"),
            coin: stat("coin"),
            reply: stat("reply"),
            share: stat("share"),
        },
        follower_count: None,
    }
}

/// Embedded page state: the `__NEXT_DATA__` script or `window.__INITIAL_STATE__`.
fn extract_page_state(html: &str) -> Option<JsonValue> {
    let document = Html::parse_document(html);
    if let Ok(sel) = Selector::parse("script#__NEXT_DATA__") {
        if let Some(node) = document.select(&sel).next() {
            let raw = node.text().collect::<String>();
            if let Ok(value) = serde_json::from_str(&raw) {
                return Some(value);
            }
        }
    }

    let marker = html.find("window.__INITIAL_STATE__")?;
    let start = marker + html[marker..].find('{')?;
    serde_json::Deserializer::from_str(&html[start..])
        .into_iter::<JsonValue>()
        .next()?
        .ok()
}

fn collect_video_nodes<'a>(node: &'a JsonValue, out: &mut Vec<&'a JsonValue>) {
    match node {
        JsonValue::Object(map) => {
            if map.contains_key("bvid") && (map.contains_key("title") || map.contains_key("name")) {
                out.push(node);
            }
            for value in map.values() {
                collect_video_nodes(value, out);
            }
        }
        JsonValue::Array(items) => {
            for value in items {
                collect_video_nodes(value, out);
            }
        }
        _ => {}
    }
}
