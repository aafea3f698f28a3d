//! Video source contract plus the Bilibili web implementation and an
//! offline fixture catalog.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use radar_core::{Scope, SearchSort, VideoStats};
use radar_storage::FetchError;
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod bili;
mod fixture;

pub use bili::{BiliWebConfig, BiliWebSource};
pub use fixture::{FixtureSource, FixtureVideo};

pub const CRATE_NAME: &str = "radar-source";

/// Results per search page on the upstream site.
pub const SEARCH_PAGE_SIZE: u32 = 20;
/// Upper bound on results collected per keyword.
pub const MAX_RESULTS_PER_KEYWORD: u32 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub keyword: String,
    pub sort: SearchSort,
    pub partition_ids: Vec<u32>,
}

impl SearchQuery {
    pub fn for_keyword(keyword: &str, scope: &Scope) -> Self {
        Self {
            keyword: keyword.to_string(),
            sort: scope.search_sort,
            partition_ids: scope.partition_ids.clone(),
        }
    }

    pub fn order_param(&self) -> &'static str {
        match self.sort {
            SearchSort::Relevance => "totalrank",
            SearchSort::New => "pubdate",
            SearchSort::Views => "click",
        }
    }

    pub fn tids_param(&self) -> Option<String> {
        if self.partition_ids.is_empty() {
            return None;
        }
        Some(
            self.partition_ids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// Number of pages needed to collect `fetch_limit` results for one keyword.
pub fn pages_for_limit(fetch_limit: u32) -> u32 {
    let limit = fetch_limit.clamp(1, MAX_RESULTS_PER_KEYWORD);
    limit.div_ceil(SEARCH_PAGE_SIZE)
}

/// One video as reported by the source. `follower_count` is filled only when
/// the source returns it inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedVideo {
    pub bvid: String,
    pub title: String,
    #[serde(default)]
    pub up_id: String,
    #[serde(default)]
    pub up_name: String,
    #[serde(default)]
    pub publish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub stats: VideoStats,
    #[serde(default)]
    pub follower_count: Option<u64>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unreachable: {0}")]
    Unreachable(String),
    #[error("rate limited by source: {0}")]
    RateLimited(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("http status {status} for {url}")]
    Http { status: u16, url: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl SourceError {
    /// Transport-level failures that end a run instead of a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::RateLimited(_))
    }
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Request(err) if err.is_timeout() => Self::Timeout(err.to_string()),
            FetchError::Request(err) if err.is_decode() || err.is_body() => {
                Self::Malformed(err.to_string())
            }
            FetchError::Request(err) => Self::Unreachable(err.to_string()),
            FetchError::HttpStatus { status, url } if status == 429 || status == 412 => {
                Self::RateLimited(format!("http status {status} for {url}"))
            }
            FetchError::HttpStatus { status, url } => Self::Http { status, url },
            FetchError::Closed => Self::Unreachable("fetcher closed".to_string()),
        }
    }
}

#[async_trait]
pub trait VideoSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// One page of search results, 1-based. An empty page ends pagination.
    async fn search_page(
        &self,
        query: &SearchQuery,
        page: u32,
    ) -> Result<Vec<FetchedVideo>, SourceError>;

    /// Fresh stats for one video; `None` when the video is gone upstream.
    async fn video_detail(&self, bvid: &str) -> Result<Option<FetchedVideo>, SourceError>;

    async fn follower_count(&self, up_id: &str) -> Result<u64, SourceError>;
}

/// Lenient counter parsing: integers, floats and strings such as `1.2万`.
pub fn parse_count(value: Option<&JsonValue>) -> u64 {
    match value {
        Some(JsonValue::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(JsonValue::String(s)) => parse_count_text(s),
        _ => 0,
    }
}

fn parse_count_text(text: &str) -> u64 {
    let text = text.replace(',', "");
    let text = text.trim();
    let (digits, scale) = if let Some(rest) = text.strip_suffix('万') {
        (rest, 10_000.0)
    } else if let Some(rest) = text.strip_suffix('亿') {
        (rest, 100_000_000.0)
    } else {
        (text, 1.0)
    };
    match digits.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => (v * scale) as u64,
        _ => 0,
    }
}

/// Parses unix seconds, absolute timestamps and the site's relative forms
/// (`3小时前`, `昨天`). `now` anchors the relative ones.
pub fn parse_time(value: Option<&JsonValue>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match value? {
        JsonValue::Number(n) => {
            let secs = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            if secs <= 0 {
                return None;
            }
            DateTime::from_timestamp(secs, 0)
        }
        JsonValue::String(s) => parse_time_text(s.trim(), now),
        _ => None,
    }
}

fn parse_time_text(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }
    if text == "刚刚" || text == "刚刚发布" {
        return Some(now);
    }
    if text == "昨天" {
        return Some(now - Duration::days(1));
    }
    if let Some(rest) = text.strip_suffix('前') {
        for (unit, step) in [
            ("分钟", Duration::minutes(1)),
            ("小时", Duration::hours(1)),
            ("天", Duration::days(1)),
        ] {
            if let Some(amount) = rest.strip_suffix(unit) {
                let amount: i32 = amount.trim().parse().ok()?;
                return Some(now - step * amount);
            }
        }
        return None;
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Drops highlight markup such as `<em class="keyword">` and decodes entities.
pub fn strip_markup(text: &str) -> String {
    if !text.contains('<') && !text.contains('&') {
        return text.to_string();
    }
    Html::parse_fragment(text)
        .root_element()
        .text()
        .collect::<String>()
}

/// Protocol-relative URLs become https.
pub fn normalize_url(value: Option<&JsonValue>) -> Option<String> {
    let url = value?.as_str()?.trim();
    if url.is_empty() {
        None
    } else if let Some(rest) = url.strip_prefix("//") {
        Some(format!("https://{rest}"))
    } else {
        Some(url.to_string())
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

/// Ids arrive as numbers or strings depending on the endpoint.
fn json_id(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::String(s)) => s.trim().to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_accept_units_and_separators() {
        assert_eq!(parse_count(Some(&json!(1234))), 1234);
        assert_eq!(parse_count(Some(&json!("1.5万"))), 15_000);
        assert_eq!(parse_count(Some(&json!("2亿"))), 200_000_000);
        assert_eq!(parse_count(Some(&json!("12,345"))), 12_345);
        assert_eq!(parse_count(Some(&json!("--"))), 0);
        assert_eq!(parse_count(Some(&json!(-3))), 0);
        assert_eq!(parse_count(None), 0);
    }

    #[test]
    fn times_accept_unix_absolute_and_relative_forms() {
        let now = DateTime::parse_from_rfc3339("2026-03-10T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        assert_eq!(
            parse_time(Some(&json!(1_700_000_000)), now),
            DateTime::from_timestamp(1_700_000_000, 0)
        );
        assert_eq!(parse_time(Some(&json!(0)), now), None);
        assert_eq!(
            parse_time(Some(&json!("3小时前")), now),
            Some(now - Duration::hours(3))
        );
        assert_eq!(parse_time(Some(&json!("昨天")), now), Some(now - Duration::days(1)));
        assert_eq!(
            parse_time(Some(&json!("2026-03-01")), now)
                .map(|d| d.format("%Y-%m-%d").to_string()),
            Some("2026-03-01".to_string())
        );
        assert_eq!(parse_time(Some(&json!("soon")), now), None);
    }

    #[test]
    fn markup_is_stripped_from_titles() {
        assert_eq!(
            strip_markup(r#"best <em class="keyword">air fryer</em> &amp; more"#),
            "best air fryer & more"
        );
        assert_eq!(strip_markup("plain"), "plain");
    }

    #[test]
    fn query_params_follow_scope() {
        let scope = Scope {
            search_sort: SearchSort::Views,
            partition_ids: vec![17, 95],
            ..Scope::default()
        };
        let q = SearchQuery::for_keyword("phone", &scope);
        assert_eq!(q.order_param(), "click");
        assert_eq!(q.tids_param().as_deref(), Some("17,95"));
        assert_eq!(pages_for_limit(45), 3);
        assert_eq!(pages_for_limit(5000), 10);
    }

    #[test]
    fn unreachable_and_throttled_transports_are_fatal() {
        let throttled: SourceError = FetchError::HttpStatus {
            status: 412,
            url: "https://api.example/x".into(),
        }
        .into();
        assert!(throttled.is_fatal());

        let missing: SourceError = FetchError::HttpStatus {
            status: 404,
            url: "https://api.example/x".into(),
        }
        .into();
        assert!(!missing.is_fatal());
        assert!(!SourceError::Timeout("detail".into()).is_fatal());
    }

    #[test]
    fn protocol_relative_urls_are_upgraded() {
        assert_eq!(
            normalize_url(Some(&json!("//i0.hdslb.com/a.jpg"))).as_deref(),
            Some("https://i0.hdslb.com/a.jpg")
        );
        assert_eq!(normalize_url(Some(&json!(""))), None);
    }
}
