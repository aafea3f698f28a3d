use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Transport-level retries inside a single fetch; distinct from the
/// batch-level `retry_times` setting the executor applies to failed items.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub headers: HashMap<String, String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            headers: HashMap::new(),
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Process-wide token bucket holding at most `per_sec` tokens, refilled at
/// `per_sec` tokens per second. The rate can be changed while runs are live.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    per_sec: u32,
    tokens: u32,
    last_refill: Instant,
}

/// Never zero, even for rates above one per nanosecond.
fn refill_every(per_sec: u32) -> Duration {
    (Duration::from_secs(1) / per_sec.max(1)).max(Duration::from_nanos(1))
}

impl TokenBucket {
    pub fn new(per_sec: u32) -> Self {
        let per_sec = per_sec.max(1);
        Self {
            state: Mutex::new(TokenBucketState {
                per_sec,
                tokens: per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn rate(&self) -> u32 {
        self.state.lock().await.per_sec
    }

    pub async fn set_rate(&self, per_sec: u32) {
        let mut state = self.state.lock().await;
        state.per_sec = per_sec.max(1);
        state.tokens = state.tokens.min(state.per_sec);
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let every = refill_every(state.per_sec);
            let due = state
                .last_refill
                .elapsed()
                .as_nanos()
                .checked_div(every.as_nanos())
                .unwrap_or(0);
            if due > 0 {
                let refills = due.min(u128::from(state.per_sec)) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(state.per_sec);
                // A full bucket accrues nothing; otherwise keep the partial interval.
                if state.tokens == state.per_sec {
                    state.last_refill = Instant::now();
                } else {
                    state.last_refill += every * refills;
                }
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let next = state.last_refill + every;
            drop(state);
            tokio::time::sleep_until(next).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher shut down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name `{name}`"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header `{name}`"))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url, query).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let mut attempt = 0;
        loop {
            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn throttling_statuses_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_bounds_throughput() {
        let bucket = TokenBucket::new(2);
        let start = Instant::now();
        for _ in 0..4 {
            bucket.take().await;
        }
        // Two burst tokens, then one every 500ms.
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_keeps_partial_refill_interval() {
        let bucket = TokenBucket::new(2);
        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        tokio::time::sleep(Duration::from_millis(750)).await;
        bucket.take().await;
        // Next token is due 1000ms after start, not 500ms after the last take.
        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_survives_sub_nanosecond_interval() {
        let bucket = TokenBucket::new(2_000_000_000);
        for _ in 0..3 {
            bucket.take().await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        bucket.take().await;
        assert_eq!(refill_every(2_000_000_000), Duration::from_nanos(1));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_rate_can_change_live() {
        let bucket = TokenBucket::new(10);
        bucket.set_rate(0).await;
        assert_eq!(bucket.rate().await, 1);

        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn bad_header_names_fail_client_construction() {
        let mut config = HttpClientConfig::default();
        config
            .headers
            .insert("bad header".to_string(), "x".to_string());
        assert!(HttpFetcher::new(config).is_err());
    }
}
