//! Calendar feed fetching with per-host limits, throttle-aware retry and a
//! size cap on feed documents.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

const CALENDAR_ACCEPT: &str = "text/calendar, text/plain;q=0.9, */*;q=0.5";

/// Why a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// 429 from the calendar host, with its `Retry-After` hint in seconds if given.
    Throttled { retry_after: Option<Duration> },
    /// 5xx; calendar exports are often regenerated behind a short outage.
    Unavailable,
    /// Connection failure or a timed-out attempt.
    Transport { timed_out: bool },
}

/// `None` means the status is final.
pub fn retry_reason_for_status(status: StatusCode, headers: &HeaderMap) -> Option<RetryReason> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        Some(RetryReason::Throttled { retry_after })
    } else if status.is_server_error() {
        Some(RetryReason::Unavailable)
    } else {
        None
    }
}

pub fn retry_reason_for_error(err: &reqwest::Error) -> Option<RetryReason> {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Some(RetryReason::Transport {
            timed_out: err.is_timeout(),
        })
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeedRetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    /// Upper bound on any single wait, including a host's `Retry-After`, so one
    /// throttled feed cannot hold a pool slot for the rest of the run.
    pub max_delay: Duration,
}

impl Default for FeedRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl FeedRetryPolicy {
    pub fn delay(&self, attempt: usize, reason: RetryReason) -> Duration {
        if let RetryReason::Throttled {
            retry_after: Some(hint),
        } = reason
        {
            return hint.min(self.max_delay);
        }
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    /// Per attempt; the coordinator bounds the whole fetch separately.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// Calendar providers throttle per account, so keep this low.
    pub per_host_concurrency: usize,
    pub max_feed_bytes: usize,
    pub retry: FeedRetryPolicy,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 2,
            max_feed_bytes: 8 * 1024 * 1024,
            retry: FeedRetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub status: StatusCode,
    pub final_url: String,
    pub attempts: usize,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid feed url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("fetching {url} timed out after {attempts} attempts of {per_attempt:?}")]
    Timeout {
        url: String,
        attempts: usize,
        per_attempt: Duration,
    },
    #[error("feed {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

/// Fetches calendar feeds. `file://` URLs are read from disk so fixture feeds
/// can go through the same pipeline as live ones.
#[derive(Debug)]
pub struct FeedFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    timeout: Duration,
    max_feed_bytes: usize,
    retry: FeedRetryPolicy,
}

impl FeedFetcher {
    pub fn new(config: FeedClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, reqwest::header::HeaderValue::from_static(CALENDAR_ACCEPT));
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            timeout: config.timeout,
            max_feed_bytes: config.max_feed_bytes,
            retry: config.retry,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    pub async fn fetch_feed(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        match parsed.scheme() {
            "file" => self.read_file_feed(&parsed).await,
            "http" | "https" => {
                let host = parsed.host_str().unwrap_or_default().to_string();
                let span = info_span!("feed_fetch", url, host = %host);
                self.fetch_http(parsed, &host).instrument(span).await
            }
            other => Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }

    fn check_size(&self, url: &str, len: usize) -> Result<(), FetchError> {
        if len > self.max_feed_bytes {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                limit: self.max_feed_bytes,
            });
        }
        Ok(())
    }

    async fn fetch_http(&self, url: Url, host: &str) -> Result<FetchedFeed, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_host = self.per_host_semaphore(host).await;
        let _host = per_host.acquire().await.map_err(|_| FetchError::LimiterClosed)?;

        let mut attempt = 0;
        loop {
            let reason = match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        if let Some(len) = resp.content_length() {
                            self.check_size(&final_url, len as usize)?;
                        }
                        let body = resp.bytes().await?.to_vec();
                        self.check_size(&final_url, body.len())?;
                        debug!(bytes = body.len(), attempt, "feed fetched");
                        return Ok(FetchedFeed {
                            status,
                            final_url,
                            attempts: attempt + 1,
                            body,
                        });
                    }

                    match retry_reason_for_status(status, resp.headers()) {
                        Some(reason) if attempt < self.retry.max_retries => reason,
                        _ => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            })
                        }
                    }
                }
                Err(err) => match retry_reason_for_error(&err) {
                    Some(reason) if attempt < self.retry.max_retries => reason,
                    Some(RetryReason::Transport { timed_out: true }) => {
                        return Err(FetchError::Timeout {
                            url: url.to_string(),
                            attempts: attempt + 1,
                            per_attempt: self.timeout,
                        })
                    }
                    _ => return Err(FetchError::Request(err)),
                },
            };

            let delay = self.retry.delay(attempt, reason);
            if matches!(reason, RetryReason::Throttled { .. }) {
                warn!(?delay, attempt, "calendar host throttled the feed; backing off");
            } else {
                debug!(?reason, ?delay, attempt, "retrying feed fetch");
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn read_file_feed(&self, url: &Url) -> Result<FetchedFeed, FetchError> {
        let path = url.to_file_path().map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: "not a local file path".to_string(),
        })?;
        let body = tokio::fs::read(&path).await.map_err(|source| FetchError::File {
            path: path.display().to_string(),
            source,
        })?;
        self.check_size(url.as_str(), body.len())?;
        Ok(FetchedFeed {
            status: StatusCode::OK,
            final_url: url.to_string(),
            attempts: 1,
            body,
        })
    }
}
