//! Feed source and parser contracts, plus the iCalendar implementations used by the sync pipeline.

pub mod ical;
pub mod normalize;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use staysync_storage::{FeedFetcher, FetchError};
use tokio::sync::Mutex;

pub use ical::{parse_ical, ComponentError, FeedDate, ParseError, ParsedFeed, RawEvent};
pub use normalize::{
    annotate_stays, classify_entry, normalize_event, synthetic_source_id, FeedBinding, NormalizeError,
};

/// Where raw feed bytes come from.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_feed(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Turns raw feed bytes into raw events.
pub trait FeedParser: Send + Sync {
    fn parse_feed(&self, bytes: &[u8]) -> Result<ParsedFeed, ParseError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ICalParser;

impl FeedParser for ICalParser {
    fn parse_feed(&self, bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
        parse_ical(bytes)
    }
}

#[async_trait]
impl FeedSource for FeedFetcher {
    async fn fetch_feed(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        FeedFetcher::fetch_feed(self, url).await.map(|feed| feed.body)
    }
}

#[derive(Debug, Clone)]
enum FixtureResponse {
    Body { bytes: Vec<u8>, delay: Option<Duration> },
    Status(u16),
}

/// Serves canned feed documents by URL. Unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct InMemoryFeedSource {
    feeds: Mutex<HashMap<String, FixtureResponse>>,
}

impl InMemoryFeedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_body(&self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.feeds.lock().await.insert(
            url.into(),
            FixtureResponse::Body {
                bytes: bytes.into(),
                delay: None,
            },
        );
    }

    /// Serves `bytes` only after `delay`, for exercising fetch timeouts.
    pub async fn set_slow_body(&self, url: impl Into<String>, bytes: impl Into<Vec<u8>>, delay: Duration) {
        self.feeds.lock().await.insert(
            url.into(),
            FixtureResponse::Body {
                bytes: bytes.into(),
                delay: Some(delay),
            },
        );
    }

    pub async fn set_status(&self, url: impl Into<String>, status: u16) {
        self.feeds
            .lock()
            .await
            .insert(url.into(), FixtureResponse::Status(status));
    }
}

#[async_trait]
impl FeedSource for InMemoryFeedSource {
    async fn fetch_feed(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.feeds.lock().await.get(url).cloned();
        match response {
            Some(FixtureResponse::Body { bytes, delay }) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(bytes)
            }
            Some(FixtureResponse::Status(status)) => Err(FetchError::HttpStatus {
                status,
                url: url.to_string(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}
