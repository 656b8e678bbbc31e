//! Polling HTTP change feed client
//!
//! The feed answers `GET <endpoint>?after=<position>` with
//! `{"events": [...], "latest": <position>}`. `?start=latest` asks only for
//! the current head position, and omitting both parameters asks for every
//! retained event. A `410 Gone` answer means the requested position fell
//! out of the feed's retention window.

use super::{ChangeSource, ChangeStream, SourceError, SubscribeFrom};
use crate::error::{Result, StreamhookError};
use crate::event::{ChangeEvent, ResumePosition};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

/// One page of the change feed
#[derive(Debug, Default, Deserialize)]
struct FeedPage {
    #[serde(default)]
    events: Vec<ChangeEvent>,
    #[serde(default)]
    latest: Option<ResumePosition>,
}

#[derive(Debug, Clone)]
struct FeedClient {
    client: Client,
    endpoint: Url,
}

impl FeedClient {
    fn request_url(&self, from: SubscribeFrom) -> Url {
        let mut url = self.endpoint.clone();
        match from {
            SubscribeFrom::After(position) => {
                url.query_pairs_mut()
                    .append_pair("after", &position.to_string());
            }
            SubscribeFrom::Latest => {
                url.query_pairs_mut().append_pair("start", "latest");
            }
            SubscribeFrom::Earliest => {}
        }
        url
    }

    async fn fetch(&self, from: SubscribeFrom) -> std::result::Result<FeedPage, SourceError> {
        let url = self.request_url(from);
        let response = self
            .client
            .get(url.clone())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| SourceError::Transient(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<FeedPage>()
                .await
                .map_err(|e| SourceError::Fatal(format!("invalid feed response: {}", e)));
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, from, body))
    }
}

fn classify_status(status: StatusCode, from: SubscribeFrom, body: String) -> SourceError {
    match status {
        StatusCode::GONE => SourceError::PositionExpired {
            position: match from {
                SubscribeFrom::After(position) => position,
                _ => ResumePosition(0),
            },
            message: body,
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SourceError::Transient(format!("feed returned {}", status))
        }
        s if s.is_server_error() => SourceError::Transient(format!("feed returned {}: {}", s, body)),
        s => SourceError::Fatal(format!("feed rejected request ({}): {}", s, body)),
    }
}

/// Change source polling an HTTP feed
#[derive(Debug, Clone)]
pub struct HttpSource {
    feed: FeedClient,
    poll_interval: Duration,
}

impl HttpSource {
    /// Create a feed client for `endpoint`
    ///
    /// # Errors
    ///
    /// Returns `StreamhookError::Http` if the HTTP client cannot be created
    pub fn new(endpoint: Url, poll_interval: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(StreamhookError::Http)?;

        Ok(Self {
            feed: FeedClient { client, endpoint },
            poll_interval,
        })
    }
}

struct FeedTail {
    feed: FeedClient,
    cursor: SubscribeFrom,
    last: Option<ResumePosition>,
    pending: VecDeque<ChangeEvent>,
    poll_interval: Duration,
    done: bool,
}

impl FeedTail {
    fn absorb(&mut self, page: FeedPage) {
        for event in page.events {
            if self.last.map_or(true, |last| event.position > last) {
                self.last = Some(event.position);
                self.pending.push_back(event);
            }
        }
        if self.last.is_none() {
            self.last = page.latest;
        }
        if let Some(last) = self.last {
            self.cursor = SubscribeFrom::After(last);
        }
    }
}

async fn next_event(mut tail: FeedTail) -> Option<(std::result::Result<ChangeEvent, SourceError>, FeedTail)> {
    loop {
        if tail.done {
            return None;
        }
        if let Some(event) = tail.pending.pop_front() {
            return Some((Ok(event), tail));
        }

        tokio::time::sleep(tail.poll_interval).await;

        match tail.feed.fetch(tail.cursor).await {
            Ok(page) => {
                trace!(cursor = %tail.cursor, events = page.events.len(), "Polled change feed");
                tail.absorb(page);
            }
            Err(e) => {
                tail.done = true;
                return Some((Err(e), tail));
            }
        }
    }
}

#[async_trait]
impl ChangeSource for HttpSource {
    async fn subscribe(&self, from: SubscribeFrom) -> std::result::Result<ChangeStream, SourceError> {
        let page = self.feed.fetch(from).await?;

        let mut tail = FeedTail {
            feed: self.feed.clone(),
            cursor: from,
            last: match from {
                SubscribeFrom::After(position) => Some(position),
                _ => None,
            },
            pending: VecDeque::new(),
            poll_interval: self.poll_interval,
            done: false,
        };
        if from == SubscribeFrom::Latest {
            // Only the head position matters when starting from now
            tail.last = page.latest;
            tail.cursor = page.latest.map_or(SubscribeFrom::Latest, SubscribeFrom::After);
        } else {
            tail.absorb(page);
        }

        debug!(
            endpoint = %self.feed.endpoint,
            from = %from,
            backlog = tail.pending.len(),
            "Subscribed to change feed"
        );

        Ok(stream::unfold(tail, next_event).boxed())
    }

    fn describe(&self) -> String {
        self.feed.endpoint.to_string()
    }
}
