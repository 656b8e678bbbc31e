//! Change-event sources
//!
//! A source turns "give me everything after position P" into an ordered
//! stream of [`ChangeEvent`]s. Sources must report a resume position that
//! fell out of their retention window as [`SourceError::PositionExpired`],
//! distinctly from ordinary disconnects, so the consumer loop can refuse to
//! continue instead of silently skipping data.
//!
//! # Implementations
//!
//! - [`MemorySource`]: scripted in-process log, with injectable disconnects
//! - [`FileSource`]: tails a newline-delimited JSON change log
//! - [`HttpSource`]: polls an HTTP change feed

pub mod file;
pub mod http;
pub mod memory;

pub use file::FileSource;
pub use http::HttpSource;
pub use memory::MemorySource;

use crate::config::{SourceConfig, StartFrom};
use crate::error::{Result, StreamhookError};
use crate::event::{ChangeEvent, ResumePosition};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a change source
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// Disconnect or temporary failure; resubscribing may succeed
    #[error("Transient source error: {0}")]
    Transient(String),

    /// The requested position is outside the source's retention window
    #[error("Position {position} is no longer retrievable: {message}")]
    PositionExpired {
        /// Position that was requested
        position: ResumePosition,
        /// Source-provided detail
        message: String,
    },

    /// Unrecoverable source failure (bad endpoint, corrupt log, rejected request)
    #[error("Source error: {0}")]
    Fatal(String),
}

impl SourceError {
    /// Returns true if the consumer loop should resubscribe
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<SourceError> for StreamhookError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::PositionExpired { position, message } => {
                StreamhookError::ResumePositionExpired {
                    position: position.to_string(),
                    message,
                }
            }
            other => StreamhookError::Source(other.to_string()),
        }
    }
}

/// Where a subscription starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeFrom {
    /// Events strictly after this position
    After(ResumePosition),
    /// Only events that arrive after subscribing
    Latest,
    /// Every retained event
    Earliest,
}

impl SubscribeFrom {
    /// Start point for a stored position, falling back to the start policy
    pub fn resolve(stored: Option<ResumePosition>, start_from: StartFrom) -> Self {
        match (stored, start_from) {
            (Some(position), _) => Self::After(position),
            (None, StartFrom::Latest) => Self::Latest,
            (None, StartFrom::Earliest) => Self::Earliest,
        }
    }
}

impl fmt::Display for SubscribeFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::After(p) => write!(f, "after {}", p),
            Self::Latest => f.write_str("latest"),
            Self::Earliest => f.write_str("earliest"),
        }
    }
}

/// Ordered stream of change events
pub type ChangeStream = BoxStream<'static, std::result::Result<ChangeEvent, SourceError>>;

/// External change-event source
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Open a subscription
    ///
    /// The returned stream yields events in strictly increasing position
    /// order. It ends only if the source itself is finite.
    async fn subscribe(&self, from: SubscribeFrom) -> std::result::Result<ChangeStream, SourceError>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Build the source named by `config.endpoint`
///
/// `file://<path>` selects the change-log tailer; `http://` and `https://`
/// select the polling feed client.
///
/// # Errors
///
/// Returns `StreamhookError::Config` for unsupported schemes
pub fn build_source(config: &SourceConfig) -> Result<Arc<dyn ChangeSource>> {
    let endpoint = config.endpoint.trim();
    let poll_interval = Duration::from_millis(config.poll_interval_ms);

    if let Some(path) = endpoint.strip_prefix("file://") {
        return Ok(Arc::new(FileSource::new(path, poll_interval)));
    }

    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        let url = url::Url::parse(endpoint)
            .map_err(|e| StreamhookError::Config(format!("Invalid source endpoint: {}", e)))?;
        return Ok(Arc::new(HttpSource::new(url, poll_interval)?));
    }

    Err(StreamhookError::Config(format!(
        "Unsupported source endpoint '{}': expected file://, http:// or https://",
        endpoint
    ))
    .into())
}
