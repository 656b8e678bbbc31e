//! Notification delivery
//!
//! Matched change events become [`NotificationTask`]s. The [`Dispatcher`]
//! sends each task to a [`NotificationTarget`], retries retryable failures
//! with capped exponential backoff, and hands exhausted or permanently
//! rejected tasks to the dead-letter sink. A task is finished only once it
//! reaches one of the two terminal [`TaskResolution`]s.

pub mod backoff;
pub mod dispatcher;
pub mod target;
pub mod task;

pub use backoff::BackoffPolicy;
pub use dispatcher::Dispatcher;
pub use target::{build_target, LogTarget, NotificationTarget, RecordingTarget, WebhookTarget};
pub use task::{dedup_id, NotificationTask};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The target accepted the notification
    Delivered,
    /// Temporary failure; the attempt may be repeated
    Retryable(String),
    /// The target rejected the notification; repeating will not help
    Permanent(String),
}

impl DeliveryOutcome {
    /// Label used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Retryable(_) => "retryable",
            Self::Permanent(_) => "permanent",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => f.write_str("delivered"),
            Self::Retryable(reason) => write!(f, "retryable: {}", reason),
            Self::Permanent(reason) => write!(f, "permanent: {}", reason),
        }
    }
}

/// Terminal state of a notification task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResolution {
    /// Delivered after `attempts` attempts
    Delivered {
        /// Attempts used, including the successful one
        attempts: u32,
    },
    /// Stored in the dead-letter sink
    DeadLettered {
        /// Dead-letter record identifier
        record_id: String,
    },
}
