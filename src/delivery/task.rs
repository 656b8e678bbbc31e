//! Notification tasks
//!
//! A task is created for every event that passes the filter. Its dedup id
//! depends only on the subscription and the event position, so a replay of
//! the same event after a restart produces the same id and receivers can
//! drop the duplicate.

use crate::config::PayloadConfig;
use crate::event::{ChangeEvent, OperationType, ResumePosition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};

/// Stable delivery identifier for `(subscription, position)`
///
/// # Examples
///
/// ```
/// use streamhook::delivery::dedup_id;
/// use streamhook::event::ResumePosition;
///
/// let a = dedup_id("gaps", ResumePosition(7));
/// assert_eq!(a, dedup_id("gaps", ResumePosition(7)));
/// assert_ne!(a, dedup_id("orders", ResumePosition(7)));
/// assert_eq!(a.len(), 64);
/// ```
pub fn dedup_id(subscription: &str, position: ResumePosition) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subscription.as_bytes());
    hasher.update(b":");
    hasher.update(position.value().to_be_bytes());
    format!("{:x}", hasher.finalize())
}

/// Outbound notification for one change event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTask {
    /// Stable dedup identifier
    pub dedup_id: String,

    /// Subscription that produced the task
    pub subscription: String,

    /// Position of the originating event
    pub position: ResumePosition,

    /// Kind of change that triggered the notification
    pub operation_type: OperationType,

    /// Target endpoint at creation time
    pub endpoint: String,

    /// Redacted event document
    pub payload: JsonValue,

    /// Attempts made so far
    #[serde(default)]
    pub attempts: u32,

    /// When the next attempt is due, while waiting out a backoff
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Source timestamp of the originating event
    pub event_timestamp: DateTime<Utc>,

    /// When the task was created
    pub created_at: DateTime<Utc>,
}

impl NotificationTask {
    /// Build the task for a matched event, applying payload redaction
    pub fn from_event(
        event: &ChangeEvent,
        subscription: &str,
        endpoint: &str,
        payload: &PayloadConfig,
    ) -> Self {
        let mut document = event.document.clone();
        for path in &payload.redact_fields {
            redact(&mut document, path);
        }

        Self {
            dedup_id: dedup_id(subscription, event.position),
            subscription: subscription.to_string(),
            position: event.position,
            operation_type: event.operation_type,
            endpoint: endpoint.to_string(),
            payload: document,
            attempts: 0,
            next_retry_at: None,
            event_timestamp: event.timestamp,
            created_at: Utc::now(),
        }
    }

    /// JSON body sent to webhook targets
    pub fn body(&self) -> JsonValue {
        json!({
            "id": self.dedup_id,
            "subscription": self.subscription,
            "position": self.position,
            "operationType": self.operation_type,
            "timestamp": self.event_timestamp,
            "attempt": self.attempts,
            "document": self.payload,
        })
    }
}

/// Remove a dotted path from a document
///
/// Arrays without an explicit index have the remaining path removed from
/// every element, so `members.ssn` strips `ssn` from each member.
pub fn redact(document: &mut JsonValue, path: &str) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    if !segments.is_empty() {
        remove_path(document, &segments);
    }
}

fn remove_path(value: &mut JsonValue, segments: &[&str]) {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };

    match value {
        JsonValue::Object(map) => {
            if rest.is_empty() {
                map.remove(*head);
            } else if let Some(child) = map.get_mut(*head) {
                remove_path(child, rest);
            }
        }
        JsonValue::Array(items) => match head.parse::<usize>() {
            Ok(index) if rest.is_empty() => {
                if index < items.len() {
                    items.remove(index);
                }
            }
            Ok(index) => {
                if let Some(child) = items.get_mut(index) {
                    remove_path(child, rest);
                }
            }
            Err(_) => {
                for item in items.iter_mut() {
                    remove_path(item, segments);
                }
            }
        },
        _ => {}
    }
}
