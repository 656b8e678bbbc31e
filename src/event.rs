//! Change event types
//!
//! A [`ChangeEvent`] is the unit produced by a change source. Its
//! [`ResumePosition`] is treated as an opaque token everywhere except for
//! ordering: positions are totally ordered and strictly increasing within a
//! single stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// Opaque, totally ordered marker identifying a point in the change stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumePosition(pub u64);

impl ResumePosition {
    /// Returns the raw sequence value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResumePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResumePosition {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(ResumePosition)
    }
}

impl From<u64> for ResumePosition {
    fn from(value: u64) -> Self {
        ResumePosition(value)
    }
}

/// Kind of change a [`ChangeEvent`] describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// A new document was inserted
    Insert,
    /// An existing document was modified
    Update,
    /// A document was removed
    Delete,
    /// Anything else the source reports (replace, drop, invalidate, ...)
    #[serde(other)]
    Other,
}

impl OperationType {
    /// Returns the lowercase wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown operation type: {}", other)),
        }
    }
}

/// Immutable change record produced by a change source
///
/// Deserializes from the common change-stream shape
/// (`{"position": 7, "operationType": "insert", "fullDocument": {...}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Stream position of this event
    pub position: ResumePosition,

    /// Kind of change
    #[serde(rename = "operationType")]
    pub operation_type: OperationType,

    /// Changed document payload
    #[serde(default, alias = "fullDocument")]
    pub document: JsonValue,

    /// Time the change was observed by the source
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Creates a change event stamped with the current time
    ///
    /// # Examples
    ///
    /// ```
    /// use streamhook::event::{ChangeEvent, OperationType};
    ///
    /// let event = ChangeEvent::new(1, OperationType::Insert, serde_json::json!({"memberId": "M001"}));
    /// assert_eq!(event.position.value(), 1);
    /// ```
    pub fn new(position: u64, operation_type: OperationType, document: JsonValue) -> Self {
        Self {
            position: ResumePosition(position),
            operation_type,
            document,
            timestamp: Utc::now(),
        }
    }

    /// Looks up a dotted field path inside the document
    ///
    /// Array elements can be addressed by numeric segments (`items.0.sku`).
    pub fn field(&self, path: &str) -> Option<&JsonValue> {
        lookup_path(&self.document, path)
    }
}

/// Resolves a dotted path against a JSON value
pub(crate) fn lookup_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(value, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_position_ordering() {
        assert!(ResumePosition(1) < ResumePosition(2));
        assert_eq!(ResumePosition(5).max(ResumePosition(3)), ResumePosition(5));
    }

    #[test]
    fn test_position_from_str() {
        assert_eq!(" 42 ".parse::<ResumePosition>().unwrap(), ResumePosition(42));
        assert!("abc".parse::<ResumePosition>().is_err());
    }

    #[test]
    fn test_operation_type_from_str() {
        assert_eq!("INSERT".parse::<OperationType>(), Ok(OperationType::Insert));
        assert_eq!("delete".parse::<OperationType>(), Ok(OperationType::Delete));
        assert!("upsert".parse::<OperationType>().is_err());
    }

    #[test]
    fn test_deserialize_change_stream_shape() {
        let raw = r#"{
            "position": 7,
            "operationType": "insert",
            "fullDocument": {"memberId": "M001", "LOB": "Medicare"},
            "timestamp": "2025-01-15T10:30:00Z"
        }"#;

        let event: ChangeEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.position, ResumePosition(7));
        assert_eq!(event.operation_type, OperationType::Insert);
        assert_eq!(event.document["memberId"], "M001");
        assert_eq!(event.timestamp.to_rfc3339(), "2025-01-15T10:30:00+00:00");
    }

    #[test]
    fn test_unknown_operation_type_maps_to_other() {
        let raw = r#"{"position": 1, "operationType": "replace"}"#;
        let event: ChangeEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.operation_type, OperationType::Other);
        assert!(event.document.is_null());
    }

    #[test]
    fn test_field_lookup() {
        let event = ChangeEvent::new(
            1,
            OperationType::Insert,
            json!({"name": {"first": "Ava"}, "tags": ["a", "b"]}),
        );
        assert_eq!(event.field("name.first"), Some(&json!("Ava")));
        assert_eq!(event.field("tags.1"), Some(&json!("b")));
        assert_eq!(event.field("name.last"), None);
        assert_eq!(event.field("tags.x"), None);
    }
}
