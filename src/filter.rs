//! Event filtering for change events
//!
//! A filter is an ordered list of stages. An event is forwarded to delivery
//! only when every stage accepts it. Evaluation is pure: no I/O, no shared
//! state, and regexes are compiled once when the filter is built.

use crate::event::{ChangeEvent, OperationType};
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// One serialized filter stage
///
/// Stages are written as tagged maps, e.g.
///
/// ```yaml
/// - kind: operation_type
///   types: [insert]
/// - kind: field_not_equals
///   path: LOB
///   value: Medicaid
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterStage {
    /// Accepts events whose operation type is listed
    OperationType {
        /// Accepted operation types
        types: Vec<OperationType>,
    },

    /// Accepts events where the document field equals `value`
    FieldEquals {
        /// Dotted document path
        path: String,
        /// Expected value
        value: JsonValue,
    },

    /// Accepts events where the document field is absent or differs from `value`
    FieldNotEquals {
        /// Dotted document path
        path: String,
        /// Rejected value
        value: JsonValue,
    },

    /// Accepts events where the document field is present and not null
    FieldExists {
        /// Dotted document path
        path: String,
    },

    /// Accepts events where the document field is a string matching `pattern`
    FieldMatches {
        /// Dotted document path
        path: String,
        /// Regular expression
        pattern: String,
    },
}

#[derive(Debug, Clone)]
enum CompiledStage {
    OperationType(Vec<OperationType>),
    FieldEquals(String, JsonValue),
    FieldNotEquals(String, JsonValue),
    FieldExists(String),
    FieldMatches(String, Arc<Regex>),
}

impl CompiledStage {
    fn compile(stage: &FilterStage) -> Result<Self> {
        Ok(match stage {
            FilterStage::OperationType { types } => Self::OperationType(types.clone()),
            FilterStage::FieldEquals { path, value } => {
                Self::FieldEquals(path.clone(), value.clone())
            }
            FilterStage::FieldNotEquals { path, value } => {
                Self::FieldNotEquals(path.clone(), value.clone())
            }
            FilterStage::FieldExists { path } => Self::FieldExists(path.clone()),
            FilterStage::FieldMatches { path, pattern } => {
                Self::FieldMatches(path.clone(), Arc::new(Regex::new(pattern)?))
            }
        })
    }

    fn accepts(&self, event: &ChangeEvent) -> bool {
        match self {
            Self::OperationType(types) => types.contains(&event.operation_type),
            Self::FieldEquals(path, value) => event.field(path) == Some(value),
            Self::FieldNotEquals(path, value) => event.field(path) != Some(value),
            Self::FieldExists(path) => event.field(path).is_some_and(|v| !v.is_null()),
            Self::FieldMatches(path, regex) => event
                .field(path)
                .and_then(JsonValue::as_str)
                .is_some_and(|s| regex.is_match(s)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::OperationType(types) => {
                let names: Vec<&str> = types.iter().map(OperationType::as_str).collect();
                format!("operationType in [{}]", names.join(","))
            }
            Self::FieldEquals(path, value) => format!("{}=={}", path, value),
            Self::FieldNotEquals(path, value) => format!("{}!={}", path, value),
            Self::FieldExists(path) => format!("exists({})", path),
            Self::FieldMatches(path, regex) => format!("{}~{}", path, regex.as_str()),
        }
    }
}

/// Compiled event filter with AND semantics across stages
///
/// # Examples
///
/// ```
/// use streamhook::event::{ChangeEvent, OperationType};
/// use streamhook::filter::{EventFilter, FilterStage};
///
/// let filter = EventFilter::new(vec![FilterStage::OperationType {
///     types: vec![OperationType::Insert],
/// }])
/// .unwrap();
///
/// let insert = ChangeEvent::new(1, OperationType::Insert, serde_json::json!({}));
/// let delete = ChangeEvent::new(2, OperationType::Delete, serde_json::json!({}));
/// assert!(filter.matches(&insert));
/// assert!(!filter.matches(&delete));
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    stages: Vec<CompiledStage>,
}

impl EventFilter {
    /// Compile a filter from its serialized stages
    ///
    /// # Errors
    ///
    /// Returns an error if a `field_matches` pattern is not a valid regex
    pub fn new(stages: Vec<FilterStage>) -> Result<Self> {
        let stages = stages
            .iter()
            .map(CompiledStage::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { stages })
    }

    /// Returns true if every stage accepts the event
    ///
    /// A filter with no stages accepts everything.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.stages.iter().all(|stage| stage.accepts(event))
    }

    /// Number of compiled stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the filter has no stages
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Get filter summary for logging
    pub fn summary(&self) -> String {
        if self.stages.is_empty() {
            return "no filters (all events)".to_string();
        }
        self.stages
            .iter()
            .map(CompiledStage::describe)
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}
