//! Error types for Streamhook
//!
//! This module defines the crate-wide error type used by the consumer loop,
//! the stores, and the operator commands, using `thiserror` for ergonomic
//! error handling.

use thiserror::Error;

/// Main error type for Streamhook operations
///
/// Fatal pipeline conditions (an expired resume position, a checkpoint or
/// dead-letter write that could not be made durable) are distinct variants
/// so callers can downcast and react to them.
#[derive(Error, Debug)]
pub enum StreamhookError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Change source errors that are not retried by the consumer loop
    #[error("Source error: {0}")]
    Source(String),

    /// The stored resume position is no longer retrievable from the source
    ///
    /// Requires an operator to choose a new start point; the consumer loop
    /// never resumes from an arbitrary position on its own.
    #[error("Resume position {position} is no longer available from the source: {message}")]
    ResumePositionExpired {
        /// The position the loop attempted to resume from
        position: String,
        /// Source-provided detail
        message: String,
    },

    /// Checkpoint store errors (load or durable save failed)
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Dead-letter sink errors
    #[error("Dead-letter error: {0}")]
    DeadLetter(String),

    /// Notification target errors outside the normal delivery classification
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Shutdown did not complete within the configured timeout
    #[error("Shutdown timed out after {timeout_ms}ms with {in_flight} task(s) in flight")]
    ShutdownTimeout {
        /// Configured shutdown timeout in milliseconds
        timeout_ms: u64,
        /// Number of tasks that had not reached a terminal state
        in_flight: usize,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for Streamhook operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = StreamhookError::Config("invalid format".to_string());
        assert_eq!(error.to_string(), "Configuration error: invalid format");
    }

    #[test]
    fn test_resume_position_expired_display() {
        let error = StreamhookError::ResumePositionExpired {
            position: "42".to_string(),
            message: "oldest retained is 100".to_string(),
        };
        let s = error.to_string();
        assert!(s.contains("Resume position 42"));
        assert!(s.contains("oldest retained is 100"));
    }

    #[test]
    fn test_checkpoint_error_display() {
        let error = StreamhookError::Checkpoint("disk full".to_string());
        assert_eq!(error.to_string(), "Checkpoint error: disk full");
    }

    #[test]
    fn test_dead_letter_error_display() {
        let error = StreamhookError::DeadLetter("database locked".to_string());
        assert_eq!(error.to_string(), "Dead-letter error: database locked");
    }

    #[test]
    fn test_shutdown_timeout_display() {
        let error = StreamhookError::ShutdownTimeout {
            timeout_ms: 30_000,
            in_flight: 2,
        };
        assert_eq!(
            error.to_string(),
            "Shutdown timed out after 30000ms with 2 task(s) in flight"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: StreamhookError = io_error.into();
        assert!(matches!(error, StreamhookError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{invalid json}").unwrap_err();
        let error: StreamhookError = json_error.into();
        assert!(matches!(error, StreamhookError::Serialization(_)));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: : yaml").unwrap_err();
        let error: StreamhookError = yaml_error.into();
        assert!(matches!(error, StreamhookError::Yaml(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StreamhookError>();
    }

    #[test]
    fn test_anyhow_downcast_preserves_variant() {
        let err: anyhow::Error = StreamhookError::Checkpoint("boom".to_string()).into();
        assert!(matches!(
            err.downcast_ref::<StreamhookError>(),
            Some(StreamhookError::Checkpoint(_))
        ));
    }
}
