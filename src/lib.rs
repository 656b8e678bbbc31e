//! Streamhook - durable change-event notification library
//!
//! This library follows an ordered change stream, filters events, delivers
//! notifications with retry and dead-lettering, and checkpoints a resume
//! position so a restarted process neither skips nor silently drops events.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `source`: Change-event sources (file change log, HTTP feed, in-memory)
//! - `filter`: Ordered predicate stages applied to each event
//! - `delivery`: Notification tasks, targets, backoff and the retrying dispatcher
//! - `pipeline`: The stream consumer loop and commit frontier tracking
//! - `checkpoint`: Durable resume-position stores
//! - `deadletter`: Durable store of undeliverable notifications
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use streamhook::commands::run::build_consumer;
//! use streamhook::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/streamhook.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let consumer = build_consumer(&config, false)?;
//!     let summary = consumer.run(CancellationToken::new()).await?;
//!     println!("committed through {:?}", summary.committed);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod cli;
pub mod commands;
pub mod config;
pub mod deadletter;
pub mod delivery;
pub mod error;
pub mod event;
pub mod filter;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod source;

// Re-export commonly used types
pub use checkpoint::CheckpointStore;
pub use config::Config;
pub use deadletter::{DeadLetterRecord, DeadLetterSink};
pub use delivery::{DeliveryOutcome, Dispatcher, NotificationTarget, NotificationTask};
pub use error::{Result, StreamhookError};
pub use event::{ChangeEvent, OperationType, ResumePosition};
pub use filter::EventFilter;
pub use pipeline::{RunSummary, StreamConsumer};
pub use source::{ChangeSource, SourceError, SubscribeFrom};
