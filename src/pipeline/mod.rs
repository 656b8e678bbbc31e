//! Change-event pipeline
//!
//! [`StreamConsumer`] ties a change source, an event filter, the delivery
//! dispatcher and a checkpoint store together. [`CommitTracker`] decides how
//! far the checkpoint may advance.

pub mod consumer;
pub mod reorder;

pub use consumer::{ConsumerSettings, RunSummary, StreamConsumer};
pub use reorder::CommitTracker;
