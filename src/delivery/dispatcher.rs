//! Retrying dispatcher
//!
//! [`Dispatcher::deliver`] drives one task to a terminal state. Retryable
//! failures wait out the backoff and try again until `max_attempts` is
//! reached; permanent failures go straight to the dead-letter sink. A
//! dead-letter write that fails is returned as an error, because the task
//! has then not reached a terminal state and its position must not be
//! committed.

use super::{BackoffPolicy, DeliveryOutcome, NotificationTarget, NotificationTask, TaskResolution};
use crate::config::DeliveryConfig;
use crate::deadletter::{DeadLetterRecord, DeadLetterSink};
use crate::error::{Result, StreamhookError};
use crate::metrics::{self, DeliveryMetrics};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Delivers tasks to a target with retry and dead-lettering
#[derive(Clone)]
pub struct Dispatcher {
    target: Arc<dyn NotificationTarget>,
    dead_letters: Arc<dyn DeadLetterSink>,
    backoff: BackoffPolicy,
    max_attempts: u32,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        target: Arc<dyn NotificationTarget>,
        dead_letters: Arc<dyn DeadLetterSink>,
        backoff: BackoffPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            target,
            dead_letters,
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Create a dispatcher using the configured retry policy
    pub fn from_config(
        target: Arc<dyn NotificationTarget>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: &DeliveryConfig,
    ) -> Self {
        Self::new(
            target,
            dead_letters,
            BackoffPolicy::from_config(config),
            config.max_attempts,
        )
    }

    /// Target description for logs
    pub fn target_description(&self) -> String {
        self.target.describe()
    }

    /// Make a single attempt, without retrying
    pub async fn dispatch(&self, task: &NotificationTask) -> DeliveryOutcome {
        let metrics = DeliveryMetrics::start(&task.subscription);
        let outcome = self.target.send(task).await;
        metrics.record_outcome(outcome.label());

        debug!(
            dedup_id = %task.dedup_id,
            position = %task.position,
            attempt = task.attempts,
            outcome = %outcome,
            elapsed_ms = metrics.elapsed().as_millis() as u64,
            "Delivery attempt finished"
        );
        outcome
    }

    /// Deliver `task` until it is delivered or dead-lettered
    ///
    /// # Errors
    ///
    /// Returns `StreamhookError::DeadLetter` if the dead-letter record
    /// could not be written
    pub async fn deliver(&self, mut task: NotificationTask) -> Result<TaskResolution> {
        loop {
            task.attempts += 1;
            task.next_retry_at = None;

            match self.dispatch(&task).await {
                DeliveryOutcome::Delivered => {
                    info!(
                        dedup_id = %task.dedup_id,
                        position = %task.position,
                        attempts = task.attempts,
                        "Notification delivered"
                    );
                    return Ok(TaskResolution::Delivered {
                        attempts: task.attempts,
                    });
                }
                DeliveryOutcome::Permanent(reason) => {
                    return self.dead_letter(task, reason, "permanent").await;
                }
                DeliveryOutcome::Retryable(reason) => {
                    if task.attempts >= self.max_attempts {
                        let reason = format!(
                            "retries exhausted after {} attempts: {}",
                            task.attempts, reason
                        );
                        return self.dead_letter(task, reason, "exhausted").await;
                    }

                    let delay = self.backoff.delay(task.attempts);
                    task.next_retry_at = chrono::Duration::from_std(delay)
                        .ok()
                        .map(|d| Utc::now() + d);
                    warn!(
                        dedup_id = %task.dedup_id,
                        position = %task.position,
                        attempt = task.attempts,
                        max_attempts = self.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        task: NotificationTask,
        reason: String,
        kind: &'static str,
    ) -> Result<TaskResolution> {
        let record = DeadLetterRecord::new(task, reason);
        let record_id = record.id.clone();
        let sink = Arc::clone(&self.dead_letters);

        let written = tokio::task::spawn_blocking(move || sink.record(&record).map(|_| record))
            .await
            .map_err(|e| StreamhookError::DeadLetter(format!("Dead-letter write panicked: {}", e)))?;

        match written {
            Ok(record) => {
                metrics::record_dead_letter(&record.task.subscription, kind);
                warn!(
                    record_id = %record.id,
                    dedup_id = %record.task.dedup_id,
                    position = %record.task.position,
                    attempts = record.attempts,
                    reason = %record.reason,
                    "Notification dead-lettered"
                );
                Ok(TaskResolution::DeadLettered { record_id })
            }
            Err(e) => {
                error!(record_id = %record_id, error = %e, "Failed to write dead letter");
                Err(StreamhookError::DeadLetter(format!(
                    "Failed to record dead letter {}: {}",
                    record_id, e
                ))
                .into())
            }
        }
    }
}
