//! Stream consumer loop
//!
//! One sequential task owns the subscription, the commit tracker and the
//! checkpoint store. Delivery workers pull tasks from a bounded queue and
//! report completions back over a channel, so every state change happens on
//! the loop task.
//!
//! ```text
//! source ──► consumer loop ──► filter ──► queue ──► workers ──► target
//!                 ▲                                   │
//!                 └──────────── completions ◄─────────┘
//! ```

use super::CommitTracker;
use crate::checkpoint::CheckpointStore;
use crate::config::{Config, PayloadConfig, StartFrom};
use crate::delivery::{BackoffPolicy, Dispatcher, NotificationTask, TaskResolution};
use crate::error::{Result, StreamhookError};
use crate::event::{ChangeEvent, ResumePosition};
use crate::filter::EventFilter;
use crate::metrics;
use crate::source::{ChangeSource, SourceError, SubscribeFrom};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Runtime settings for the consumer loop
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Subscription name
    pub subscription: String,
    /// Start policy when no checkpoint exists
    pub start_from: StartFrom,
    /// Endpoint recorded on each task
    pub target_endpoint: String,
    /// Payload redaction
    pub payload: PayloadConfig,
    /// Bounded queue capacity
    pub queue_capacity: usize,
    /// Delivery worker count
    pub workers: usize,
    /// Time allowed for in-flight tasks on shutdown
    pub shutdown_timeout: Duration,
    /// Reconnect delay policy
    pub reconnect: BackoffPolicy,
    /// Reconnect attempts before reporting degraded
    pub max_reconnect_attempts: Option<u32>,
    /// Log full event documents
    pub include_payload: bool,
}

impl ConsumerSettings {
    /// Settings described by `config`
    pub fn from_config(config: &Config) -> Self {
        Self {
            subscription: config.subscription.clone(),
            start_from: config.source.start_from,
            target_endpoint: config.target.endpoint.clone(),
            payload: config.payload.clone(),
            queue_capacity: config.pipeline.queue_capacity.max(1),
            workers: config.pipeline.workers.max(1),
            shutdown_timeout: Duration::from_millis(config.pipeline.shutdown_timeout_ms),
            reconnect: BackoffPolicy::from_config(&config.delivery),
            max_reconnect_attempts: config.source.max_reconnect_attempts,
            include_payload: config.logging.include_payload,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Counters reported when the loop stops cleanly
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Events read from the source (duplicates excluded)
    pub events_received: u64,
    /// Events that passed the filter
    pub events_matched: u64,
    /// Tasks delivered
    pub delivered: u64,
    /// Tasks dead-lettered
    pub dead_lettered: u64,
    /// Resubscribe attempts
    pub reconnects: u64,
    /// Last committed position
    pub committed: Option<ResumePosition>,
}

struct Completion {
    position: ResumePosition,
    result: Result<TaskResolution>,
}

enum Exit {
    Cancelled,
    SourceEnded,
    Failed(anyhow::Error),
}

/// Commit frontier plus the store it is persisted to
struct Progress<'a> {
    tracker: CommitTracker,
    checkpoints: Arc<dyn CheckpointStore>,
    subscription: &'a str,
    outstanding: usize,
    summary: RunSummary,
}

impl<'a> Progress<'a> {
    fn new(
        committed: Option<ResumePosition>,
        checkpoints: Arc<dyn CheckpointStore>,
        subscription: &'a str,
    ) -> Self {
        Self {
            tracker: CommitTracker::new(committed),
            checkpoints,
            subscription,
            outstanding: 0,
            summary: RunSummary {
                committed,
                ..Default::default()
            },
        }
    }

    async fn finish(&mut self, position: ResumePosition) -> Result<()> {
        self.tracker.complete(position);
        self.commit().await
    }

    /// Persist the contiguous frontier; the tracker only moves once saved
    async fn commit(&mut self) -> Result<()> {
        if let Some(position) = self.tracker.ready() {
            let store = Arc::clone(&self.checkpoints);
            tokio::task::spawn_blocking(move || store.save(position))
                .await
                .map_err(|e| {
                    StreamhookError::Checkpoint(format!("Checkpoint write panicked: {}", e))
                })?
                .map_err(|e| {
                    StreamhookError::Checkpoint(format!(
                        "Failed to commit position {}: {}",
                        position, e
                    ))
                })?;
            self.tracker.commit(position);
            self.summary.committed = Some(position);
            metrics::record_checkpoint_saved(self.subscription);
            debug!(position = %position, "Checkpoint committed");
        }
        Ok(())
    }

    async fn on_completion(&mut self, completion: Completion) -> Result<()> {
        self.outstanding = self.outstanding.saturating_sub(1);
        match completion.result? {
            TaskResolution::Delivered { .. } => self.summary.delivered += 1,
            TaskResolution::DeadLettered { .. } => self.summary.dead_lettered += 1,
        }
        self.finish(completion.position).await
    }
}

/// Consumes a change stream and drives events through filter, dispatcher
/// and checkpoint
pub struct StreamConsumer {
    source: Arc<dyn ChangeSource>,
    filter: EventFilter,
    dispatcher: Dispatcher,
    checkpoints: Arc<dyn CheckpointStore>,
    settings: ConsumerSettings,
}

impl StreamConsumer {
    /// Create a consumer
    pub fn new(
        source: Arc<dyn ChangeSource>,
        filter: EventFilter,
        dispatcher: Dispatcher,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            source,
            filter,
            dispatcher,
            checkpoints,
            settings,
        }
    }

    /// Run until cancelled, the source ends, or a fatal error occurs
    ///
    /// On cancellation or source end the queue is closed and in-flight
    /// tasks get `shutdown_timeout` to finish before the final checkpoint.
    ///
    /// # Errors
    ///
    /// - `StreamhookError::ResumePositionExpired` if the stored position is
    ///   outside the source's retention window
    /// - `StreamhookError::Checkpoint` if a checkpoint could not be loaded
    ///   or saved
    /// - `StreamhookError::DeadLetter` if a dead-letter record could not be
    ///   written
    /// - `StreamhookError::ShutdownTimeout` if in-flight tasks were abandoned
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        let settings = &self.settings;
        let stored = self.checkpoints.load()?;
        let initial = SubscribeFrom::resolve(stored, settings.start_from);

        info!(
            subscription = %settings.subscription,
            source = %self.source.describe(),
            target = %self.dispatcher.target_description(),
            filter = %self.filter.summary(),
            from = %initial,
            workers = settings.workers,
            "Starting stream consumer"
        );

        let (task_tx, task_rx) = mpsc::channel::<NotificationTask>(settings.queue_capacity);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut workers = spawn_workers(settings.workers, &self.dispatcher, task_rx, done_tx);

        let mut progress = Progress::new(
            stored,
            Arc::clone(&self.checkpoints),
            &settings.subscription,
        );
        let exit = self
            .consume(&cancel, &task_tx, &mut done_rx, &mut progress, initial)
            .await;
        drop(task_tx);

        match exit {
            Exit::Failed(e) => {
                workers.abort_all();
                error!(error = %e, committed = ?progress.summary.committed, "Stream consumer failed");
                Err(e)
            }
            Exit::Cancelled | Exit::SourceEnded => {
                if matches!(exit, Exit::SourceEnded) {
                    info!("Change source ended");
                } else {
                    info!("Shutdown requested");
                }
                self.drain(&mut done_rx, &mut progress, &mut workers).await?;
                Ok(progress.summary)
            }
        }
    }

    async fn consume(
        &self,
        cancel: &CancellationToken,
        task_tx: &mpsc::Sender<NotificationTask>,
        done_rx: &mut mpsc::UnboundedReceiver<Completion>,
        progress: &mut Progress<'_>,
        initial: SubscribeFrom,
    ) -> Exit {
        let mut last_received = progress.tracker.committed();
        let mut failures: u32 = 0;

        loop {
            let from = last_received.map_or(initial, SubscribeFrom::After);
            let subscribed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Exit::Cancelled,
                result = self.source.subscribe(from) => result,
            };

            let mut stream = match subscribed {
                Ok(stream) => {
                    info!(from = %from, "Subscribed to change source");
                    stream
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if let Some(exit) = self.pause(failures, &e, cancel, done_rx, progress).await {
                        return exit;
                    }
                    continue;
                }
                Err(e) => return Exit::Failed(StreamhookError::from(e).into()),
            };

            let source_error = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Exit::Cancelled,
                    Some(done) = done_rx.recv() => {
                        if let Err(e) = progress.on_completion(done).await {
                            return Exit::Failed(e);
                        }
                    }
                    item = stream.next() => match item {
                        None => return Exit::SourceEnded,
                        Some(Ok(event)) => {
                            if last_received.is_some_and(|last| event.position <= last) {
                                debug!(position = %event.position, "Skipping duplicate event");
                                continue;
                            }
                            last_received = Some(event.position);
                            failures = 0;

                            let span = info_span!(
                                "event",
                                position = %event.position,
                                operation_type = %event.operation_type
                            );
                            if let Some(exit) = self
                                .on_event(event, cancel, task_tx, progress)
                                .instrument(span)
                                .await
                            {
                                return exit;
                            }
                        }
                        Some(Err(e)) => break e,
                    }
                }
            };

            if !source_error.is_transient() {
                return Exit::Failed(StreamhookError::from(source_error).into());
            }
            failures += 1;
            if let Some(exit) = self
                .pause(failures, &source_error, cancel, done_rx, progress)
                .await
            {
                return exit;
            }
        }
    }

    async fn on_event(
        &self,
        event: ChangeEvent,
        cancel: &CancellationToken,
        task_tx: &mpsc::Sender<NotificationTask>,
        progress: &mut Progress<'_>,
    ) -> Option<Exit> {
        let subscription = self.settings.subscription.as_str();
        progress.summary.events_received += 1;
        metrics::record_event_received(subscription);
        if self.settings.include_payload {
            debug!(document = %event.document, "Change event received");
        } else {
            debug!("Change event received");
        }

        progress.tracker.register(event.position);
        let matched = self.filter.matches(&event);
        metrics::record_filter_result(subscription, matched);

        if !matched {
            trace!("Event filtered out");
            return progress.finish(event.position).await.err().map(Exit::Failed);
        }
        progress.summary.events_matched += 1;

        let task = NotificationTask::from_event(
            &event,
            subscription,
            &self.settings.target_endpoint,
            &self.settings.payload,
        );
        debug!(dedup_id = %task.dedup_id, "Queueing notification");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Some(Exit::Cancelled),
            sent = task_tx.send(task) => match sent {
                Ok(()) => {
                    progress.outstanding += 1;
                    None
                }
                Err(_) => Some(Exit::Failed(
                    StreamhookError::Delivery("delivery workers stopped".to_string()).into(),
                )),
            },
        }
    }

    /// Wait out the reconnect delay while still committing completions
    async fn pause(
        &self,
        failures: u32,
        cause: &SourceError,
        cancel: &CancellationToken,
        done_rx: &mut mpsc::UnboundedReceiver<Completion>,
        progress: &mut Progress<'_>,
    ) -> Option<Exit> {
        let settings = &self.settings;
        progress.summary.reconnects += 1;
        metrics::record_source_reconnect(&settings.subscription);

        let degraded = settings
            .max_reconnect_attempts
            .is_some_and(|max| failures > max);
        let delay = if degraded {
            settings.reconnect.cap
        } else {
            settings.reconnect.delay(failures)
        };

        if degraded {
            error!(
                attempt = failures,
                error = %cause,
                retry_in_ms = delay.as_millis() as u64,
                "Change source degraded: reconnect budget exhausted, still retrying"
            );
        } else {
            warn!(
                attempt = failures,
                error = %cause,
                retry_in_ms = delay.as_millis() as u64,
                "Change source unavailable, reconnecting"
            );
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Some(Exit::Cancelled),
                Some(done) = done_rx.recv() => {
                    if let Err(e) = progress.on_completion(done).await {
                        return Some(Exit::Failed(e));
                    }
                }
                _ = &mut sleep => return None,
            }
        }
    }

    async fn drain(
        &self,
        done_rx: &mut mpsc::UnboundedReceiver<Completion>,
        progress: &mut Progress<'_>,
        workers: &mut JoinSet<()>,
    ) -> Result<()> {
        let timeout = self.settings.shutdown_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        if progress.outstanding > 0 {
            info!(
                in_flight = progress.outstanding,
                timeout_ms = timeout.as_millis() as u64,
                "Waiting for in-flight deliveries"
            );
        }

        let mut timed_out = false;
        while progress.outstanding > 0 {
            tokio::select! {
                done = done_rx.recv() => match done {
                    Some(done) => progress.on_completion(done).await?,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
            }
        }

        workers.abort_all();
        progress.commit().await?;

        if timed_out {
            warn!(
                in_flight = progress.outstanding,
                committed = ?progress.summary.committed,
                "Shutdown timed out; abandoned tasks will be replayed on restart"
            );
            return Err(StreamhookError::ShutdownTimeout {
                timeout_ms: timeout.as_millis() as u64,
                in_flight: progress.outstanding,
            }
            .into());
        }

        info!(
            committed = ?progress.summary.committed,
            delivered = progress.summary.delivered,
            dead_lettered = progress.summary.dead_lettered,
            "Stream consumer stopped"
        );
        Ok(())
    }
}

fn spawn_workers(
    count: usize,
    dispatcher: &Dispatcher,
    queue: mpsc::Receiver<NotificationTask>,
    done: mpsc::UnboundedSender<Completion>,
) -> JoinSet<()> {
    let queue = Arc::new(Mutex::new(queue));
    let mut workers = JoinSet::new();

    for worker in 0..count {
        let dispatcher = dispatcher.clone();
        let queue = Arc::clone(&queue);
        let done = done.clone();

        workers.spawn(async move {
            loop {
                let next = queue.lock().await.recv().await;
                let Some(task) = next else { break };

                let position = task.position;
                let span = info_span!(
                    "deliver",
                    worker,
                    position = %position,
                    dedup_id = %task.dedup_id
                );
                let result = dispatcher.deliver(task).instrument(span).await;
                if done.send(Completion { position, result }).is_err() {
                    break;
                }
            }
            trace!(worker, "Delivery worker stopped");
        });
    }

    workers
}
