//! In-process change source
//!
//! `MemorySource` replays a scripted log. It can simulate the failure modes a
//! real change stream has: subscriptions that fail, streams that drop after
//! a number of events, and retention truncation that expires old positions.

use super::{ChangeSource, ChangeStream, SourceError, SubscribeFrom};
use crate::event::{ChangeEvent, ResumePosition};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<ChangeEvent>,
    truncated_through: Option<ResumePosition>,
    disconnects: VecDeque<usize>,
    failing_subscribes: usize,
    subscriptions: Vec<SubscribeFrom>,
}

/// Scripted change source
///
/// # Examples
///
/// ```
/// use streamhook::event::{ChangeEvent, OperationType};
/// use streamhook::source::{ChangeSource, MemorySource, SubscribeFrom};
/// use futures::StreamExt;
///
/// # tokio_test::block_on(async {
/// let source = MemorySource::new(vec![
///     ChangeEvent::new(1, OperationType::Insert, serde_json::json!({})),
///     ChangeEvent::new(2, OperationType::Insert, serde_json::json!({})),
/// ]);
/// let events: Vec<_> = source.subscribe(SubscribeFrom::Earliest).await.unwrap().collect().await;
/// assert_eq!(events.len(), 2);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MemorySource {
    state: Mutex<MemoryState>,
    live: bool,
}

impl MemorySource {
    /// Create a finite source whose streams end after the last event
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                events,
                ..Default::default()
            }),
            live: false,
        }
    }

    /// Keep streams open after the last event, like a real change stream
    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event to the log (seen by later subscriptions)
    pub fn push(&self, event: ChangeEvent) {
        self.state().events.push(event);
    }

    /// Drop every event at or below `position` from retention
    pub fn truncate_through(&self, position: ResumePosition) {
        let mut state = self.state();
        state.events.retain(|e| e.position > position);
        state.truncated_through = Some(
            state
                .truncated_through
                .map_or(position, |current| current.max(position)),
        );
    }

    /// The next subscription yields `count` events and then disconnects
    ///
    /// Calls queue up; each applies to one future subscription.
    pub fn disconnect_after(&self, count: usize) {
        self.state().disconnects.push_back(count);
    }

    /// The next `count` subscribe calls fail with a transient error
    pub fn fail_next_subscribes(&self, count: usize) {
        self.state().failing_subscribes += count;
    }

    /// Every subscribe call made so far
    pub fn subscriptions(&self) -> Vec<SubscribeFrom> {
        self.state().subscriptions.clone()
    }
}

#[async_trait]
impl ChangeSource for MemorySource {
    async fn subscribe(&self, from: SubscribeFrom) -> Result<ChangeStream, SourceError> {
        let mut state = self.state();
        state.subscriptions.push(from);

        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(SourceError::Transient("connection refused".to_string()));
        }

        let events: Vec<ChangeEvent> = match from {
            SubscribeFrom::After(position) => {
                if let Some(floor) = state.truncated_through.filter(|floor| *floor > position) {
                    return Err(SourceError::PositionExpired {
                        position,
                        message: format!("events through {} have been truncated", floor),
                    });
                }
                state
                    .events
                    .iter()
                    .filter(|e| e.position > position)
                    .cloned()
                    .collect()
            }
            SubscribeFrom::Earliest => state.events.clone(),
            SubscribeFrom::Latest => Vec::new(),
        };

        if let Some(count) = state.disconnects.pop_front() {
            let head: Vec<_> = events.into_iter().take(count).map(Ok).collect();
            let tail = stream::once(async {
                Err(SourceError::Transient("stream reset by peer".to_string()))
            });
            return Ok(stream::iter(head).chain(tail).boxed());
        }

        let head = stream::iter(events.into_iter().map(Ok));
        if self.live {
            Ok(head.chain(stream::pending()).boxed())
        } else {
            Ok(head.boxed())
        }
    }

    fn describe(&self) -> String {
        format!("memory ({} events)", self.state().events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OperationType;
    use serde_json::json;

    fn log(positions: &[u64]) -> Vec<ChangeEvent> {
        positions
            .iter()
            .map(|p| ChangeEvent::new(*p, OperationType::Insert, json!({"n": p})))
            .collect()
    }

    async fn positions(stream: ChangeStream) -> Vec<Result<u64, SourceError>> {
        stream.map(|r| r.map(|e| e.position.value())).collect().await
    }

    #[tokio::test]
    async fn test_subscribe_after_position() {
        let source = MemorySource::new(log(&[1, 2, 3, 4]));
        let stream = source
            .subscribe(SubscribeFrom::After(ResumePosition(2)))
            .await
            .unwrap();
        assert_eq!(positions(stream).await, vec![Ok(3), Ok(4)]);
    }

    #[tokio::test]
    async fn test_subscribe_latest_skips_existing() {
        let source = MemorySource::new(log(&[1, 2]));
        let stream = source.subscribe(SubscribeFrom::Latest).await.unwrap();
        assert!(positions(stream).await.is_empty());
    }

    #[tokio::test]
    async fn test_truncation_expires_old_positions() {
        let source = MemorySource::new(log(&[1, 2, 3, 4]));
        source.truncate_through(ResumePosition(2));

        let err = source
            .subscribe(SubscribeFrom::After(ResumePosition(1)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::PositionExpired { .. }));

        let stream = source
            .subscribe(SubscribeFrom::After(ResumePosition(2)))
            .await
            .unwrap();
        assert_eq!(positions(stream).await, vec![Ok(3), Ok(4)]);
    }

    #[tokio::test]
    async fn test_disconnect_after() {
        let source = MemorySource::new(log(&[1, 2, 3]));
        source.disconnect_after(1);

        let first = positions(source.subscribe(SubscribeFrom::Earliest).await.unwrap()).await;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0], Ok(1));
        assert!(matches!(first[1], Err(SourceError::Transient(_))));

        let second = positions(
            source
                .subscribe(SubscribeFrom::After(ResumePosition(1)))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(second, vec![Ok(2), Ok(3)]);
    }

    #[tokio::test]
    async fn test_failing_subscribes_are_recorded() {
        let source = MemorySource::new(log(&[1]));
        source.fail_next_subscribes(2);

        assert!(source.subscribe(SubscribeFrom::Earliest).await.is_err());
        assert!(source.subscribe(SubscribeFrom::Earliest).await.is_err());
        assert!(source.subscribe(SubscribeFrom::Earliest).await.is_ok());
        assert_eq!(source.subscriptions().len(), 3);
    }
}
