//! End-to-end consumer tests against the durable stores
//!
//! These use the file checkpoint store and the SQLite dead-letter sink so
//! that restart behaviour is exercised through real persistence.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use streamhook::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use streamhook::deadletter::DeadLetterSink;
use streamhook::delivery::{dedup_id, BackoffPolicy, DeliveryOutcome, Dispatcher, RecordingTarget};
use streamhook::filter::EventFilter;
use streamhook::pipeline::StreamConsumer;
use streamhook::source::MemorySource;
use streamhook::ResumePosition;
use tokio_util::sync::CancellationToken;

mod common;
use common::{consumer, create_temp_stores, inserts, run_to_end, settings};

fn retryable() -> DeliveryOutcome {
    DeliveryOutcome::Retryable("503 Service Unavailable".to_string())
}

#[tokio::test]
async fn test_delivers_in_source_order_and_checkpoints() {
    let stores = create_temp_stores("orders");
    let source = Arc::new(MemorySource::new(inserts(1..=8)));
    let target = Arc::new(RecordingTarget::new());

    let summary = run_to_end(consumer(source, target.clone(), &stores, "orders")).await;

    assert_eq!(target.attempted_positions(), (1..=8).collect::<Vec<_>>());
    assert_eq!(summary.delivered, 8);
    assert_eq!(stores.checkpoints.load().unwrap(), Some(ResumePosition(8)));
}

#[tokio::test]
async fn test_crash_and_restart_replays_a_superset() {
    let stores = create_temp_stores("orders");

    let slow = Arc::new(RecordingTarget::new().with_latency(Duration::from_millis(20)));
    let live = Arc::new(MemorySource::new(inserts(1..=10)).live());
    let first = consumer(live, slow.clone(), &stores, "orders");
    let handle = tokio::spawn(async move { first.run(CancellationToken::new()).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while slow.attempted_positions().len() < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first run made no progress");

    // Simulated crash: no drain, no final checkpoint
    handle.abort();
    let _ = handle.await;

    let committed = stores.checkpoints.load().unwrap().map_or(0, |p| p.value());
    let delivered_before: BTreeSet<u64> = slow.attempted_positions().into_iter().collect();
    assert!(delivered_before.len() as u64 >= committed);

    let fast = Arc::new(RecordingTarget::new());
    let source = Arc::new(MemorySource::new(inserts(1..=10)));
    run_to_end(consumer(source, fast.clone(), &stores, "orders")).await;

    let replayed = fast.attempted_positions();
    assert_eq!(replayed, (committed + 1..=10).collect::<Vec<_>>());

    let all: BTreeSet<u64> = delivered_before.into_iter().chain(replayed).collect();
    assert_eq!(all, (1..=10).collect::<BTreeSet<_>>());
    assert_eq!(stores.checkpoints.load().unwrap(), Some(ResumePosition(10)));
}

#[tokio::test]
async fn test_exhausted_retries_produce_one_dead_letter() {
    let stores = create_temp_stores("orders");
    let target = Arc::new(RecordingTarget::new());
    target.script(3, std::iter::repeat(retryable()).take(5));

    let source = Arc::new(MemorySource::new(inserts(1..=5)));
    let summary = run_to_end(consumer(source, target.clone(), &stores, "orders")).await;

    let attempts_for_3 = target
        .attempted_positions()
        .into_iter()
        .filter(|p| *p == 3)
        .count();
    assert_eq!(attempts_for_3, 5);
    assert_eq!(summary.dead_lettered, 1);

    let records = stores.dead_letters.list(None).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].task.position, ResumePosition(3));
    assert_eq!(records[0].attempts, 5);
    assert_eq!(stores.checkpoints.load().unwrap(), Some(ResumePosition(5)));

    // Dead letters are not picked up again by a later run
    let again = Arc::new(RecordingTarget::new());
    let source = Arc::new(MemorySource::new(inserts(1..=5)));
    run_to_end(consumer(source, again.clone(), &stores, "orders")).await;
    assert!(again.attempted_positions().is_empty());
    assert_eq!(stores.dead_letters.count().unwrap(), 1);
}

#[tokio::test]
async fn test_permanent_failure_is_dead_lettered_without_delay() {
    let stores = create_temp_stores("orders");
    let target = Arc::new(RecordingTarget::new());
    target.script(2, [DeliveryOutcome::Permanent("400 Bad Request".to_string())]);

    // Any scheduled retry would outlive the timeout below
    let slow = BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(30), 0.0);
    let dispatcher = Dispatcher::new(target.clone(), stores.dead_letters.clone(), slow, 5);
    let checkpoints: Arc<dyn CheckpointStore> = stores.checkpoints.clone();
    let consumer = StreamConsumer::new(
        Arc::new(MemorySource::new(inserts(1..=3))),
        EventFilter::default(),
        dispatcher,
        checkpoints,
        settings("orders"),
    );

    tokio::time::timeout(Duration::from_secs(2), consumer.run(CancellationToken::new()))
        .await
        .expect("permanent failure waited for backoff")
        .unwrap();

    assert_eq!(target.attempted_positions(), vec![1, 2, 3]);
    let records = stores.dead_letters.list(None).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 1);
    assert_eq!(records[0].task.position, ResumePosition(2));
}

#[tokio::test]
async fn test_dedup_id_is_stable_across_runs() {
    let stores = create_temp_stores("orders");

    let first = Arc::new(RecordingTarget::new());
    run_to_end(consumer(
        Arc::new(MemorySource::new(inserts(1..=3))),
        first.clone(),
        &stores,
        "orders",
    ))
    .await;

    stores.checkpoints.clear().unwrap();

    let second = Arc::new(RecordingTarget::new());
    run_to_end(consumer(
        Arc::new(MemorySource::new(inserts(1..=3))),
        second.clone(),
        &stores,
        "orders",
    ))
    .await;

    let ids = |target: &RecordingTarget| -> Vec<String> {
        target.calls().into_iter().map(|t| t.dedup_id).collect()
    };
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(ids(&first)[1], dedup_id("orders", ResumePosition(2)));
}

#[tokio::test]
async fn test_checkpoint_waits_for_dead_letter_of_failed_event() {
    let stores = create_temp_stores("gaps");
    let memory = Arc::new(MemoryCheckpointStore::new());
    let target = Arc::new(RecordingTarget::new());
    target.script(2, [DeliveryOutcome::Permanent("422 Unprocessable Entity".to_string())]);

    let dispatcher = Dispatcher::new(
        target.clone(),
        stores.dead_letters.clone(),
        common::fast_backoff(),
        5,
    );
    let checkpoints: Arc<dyn CheckpointStore> = memory.clone();
    let consumer = StreamConsumer::new(
        Arc::new(MemorySource::new(inserts(1..=3))),
        EventFilter::default(),
        dispatcher,
        checkpoints,
        settings("gaps"),
    );
    run_to_end(consumer).await;

    let history: Vec<u64> = memory.history().iter().map(|p| p.value()).collect();
    assert_eq!(history, vec![1, 2, 3]);

    let records = stores.dead_letters.list(None).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].task.position, ResumePosition(2));
}
