//! Dead-letter operator commands
//!
//! Dead letters are never consumed automatically; these commands are the
//! only way records leave the sink.

use crate::cli::DlqCommand;
use crate::config::Config;
use crate::deadletter::{open_sink, DeadLetterRecord, DeadLetterSink};
use crate::delivery::{build_target, DeliveryOutcome, Dispatcher, NotificationTarget};
use crate::error::{Result, StreamhookError};
use prettytable::{format, Table};
use std::sync::Arc;

/// Handle dead-letter commands against the configured sink and target
pub async fn handle_dlq(config: &Config, command: DlqCommand) -> Result<()> {
    let sink = open_sink(config)?;
    let output = match command {
        DlqCommand::Replay { id } => {
            let target = build_target(&config.target)?;
            let dispatcher = Dispatcher::from_config(target, Arc::clone(&sink), &config.delivery);
            replay(&dispatcher, sink.as_ref(), &id).await?
        }
        other => execute(sink.as_ref(), other)?,
    };
    println!("{}", output);
    Ok(())
}

fn execute(sink: &dyn DeadLetterSink, command: DlqCommand) -> Result<String> {
    match command {
        DlqCommand::List { json, limit } => {
            let records = sink.list(limit)?;
            if json {
                return Ok(serde_json::to_string_pretty(&records)?);
            }
            if records.is_empty() {
                return Ok("No dead-lettered notifications.".to_string());
            }
            Ok(render_table(&records))
        }
        DlqCommand::Show { id } => {
            let record = find(sink, &id)?;
            Ok(serde_json::to_string_pretty(&record)?)
        }
        DlqCommand::Purge { id: Some(id), .. } => {
            let record = find(sink, &id)?;
            sink.purge(&record.id)?;
            tracing::info!(record_id = %record.id, position = %record.task.position, "Dead letter purged");
            Ok(format!("Purged {}", record.id))
        }
        DlqCommand::Purge { id: None, .. } => {
            let count = sink.purge_all()?;
            tracing::info!(count = count, "Dead letters purged");
            Ok(format!("Purged {} record(s)", count))
        }
        DlqCommand::Replay { .. } => Err(StreamhookError::DeadLetter(
            "replay requires a notification target".to_string(),
        )
        .into()),
    }
}

/// Send a dead-lettered task once more, purging the record on success
///
/// A failed replay leaves the record in place and is not retried.
async fn replay(dispatcher: &Dispatcher, sink: &dyn DeadLetterSink, id: &str) -> Result<String> {
    let record = find(sink, id)?;
    let mut task = record.task.clone();
    task.attempts = record.attempts + 1;
    task.next_retry_at = None;

    tracing::info!(
        record_id = %record.id,
        dedup_id = %task.dedup_id,
        position = %task.position,
        target = %dispatcher.target_description(),
        "Replaying dead letter"
    );

    match dispatcher.dispatch(&task).await {
        DeliveryOutcome::Delivered => {
            sink.purge(&record.id)?;
            Ok(format!(
                "Replayed {} (position {}); record removed",
                record.id, task.position
            ))
        }
        outcome => Err(StreamhookError::Delivery(format!(
            "Replay of {} failed: {}; record kept",
            record.id, outcome
        ))
        .into()),
    }
}

fn find(sink: &dyn DeadLetterSink, id: &str) -> Result<DeadLetterRecord> {
    sink.get(id)?.ok_or_else(|| {
        StreamhookError::DeadLetter(format!("No dead letter matching '{}'", id)).into()
    })
}

fn render_table(records: &[DeadLetterRecord]) -> String {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.set_titles(prettytable::row![
        "ID", "Position", "Operation", "Attempts", "Failed At", "Reason"
    ]);

    for record in records {
        table.add_row(prettytable::row![
            record.id,
            record.task.position,
            record.task.operation_type,
            record.attempts,
            record.failed_at.format("%Y-%m-%d %H:%M:%S"),
            truncate(&record.reason, 60)
        ]);
    }

    table.to_string()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max - 3).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PayloadConfig;
    use crate::deadletter::MemoryDeadLetterSink;
    use crate::delivery::{BackoffPolicy, NotificationTask, RecordingTarget};
    use crate::event::{ChangeEvent, OperationType};
    use serde_json::json;

    fn record(position: u64) -> DeadLetterRecord {
        let event = ChangeEvent::new(position, OperationType::Update, json!({"n": position}));
        let mut task =
            NotificationTask::from_event(&event, "orders", "recording", &PayloadConfig::default());
        task.attempts = 5;
        DeadLetterRecord::new(task, "retries exhausted after 5 attempts: 503")
    }

    fn sink_with(positions: &[u64]) -> (Arc<MemoryDeadLetterSink>, Vec<String>) {
        let sink = Arc::new(MemoryDeadLetterSink::new());
        let ids = positions
            .iter()
            .map(|p| {
                let r = record(*p);
                sink.record(&r).unwrap();
                r.id
            })
            .collect();
        (sink, ids)
    }

    fn dispatcher(target: Arc<RecordingTarget>, sink: Arc<MemoryDeadLetterSink>) -> Dispatcher {
        Dispatcher::new(target, sink, BackoffPolicy::default(), 5)
    }

    #[test]
    fn test_list_empty() {
        let sink = MemoryDeadLetterSink::new();
        let out = execute(&sink, DlqCommand::List { json: false, limit: None }).unwrap();
        assert_eq!(out, "No dead-lettered notifications.");
    }

    #[test]
    fn test_list_table_and_json() {
        let (sink, ids) = sink_with(&[3, 8]);

        let table = execute(sink.as_ref(), DlqCommand::List { json: false, limit: None }).unwrap();
        assert!(table.contains(&ids[0]));
        assert!(table.contains("update"));

        let out = execute(sink.as_ref(), DlqCommand::List { json: true, limit: Some(1) }).unwrap();
        let parsed: Vec<DeadLetterRecord> = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].task.position.value(), 3);
    }

    #[test]
    fn test_show_and_purge_by_id() {
        let (sink, ids) = sink_with(&[3, 8]);

        let out = execute(sink.as_ref(), DlqCommand::Show { id: ids[1].clone() }).unwrap();
        assert!(out.contains("retries exhausted"));

        execute(
            sink.as_ref(),
            DlqCommand::Purge {
                id: Some(ids[0].clone()),
                all: false,
            },
        )
        .unwrap();
        assert_eq!(sink.count().unwrap(), 1);

        let missing = execute(sink.as_ref(), DlqCommand::Show { id: ids[0].clone() });
        assert!(missing.is_err());
    }

    #[test]
    fn test_purge_all() {
        let (sink, _) = sink_with(&[1, 2, 3]);
        let out = execute(sink.as_ref(), DlqCommand::Purge { id: None, all: true }).unwrap();
        assert_eq!(out, "Purged 3 record(s)");
        assert_eq!(sink.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_success_purges_record() {
        let (sink, ids) = sink_with(&[4]);
        let target = Arc::new(RecordingTarget::new());
        let dispatcher = dispatcher(target.clone(), sink.clone());

        replay(&dispatcher, sink.as_ref(), &ids[0]).await.unwrap();

        let calls = target.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].attempts, 6);
        assert_eq!(sink.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_failure_keeps_record() {
        let (sink, ids) = sink_with(&[4]);
        let target = Arc::new(RecordingTarget::new());
        target.script(4, [DeliveryOutcome::Retryable("503".to_string())]);
        let dispatcher = dispatcher(target.clone(), sink.clone());

        let err = replay(&dispatcher, sink.as_ref(), &ids[0]).await.unwrap_err();
        assert!(err.to_string().contains("record kept"));
        assert_eq!(target.calls().len(), 1);
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 60), "short");
        let long = "x".repeat(80);
        assert_eq!(truncate(&long, 10), "xxxxxxx...");
    }
}
