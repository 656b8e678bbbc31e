use super::{DeadLetterRecord, DeadLetterSink};
use crate::error::{Result, StreamhookError};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

/// Dead-letter sink backed by SQLite
///
/// Inserts run in autocommit mode, so a record is on disk once `record`
/// returns.
pub struct SqliteDeadLetterSink {
    db_path: PathBuf,
}

impl SqliteDeadLetterSink {
    /// Open (and initialize) the database at `db_path`
    ///
    /// # Examples
    ///
    /// ```
    /// use streamhook::deadletter::{DeadLetterSink, SqliteDeadLetterSink};
    ///
    /// let dir = tempfile::TempDir::new().unwrap();
    /// let sink = SqliteDeadLetterSink::new_with_path(dir.path().join("dlq.db")).unwrap();
    /// assert_eq!(sink.count().unwrap(), 0);
    /// ```
    pub fn new_with_path<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .context("Failed to create parent directory for database")
                .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;
        }

        let sink = Self { db_path };
        sink.init()?;
        Ok(sink)
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)
            .context("Failed to open database")
            .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;
        Ok(conn)
    }

    fn init(&self) -> Result<()> {
        let conn = self.open()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS dead_letters (
                id TEXT PRIMARY KEY,
                subscription TEXT NOT NULL,
                position INTEGER NOT NULL,
                dedup_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                failed_at TEXT NOT NULL,
                task JSON NOT NULL
            )",
            [],
        )
        .context("Failed to create tables")
        .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;

        Ok(())
    }

    fn decode(
        id: String,
        reason: String,
        attempts: u32,
        failed_at: String,
        task_json: String,
    ) -> Result<DeadLetterRecord> {
        let task = serde_json::from_str(&task_json)
            .context("Failed to deserialize task")
            .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;
        let failed_at = DateTime::parse_from_rfc3339(&failed_at)
            .map(|dt| dt.with_timezone(&Utc))
            .context("Failed to parse failure time")
            .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;

        Ok(DeadLetterRecord {
            id,
            task,
            reason,
            attempts,
            failed_at,
        })
    }
}

type Row = (String, String, u32, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

impl DeadLetterSink for SqliteDeadLetterSink {
    fn record(&self, record: &DeadLetterRecord) -> Result<()> {
        let conn = self.open()?;

        let task_json = serde_json::to_string(&record.task)
            .context("Failed to serialize task")
            .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;

        conn.execute(
            "INSERT INTO dead_letters
                (id, subscription, position, dedup_id, reason, attempts, failed_at, task)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id,
                record.task.subscription,
                record.task.position.value() as i64,
                record.task.dedup_id,
                record.reason,
                record.attempts,
                record.failed_at.to_rfc3339(),
                task_json
            ],
        )
        .context("Failed to insert dead letter")
        .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;

        Ok(())
    }

    fn list(&self, limit: Option<usize>) -> Result<Vec<DeadLetterRecord>> {
        let conn = self.open()?;
        let limit = limit.map_or(-1, |l| l as i64);

        let mut stmt = conn
            .prepare(
                "SELECT id, reason, attempts, failed_at, task
                FROM dead_letters
                ORDER BY rowid ASC
                LIMIT ?",
            )
            .context("Failed to prepare query")
            .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;

        let rows = stmt
            .query_map(params![limit], read_row)
            .context("Failed to query dead letters")
            .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            let (id, reason, attempts, failed_at, task_json) =
                row.map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;
            records.push(Self::decode(id, reason, attempts, failed_at, task_json)?);
        }

        Ok(records)
    }

    /// Accepts a full ULID or a unique prefix
    fn get(&self, id: &str) -> Result<Option<DeadLetterRecord>> {
        let conn = self.open()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, reason, attempts, failed_at, task
                FROM dead_letters
                WHERE id LIKE ? ESCAPE '\\'
                LIMIT 2",
            )
            .context("Failed to prepare query")
            .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;

        let mut rows: Vec<Row> = stmt
            .query_map(params![format!("{}%", escape_like(id))], read_row)
            .context("Failed to query dead letter")
            .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;

        if rows.len() > 1 {
            return Err(StreamhookError::DeadLetter(format!(
                "Id prefix '{}' matches more than one record",
                id
            ))
            .into());
        }

        match rows.pop() {
            Some((id, reason, attempts, failed_at, task_json)) => {
                Ok(Some(Self::decode(id, reason, attempts, failed_at, task_json)?))
            }
            None => Ok(None),
        }
    }

    fn purge(&self, id: &str) -> Result<bool> {
        let conn = self.open()?;

        let count = conn
            .execute("DELETE FROM dead_letters WHERE id = ?", params![id])
            .context("Failed to delete dead letter")
            .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;

        Ok(count > 0)
    }

    fn purge_all(&self) -> Result<usize> {
        let conn = self.open()?;

        let count = conn
            .execute("DELETE FROM dead_letters", [])
            .context("Failed to delete dead letters")
            .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?;

        Ok(count)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.open()?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))
            .optional()
            .context("Failed to count dead letters")
            .map_err(|e| StreamhookError::DeadLetter(e.to_string()))?
            .unwrap_or(0);

        Ok(count as usize)
    }
}

/// Escape `LIKE` wildcards so an id prefix only matches literally
fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
