//! Newline-delimited JSON change-log source
//!
//! Each line of the log is one serialized [`ChangeEvent`]. The writer
//! numbers entries consecutively, so when old entries are rotated away the
//! first retained position tells us whether a resume position is still
//! covered. After replaying the existing entries the stream keeps polling
//! the file for appended lines; a partially written final line is left for
//! the next poll.

use super::{ChangeSource, ChangeStream, SourceError, SubscribeFrom};
use crate::event::{ChangeEvent, ResumePosition};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace};

/// Change source tailing a JSON-lines change log
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileSource {
    /// Create a source for the log at `path`
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }
}

struct TailState {
    path: PathBuf,
    offset: u64,
    last: Option<ResumePosition>,
    pending: VecDeque<ChangeEvent>,
    poll_interval: Duration,
    done: bool,
}

/// Parse every complete line in `buf`
///
/// Returns the events and the number of bytes consumed (up to and including
/// the last newline). `first_line` is used for error messages only.
fn parse_lines(buf: &[u8], first_line: usize) -> Result<(Vec<ChangeEvent>, usize), SourceError> {
    let consumed = match buf.iter().rposition(|b| *b == b'\n') {
        Some(idx) => idx + 1,
        None => return Ok((Vec::new(), 0)),
    };

    let mut events = Vec::new();
    for (i, line) in buf[..consumed].split(|b| *b == b'\n').enumerate() {
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }
        let event: ChangeEvent = serde_json::from_slice(trimmed).map_err(|e| {
            SourceError::Fatal(format!(
                "Malformed change record at line {}: {}",
                first_line + i + 1,
                e
            ))
        })?;
        events.push(event);
    }
    Ok((events, consumed))
}

async fn read_from(path: &PathBuf, offset: u64) -> Result<Option<Vec<u8>>, SourceError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(SourceError::Transient(format!(
                "Change log {} not found",
                path.display()
            )))
        }
        Err(e) => return Err(SourceError::Transient(e.to_string())),
    };

    let len = file
        .metadata()
        .await
        .map_err(|e| SourceError::Transient(e.to_string()))?
        .len();
    if len < offset {
        return Ok(None);
    }

    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| SourceError::Transient(e.to_string()))?;
    let mut buf = Vec::with_capacity((len - offset) as usize);
    file.read_to_end(&mut buf)
        .await
        .map_err(|e| SourceError::Transient(e.to_string()))?;
    Ok(Some(buf))
}

async fn next_event(
    mut state: TailState,
) -> Option<(Result<ChangeEvent, SourceError>, TailState)> {
    loop {
        if state.done {
            return None;
        }
        if let Some(event) = state.pending.pop_front() {
            state.last = Some(event.position);
            return Some((Ok(event), state));
        }

        tokio::time::sleep(state.poll_interval).await;

        let buf = match read_from(&state.path, state.offset).await {
            Ok(Some(buf)) => buf,
            Ok(None) => {
                state.done = true;
                return Some((
                    Err(SourceError::Transient(
                        "change log was truncated or rotated".to_string(),
                    )),
                    state,
                ));
            }
            Err(e) => {
                state.done = true;
                return Some((Err(e), state));
            }
        };

        match parse_lines(&buf, 0) {
            Ok((events, consumed)) => {
                state.offset += consumed as u64;
                let last = state.last;
                state
                    .pending
                    .extend(events.into_iter().filter(|e| last.map_or(true, |l| e.position > l)));
                trace!(offset = state.offset, pending = state.pending.len(), "Polled change log");
            }
            Err(e) => {
                state.done = true;
                return Some((Err(e), state));
            }
        }
    }
}

#[async_trait]
impl ChangeSource for FileSource {
    async fn subscribe(&self, from: SubscribeFrom) -> Result<ChangeStream, SourceError> {
        let buf = read_from(&self.path, 0).await?.unwrap_or_default();
        let (events, consumed) = parse_lines(&buf, 0)?;

        if let (SubscribeFrom::After(position), Some(first)) = (from, events.first()) {
            if first.position.value() > position.value().saturating_add(1) {
                return Err(SourceError::PositionExpired {
                    position,
                    message: format!("oldest retained entry is {}", first.position),
                });
            }
        }

        let newest = events.last().map(|e| e.position);
        let (pending, last): (VecDeque<ChangeEvent>, Option<ResumePosition>) = match from {
            SubscribeFrom::After(position) => (
                events.into_iter().filter(|e| e.position > position).collect(),
                Some(position),
            ),
            SubscribeFrom::Earliest => (events.into_iter().collect(), None),
            SubscribeFrom::Latest => (VecDeque::new(), newest),
        };

        debug!(
            path = %self.path.display(),
            from = %from,
            backlog = pending.len(),
            "Subscribed to change log"
        );

        let state = TailState {
            path: self.path.clone(),
            offset: consumed as u64,
            last,
            pending,
            poll_interval: self.poll_interval,
            done: false,
        };

        Ok(stream::unfold(state, next_event).boxed())
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn line(position: u64, op: &str) -> String {
        format!(
            "{{\"position\":{},\"operationType\":\"{}\",\"fullDocument\":{{\"n\":{}}}}}\n",
            position, op, position
        )
    }

    fn write_log(dir: &TempDir, lines: &[String]) -> PathBuf {
        let path = dir.path().join("changes.jsonl");
        std::fs::write(&path, lines.concat()).unwrap();
        path
    }

    async fn take(stream: &mut ChangeStream, n: usize) -> Vec<u64> {
        let mut out = Vec::new();
        for _ in 0..n {
            let event = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .expect("source error");
            out.push(event.position.value());
        }
        out
    }

    #[test]
    fn test_parse_lines_leaves_partial_line() {
        let buf = format!("{}{}", line(1, "insert"), "{\"position\":2,");
        let (events, consumed) = parse_lines(buf.as_bytes(), 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(consumed, line(1, "insert").len());
    }

    #[test]
    fn test_parse_lines_reports_malformed_line() {
        let buf = format!("{}not json\n", line(1, "insert"));
        let err = parse_lines(buf.as_bytes(), 0).unwrap_err();
        assert!(matches!(err, SourceError::Fatal(ref m) if m.contains("line 2")));
    }

    #[tokio::test]
    async fn test_replays_after_position_then_tails() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, &[line(1, "insert"), line(2, "update"), line(3, "insert")]);
        let source = FileSource::new(&path, Duration::from_millis(10));

        let mut stream = source
            .subscribe(SubscribeFrom::After(ResumePosition(1)))
            .await
            .unwrap();
        assert_eq!(take(&mut stream, 2).await, vec![2, 3]);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(line(4, "delete").as_bytes()).unwrap();
        file.flush().unwrap();

        assert_eq!(take(&mut stream, 1).await, vec![4]);
    }

    #[tokio::test]
    async fn test_latest_only_sees_appended_entries() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, &[line(1, "insert"), line(2, "insert")]);
        let source = FileSource::new(&path, Duration::from_millis(10));

        let mut stream = source.subscribe(SubscribeFrom::Latest).await.unwrap();

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(line(3, "insert").as_bytes()).unwrap();

        assert_eq!(take(&mut stream, 1).await, vec![3]);
    }

    #[tokio::test]
    async fn test_rotated_log_expires_old_position() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, &[line(10, "insert"), line(11, "insert")]);
        let source = FileSource::new(&path, Duration::from_millis(10));

        let err = source
            .subscribe(SubscribeFrom::After(ResumePosition(5)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::PositionExpired { .. }));

        assert!(source
            .subscribe(SubscribeFrom::After(ResumePosition(9)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_missing_log_is_transient() {
        let dir = TempDir::new().unwrap();
        let source = FileSource::new(dir.path().join("absent.jsonl"), Duration::from_millis(10));
        let err = source.subscribe(SubscribeFrom::Earliest).await.err().unwrap();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_truncation_while_tailing_is_transient() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, &[line(1, "insert"), line(2, "insert")]);
        let source = FileSource::new(&path, Duration::from_millis(10));

        let mut stream = source.subscribe(SubscribeFrom::Earliest).await.unwrap();
        assert_eq!(take(&mut stream, 2).await, vec![1, 2]);

        std::fs::write(&path, b"").unwrap();

        let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(next, Err(SourceError::Transient(_))));
        assert!(stream.next().await.is_none());
    }
}
