//! Ring Log - bounded, sequence-numbered event log per resource key
//!
//! Provides:
//! - Append with per-key sequence numbers that are never reused
//! - Oldest-first eviction that never renumbers survivors
//! - Snapshot / delta replay for independent readers
//! - Reset detection for readers that outlived a `clear`
//! - Live push subscription and a poll-based frame stream

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Default maximum entries kept per key
const DEFAULT_MAX_ENTRIES: usize = 2000;

/// Default live subscriber channel capacity
const BROADCAST_CAPACITY: usize = 1000;

/// Kind of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    /// Captured command output
    Line,
    /// Phase transition of a guarded operation
    Status,
    /// Failure inside background work
    Error,
    /// Background work cut short by shutdown
    Interrupted,
    /// Start request ignored because a run is already active
    Skip,
    /// Informational message
    Info,
    /// One line of agent output
    AgentOutput,
    /// Agent lifecycle transition
    AgentStatus,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Line => "line",
            EntryKind::Status => "status",
            EntryKind::Error => "error",
            EntryKind::Interrupted => "interrupted",
            EntryKind::Skip => "skip",
            EntryKind::Info => "info",
            EntryKind::AgentOutput => "agent-output",
            EntryKind::AgentStatus => "agent-status",
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Per-key sequence number, assigned on append
    pub sequence: u64,

    pub timestamp: DateTime<Utc>,

    pub kind: EntryKind,

    pub payload: serde_json::Value,
}

impl LogEntry {
    pub fn new(kind: EntryKind, payload: serde_json::Value) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            kind,
            payload,
        }
    }

    pub fn text(kind: EntryKind, text: impl Into<String>) -> Self {
        Self::new(kind, serde_json::Value::String(text.into()))
    }

    /// Payload as text when it is a plain string
    pub fn payload_text(&self) -> Option<&str> {
        self.payload.as_str()
    }
}

/// Full buffer contents plus the cursor at that point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub cursor: u64,
    pub entries: Vec<LogEntry>,
}

/// Entries newer than a cursor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub cursor: u64,
    pub entries: Vec<LogEntry>,
}

/// Result of a reader poll
#[derive(Debug, Clone, PartialEq)]
pub enum LogRead {
    Snapshot(Snapshot),
    Delta(Delta),
}

impl LogRead {
    pub fn is_snapshot(&self) -> bool {
        matches!(self, LogRead::Snapshot(_))
    }

    pub fn entries(&self) -> &[LogEntry] {
        match self {
            LogRead::Snapshot(s) => &s.entries,
            LogRead::Delta(d) => &d.entries,
        }
    }
}

/// Read position of one independent reader
///
/// `position` is the buffer length the reader saw at its last read. When it
/// exceeds the current length the buffer was cleared underneath the reader.
#[derive(Debug, Clone, Default)]
pub struct LogReader {
    cursor: Option<u64>,
    position: Option<usize>,
}

impl LogReader {
    /// Reader with no prior cursor; its first read is a snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Reader resuming from an externally supplied cursor
    pub fn resume(cursor: u64) -> Self {
        Self {
            cursor: Some(cursor),
            position: None,
        }
    }

    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }
}

/// One frame of the live status/log stream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamFrame {
    Snapshot {
        event: &'static str,
        cursor: u64,
        data: Vec<LogEntry>,
    },
    Entry {
        event: EntryKind,
        id: u64,
        data: LogEntry,
    },
}

impl StreamFrame {
    pub fn snapshot(snapshot: Snapshot) -> Self {
        StreamFrame::Snapshot {
            event: "snapshot",
            cursor: snapshot.cursor,
            data: snapshot.entries,
        }
    }

    pub fn entry(entry: LogEntry) -> Self {
        StreamFrame::Entry {
            event: entry.kind,
            id: entry.sequence,
            data: entry,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            StreamFrame::Snapshot { event, .. } => event,
            StreamFrame::Entry { event, .. } => event.as_str(),
        }
    }

    /// Sequence id of the newest entry this frame carries
    pub fn id(&self) -> u64 {
        match self {
            StreamFrame::Snapshot { cursor, .. } => *cursor,
            StreamFrame::Entry { id, .. } => *id,
        }
    }
}

/// Buffer for a single key
#[derive(Debug)]
struct KeyLog {
    entries: VecDeque<LogEntry>,

    /// Last issued sequence; survives `clear`
    last_sequence: u64,

    tx: broadcast::Sender<LogEntry>,
}

impl KeyLog {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: VecDeque::new(),
            last_sequence: 0,
            tx,
        }
    }

    fn cursor(&self) -> u64 {
        self.entries.back().map(|e| e.sequence).unwrap_or(0)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            cursor: self.cursor(),
            entries: self.entries.iter().cloned().collect(),
        }
    }

    fn since(&self, cursor: u64) -> Delta {
        let entries: Vec<LogEntry> = self
            .entries
            .iter()
            .filter(|e| e.sequence > cursor)
            .cloned()
            .collect();
        let cursor = entries.last().map(|e| e.sequence).unwrap_or(cursor);
        Delta { cursor, entries }
    }

    /// Whether a reader at `cursor` can no longer be served a gap-free delta
    fn is_stale(&self, cursor: u64, position: Option<usize>) -> bool {
        if let Some(position) = position {
            if position > self.entries.len() {
                return true;
            }
        }
        if cursor > self.cursor() && !self.entries.is_empty() {
            return true;
        }
        if cursor > self.last_sequence {
            return true;
        }
        match self.entries.front() {
            // Entries the reader never saw were evicted
            Some(first) => cursor + 1 < first.sequence,
            None => false,
        }
    }
}

/// Ring log manager - one bounded buffer per resource key
#[derive(Clone)]
pub struct RingLog {
    logs: Arc<RwLock<HashMap<String, KeyLog>>>,
    max_entries: usize,
    broadcast_capacity: usize,
}

impl RingLog {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ENTRIES, BROADCAST_CAPACITY)
    }

    pub fn with_limits(max_entries: usize, broadcast_capacity: usize) -> Self {
        Self {
            logs: Arc::new(RwLock::new(HashMap::new())),
            max_entries: max_entries.max(1),
            broadcast_capacity,
        }
    }

    /// Append an entry, assigning the next sequence number for `key`
    pub fn append(&self, key: &str, mut entry: LogEntry) -> LogEntry {
        let mut logs = self.logs.write();
        let log = logs
            .entry(key.to_string())
            .or_insert_with(|| KeyLog::new(self.broadcast_capacity));

        log.last_sequence += 1;
        entry.sequence = log.last_sequence;

        log.entries.push_back(entry.clone());
        while log.entries.len() > self.max_entries {
            log.entries.pop_front();
        }

        // No subscribers is fine
        let _ = log.tx.send(entry.clone());
        entry
    }

    pub fn push(&self, key: &str, kind: EntryKind, payload: serde_json::Value) -> LogEntry {
        self.append(key, LogEntry::new(kind, payload))
    }

    pub fn push_text(&self, key: &str, kind: EntryKind, text: impl Into<String>) -> LogEntry {
        self.append(key, LogEntry::text(kind, text))
    }

    /// Current buffer plus the sequence of its last entry (0 if empty)
    pub fn snapshot(&self, key: &str) -> Snapshot {
        self.logs
            .read()
            .get(key)
            .map(KeyLog::snapshot)
            .unwrap_or_default()
    }

    /// Entries with sequence > `cursor`, in order
    pub fn since(&self, key: &str, cursor: u64) -> Delta {
        self.logs
            .read()
            .get(key)
            .map(|log| log.since(cursor))
            .unwrap_or(Delta {
                cursor,
                entries: Vec::new(),
            })
    }

    /// Serve `reader` a delta, or a snapshot when it has no usable cursor
    pub fn read(&self, key: &str, reader: &mut LogReader) -> LogRead {
        let logs = self.logs.read();
        let Some(log) = logs.get(key) else {
            if let Some(cursor) = reader.cursor {
                return LogRead::Delta(Delta {
                    cursor,
                    entries: Vec::new(),
                });
            }
            reader.cursor = Some(0);
            reader.position = Some(0);
            return LogRead::Snapshot(Snapshot::default());
        };

        let result = match reader.cursor {
            Some(cursor) if !log.is_stale(cursor, reader.position) => LogRead::Delta(log.since(cursor)),
            Some(cursor) => {
                debug!(key = %key, cursor, "Stale reader cursor, serving snapshot");
                LogRead::Snapshot(log.snapshot())
            }
            None => LogRead::Snapshot(log.snapshot()),
        };

        reader.cursor = Some(match &result {
            LogRead::Snapshot(s) => s.cursor,
            LogRead::Delta(d) => d.cursor,
        });
        reader.position = Some(log.entries.len());
        result
    }

    /// Drop all entries for `key`; sequence numbers keep counting
    pub fn clear(&self, key: &str) {
        if let Some(log) = self.logs.write().get_mut(key) {
            log.entries.clear();
            debug!(key = %key, last_sequence = log.last_sequence, "Cleared ring log");
        }
    }

    /// Snapshot plus a live receiver, taken atomically
    pub fn subscribe(&self, key: &str) -> (Snapshot, broadcast::Receiver<LogEntry>) {
        let mut logs = self.logs.write();
        let log = logs
            .entry(key.to_string())
            .or_insert_with(|| KeyLog::new(self.broadcast_capacity));
        (log.snapshot(), log.tx.subscribe())
    }

    /// Last `n` entries
    pub fn tail(&self, key: &str, n: usize) -> Vec<LogEntry> {
        self.logs
            .read()
            .get(key)
            .map(|log| {
                let skip = log.entries.len().saturating_sub(n);
                log.entries.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Poll-based frame stream for one key
    ///
    /// Without a cursor the first frame is a snapshot; afterwards each poll
    /// yields one frame per new entry, or a fresh snapshot after a reset.
    pub fn stream(
        &self,
        key: String,
        cursor: Option<u64>,
        interval: Duration,
    ) -> impl Stream<Item = StreamFrame> + Send + 'static {
        let log = self.clone();
        async_stream::stream! {
            let mut reader = match cursor {
                Some(cursor) => LogReader::resume(cursor),
                None => LogReader::new(),
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match log.read(&key, &mut reader) {
                    LogRead::Snapshot(snapshot) => yield StreamFrame::snapshot(snapshot),
                    LogRead::Delta(delta) => {
                        for entry in delta.entries {
                            yield StreamFrame::entry(entry);
                        }
                    }
                }
            }
        }
    }
}

impl Default for RingLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn fill(log: &RingLog, key: &str, n: usize) {
        for i in 0..n {
            log.push_text(key, EntryKind::Line, format!("line {}", i + 1));
        }
    }

    fn sequences(entries: &[LogEntry]) -> Vec<u64> {
        entries.iter().map(|e| e.sequence).collect()
    }

    #[test]
    fn test_replay_correctness() {
        let log = RingLog::new();
        fill(&log, "k", 5);

        let snapshot = log.snapshot("k");
        assert_eq!(snapshot.cursor, 5);
        assert_eq!(snapshot.entries.len(), 5);

        let delta = log.since("k", 5);
        assert!(delta.entries.is_empty());
        assert_eq!(delta.cursor, 5);

        let delta = log.since("k", 3);
        assert_eq!(sequences(&delta.entries), vec![4, 5]);
        assert_eq!(delta.cursor, 5);
    }

    #[test]
    fn test_unknown_key() {
        let log = RingLog::new();
        assert_eq!(log.snapshot("nope"), Snapshot::default());
        assert_eq!(log.since("nope", 7).cursor, 7);
        assert!(log.tail("nope", 3).is_empty());

        let mut reader = LogReader::new();
        assert!(log.read("nope", &mut reader).is_snapshot());
        assert!(!log.read("nope", &mut reader).is_snapshot());
        log.push_text("nope", EntryKind::Info, "hello");
        assert_eq!(log.read("nope", &mut reader).entries().len(), 1);
    }

    #[test]
    fn test_eviction_keeps_sequences() {
        let log = RingLog::with_limits(3, 16);
        fill(&log, "k", 5);

        let snapshot = log.snapshot("k");
        assert_eq!(sequences(&snapshot.entries), vec![3, 4, 5]);
        assert_eq!(snapshot.cursor, 5);
    }

    #[test]
    fn test_reset_detection() {
        let log = RingLog::new();
        fill(&log, "k", 5);

        let mut reader = LogReader::new();
        assert!(log.read("k", &mut reader).is_snapshot());
        assert_eq!(reader.position(), Some(5));

        log.clear("k");
        fill(&log, "k", 2);

        let read = log.read("k", &mut reader);
        assert!(read.is_snapshot());
        assert_eq!(sequences(read.entries()), vec![6, 7]);
        assert_eq!(reader.cursor(), Some(7));

        // Back to deltas afterwards
        fill(&log, "k", 1);
        let read = log.read("k", &mut reader);
        assert!(!read.is_snapshot());
        assert_eq!(sequences(read.entries()), vec![8]);
    }

    #[test]
    fn test_reader_deltas() {
        let log = RingLog::new();
        let mut reader = LogReader::new();

        let first = log.read("k", &mut reader);
        assert!(first.is_snapshot());
        assert!(first.entries().is_empty());

        fill(&log, "k", 2);
        let read = log.read("k", &mut reader);
        assert_eq!(read, LogRead::Delta(log.since("k", 0)));

        let read = log.read("k", &mut reader);
        assert!(read.entries().is_empty());
    }

    #[test]
    fn test_reader_behind_eviction_gets_snapshot() {
        let log = RingLog::with_limits(3, 16);
        fill(&log, "k", 2);
        let mut reader = LogReader::new();
        log.read("k", &mut reader);

        fill(&log, "k", 6);
        let read = log.read("k", &mut reader);
        assert!(read.is_snapshot());
        assert_eq!(sequences(read.entries()), vec![6, 7, 8]);
    }

    #[test]
    fn test_resumed_cursor_ahead_of_buffer() {
        let log = RingLog::new();
        fill(&log, "k", 2);

        let mut reader = LogReader::resume(40);
        assert!(log.read("k", &mut reader).is_snapshot());

        let mut reader = LogReader::resume(1);
        let read = log.read("k", &mut reader);
        assert_eq!(sequences(read.entries()), vec![2]);
    }

    #[test]
    fn test_tail() {
        let log = RingLog::new();
        fill(&log, "k", 4);
        assert_eq!(sequences(&log.tail("k", 2)), vec![3, 4]);
        assert_eq!(log.tail("k", 10).len(), 4);
    }

    #[tokio::test]
    async fn test_subscribe_has_no_gap() {
        let log = RingLog::new();
        fill(&log, "k", 2);

        let (snapshot, mut rx) = log.subscribe("k");
        assert_eq!(snapshot.cursor, 2);

        log.push_text("k", EntryKind::Status, "up");
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.sequence, 3);
        assert_eq!(entry.payload_text(), Some("up"));
    }

    #[tokio::test]
    async fn test_stream_frames() {
        let log = RingLog::new();
        fill(&log, "k", 2);

        let stream = log.stream("k".to_string(), None, Duration::from_millis(10));
        futures::pin_mut!(stream);

        let first = stream.next().await.unwrap();
        assert_eq!(first.event_name(), "snapshot");
        assert_eq!(first.id(), 2);

        log.push_text("k", EntryKind::Error, "boom");
        let next = stream.next().await.unwrap();
        assert_eq!(next.event_name(), "error");
        assert_eq!(next.id(), 3);

        let json = serde_json::to_value(&next).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["id"], 3);
        assert_eq!(json["data"]["payload"], "boom");
    }

    #[test]
    fn test_snapshot_frame_shape() {
        let frame = StreamFrame::snapshot(Snapshot::default());
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "snapshot");
        assert_eq!(json["cursor"], 0);
        assert!(json["data"].as_array().unwrap().is_empty());
    }
}
