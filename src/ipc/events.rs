//! Append-only NDJSON event log: one writer (the orchestrator), and a
//! tailer (the dashboard) that seeks to the current end of file on
//! startup, polls for new bytes, and keeps a small ring buffer so a newly
//! connecting SSE client gets an initial burst instead of nothing.

use crate::errors::IpcError;
use crate::model::Event;
use chrono::Utc;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Ring buffer bound for events retained in memory for late-joining SSE
/// clients — mirrors the bounded event buffer a long-lived callback server
/// keeps so memory does not grow without limit.
pub const MAX_RING_EVENTS: usize = 200;

pub struct EventWriter {
    path: PathBuf,
    next_seq: AtomicU64,
}

impl EventWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Appends one event row, returning the assigned sequence number.
    pub fn write(&self, event: &str, data: serde_json::Value) -> Result<u64, IpcError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let row = Event {
            seq,
            timestamp: Utc::now(),
            event: event.to_string(),
            data,
        };
        if let Some(dir) = self.path.parent() {
            let _ = fs::create_dir_all(dir);
        }
        let json = serde_json::to_string(&row).expect("event rows are always serializable");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| IpcError::EventWriteFailed {
                path: self.path.clone(),
                source,
            })?;
        writeln!(file, "{json}").map_err(|source| IpcError::EventWriteFailed {
            path: self.path.clone(),
            source,
        })?;
        Ok(seq)
    }
}

pub struct EventTailer {
    path: PathBuf,
    file: Option<File>,
    position: u64,
    partial_line: String,
    last_seq: u64,
    ring: VecDeque<Event>,
}

impl EventTailer {
    /// Opens `path` (if present) and seeks to end-of-file so history isn't
    /// replayed on startup.
    pub fn new(path: PathBuf) -> Self {
        let (file, position) = match File::open(&path) {
            Ok(mut f) => {
                let pos = f.seek(SeekFrom::End(0)).unwrap_or(0);
                (Some(f), pos)
            }
            Err(_) => (None, 0),
        };
        Self {
            path,
            file,
            position,
            partial_line: String::new(),
            last_seq: 0,
            ring: VecDeque::new(),
        }
    }

    /// Polls for newly appended rows, returning any new events in order.
    /// Dedupes by `seq` and transparently reopens the file if it was
    /// truncated or rotated underneath us.
    pub fn poll(&mut self) -> Vec<Event> {
        let meta = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(_) => return Vec::new(),
        };
        if meta.len() < self.position {
            // Truncated or rotated: start over from the beginning. A fresh
            // file restarts its own seq numbering, so forget what we'd seen.
            self.file = File::open(&self.path).ok();
            self.position = 0;
            self.partial_line.clear();
            self.last_seq = 0;
        }
        if self.file.is_none() {
            self.file = File::open(&self.path).ok();
        }
        let Some(file) = self.file.as_mut() else {
            return Vec::new();
        };
        if meta.len() <= self.position {
            return Vec::new();
        }
        if file.seek(SeekFrom::Start(self.position)).is_err() {
            return Vec::new();
        }
        let mut buf = String::new();
        if file.read_to_string(&mut buf).is_err() {
            return Vec::new();
        }
        self.position = meta.len();

        self.partial_line.push_str(&buf);
        let mut lines: Vec<String> = self.partial_line.split('\n').map(|s| s.to_string()).collect();
        self.partial_line = lines.pop().unwrap_or_default();

        let mut fresh = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<Event>(&line) else {
                continue;
            };
            if event.seq <= self.last_seq {
                continue;
            }
            self.last_seq = event.seq;
            push_ring(&mut self.ring, event.clone());
            fresh.push(event);
        }
        fresh
    }

    /// Snapshot of the most recent `MAX_RING_EVENTS` events seen so far,
    /// for a client that just connected.
    pub fn ring_snapshot(&self) -> Vec<Event> {
        self.ring.iter().cloned().collect()
    }
}

fn push_ring(ring: &mut VecDeque<Event>, event: Event) {
    if ring.len() >= MAX_RING_EVENTS {
        ring.pop_front();
    }
    ring.push_back(event);
}

pub fn events_path(workspace: &Path) -> PathBuf {
    workspace.join("events.ndjson")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn seq_is_strictly_monotonic() {
        let dir = tempdir().unwrap();
        let writer = EventWriter::new(dir.path().join("events.ndjson"));
        let a = writer.write("phase-started", serde_json::json!({"phase": "1"})).unwrap();
        let b = writer.write("step-started", serde_json::json!({"phase": "1"})).unwrap();
        assert!(b > a);
    }

    #[test]
    fn tailer_skips_history_written_before_it_opened() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let writer = EventWriter::new(path.clone());
        writer.write("phase-started", serde_json::json!({})).unwrap();

        let mut tailer = EventTailer::new(path);
        assert!(tailer.poll().is_empty());

        writer.write("phase-completed", serde_json::json!({})).unwrap();
        let events = tailer.poll();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "phase-completed");
    }

    #[test]
    fn tailer_dedupes_by_seq_on_repeated_polls() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let mut tailer = EventTailer::new(path.clone());
        let writer = EventWriter::new(path);
        writer.write("log-entry", serde_json::json!({})).unwrap();

        let first = tailer.poll();
        assert_eq!(first.len(), 1);
        let second = tailer.poll();
        assert!(second.is_empty());
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let mut tailer = EventTailer::new(path.clone());
        let writer = EventWriter::new(path);
        for i in 0..(MAX_RING_EVENTS + 10) {
            writer
                .write("log-entry", serde_json::json!({"i": i}))
                .unwrap();
        }
        tailer.poll();
        assert_eq!(tailer.ring_snapshot().len(), MAX_RING_EVENTS);
    }

    #[test]
    fn tailer_recovers_from_truncation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let mut tailer = EventTailer::new(path.clone());
        let writer = EventWriter::new(path.clone());
        writer.write("log-entry", serde_json::json!({"n": 1})).unwrap();
        tailer.poll();

        fs::write(&path, b"").unwrap();
        let writer2 = EventWriter::new(path);
        writer2.write("log-entry", serde_json::json!({"n": 2})).unwrap();
        let events = tailer.poll();
        assert_eq!(events.len(), 1);
    }
}
