//! Liveness beacon: the orchestrator writes `heartbeat.json` on a fixed
//! cadence, the dashboard (or launcher) reads it to decide whether the
//! orchestrator is still alive without needing a direct process handle.

use crate::errors::IpcError;
use crate::model::{Heartbeat, HeartbeatStatus};
use crate::state::persist_json;
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const STALE_THRESHOLD: Duration = Duration::from_secs(15);

pub struct HeartbeatWriter {
    path: PathBuf,
    pid: u32,
}

impl HeartbeatWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            pid: std::process::id(),
        }
    }

    pub fn write(&self, status: HeartbeatStatus) -> Result<(), IpcError> {
        let beat = Heartbeat {
            pid: self.pid,
            timestamp: Utc::now(),
            status,
        };
        persist_json(&self.path, &beat).map_err(|_| IpcError::HeartbeatWriteFailed {
            path: self.path.clone(),
            source: std::io::Error::other("failed to persist heartbeat"),
        })
    }

    /// Spawns a background task that writes a heartbeat every
    /// [`HEARTBEAT_INTERVAL`] until `shutdown` fires.
    pub fn spawn(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let status = if *shutdown.borrow() {
                            HeartbeatStatus::Stopping
                        } else {
                            HeartbeatStatus::Running
                        };
                        let _ = self.write(status);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            let _ = self.write(HeartbeatStatus::Stopping);
                            break;
                        }
                    }
                }
            }
        })
    }
}

pub struct HeartbeatReader {
    path: PathBuf,
}

impl HeartbeatReader {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn read(&self) -> Option<Heartbeat> {
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// A beacon is alive iff it parses and its timestamp is within
    /// [`STALE_THRESHOLD`] of now.
    pub fn is_alive(&self) -> bool {
        let Some(beat) = self.read() else {
            return false;
        };
        let age = Utc::now().signed_duration_since(beat.timestamp);
        age.to_std().map(|d| d < STALE_THRESHOLD).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_heartbeat_is_not_alive() {
        let dir = tempdir().unwrap();
        let reader = HeartbeatReader::new(dir.path().join("heartbeat.json"));
        assert!(!reader.is_alive());
    }

    #[test]
    fn fresh_heartbeat_is_alive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        let writer = HeartbeatWriter::new(path.clone());
        writer.write(HeartbeatStatus::Running).unwrap();
        let reader = HeartbeatReader::new(path);
        assert!(reader.is_alive());
    }

    #[test]
    fn stale_heartbeat_is_not_alive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        let beat = Heartbeat {
            pid: 1,
            timestamp: Utc::now() - chrono::Duration::seconds(30),
            status: HeartbeatStatus::Running,
        };
        persist_json(&path, &beat).unwrap();
        let reader = HeartbeatReader::new(path);
        assert!(!reader.is_alive());
    }

    #[test]
    fn unparseable_heartbeat_is_not_alive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        std::fs::write(&path, b"garbage").unwrap();
        let reader = HeartbeatReader::new(path);
        assert!(!reader.is_alive());
    }
}
