//! Presence-only shutdown marker file. Its existence, not its contents,
//! is the signal: the launcher's stop sequence creates it, the
//! orchestrator polls for it on the same cadence as the heartbeat.

use std::fs;
use std::path::PathBuf;

pub struct ShutdownMarker {
    path: PathBuf,
}

impl ShutdownMarker {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn create(&self) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, b"")
    }

    pub fn is_present(&self) -> bool {
        self.path.exists()
    }

    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn absent_by_default() {
        let dir = tempdir().unwrap();
        let marker = ShutdownMarker::new(dir.path().join("shutdown"));
        assert!(!marker.is_present());
    }

    #[test]
    fn create_then_is_present_then_clear() {
        let dir = tempdir().unwrap();
        let marker = ShutdownMarker::new(dir.path().join("shutdown"));
        marker.create().unwrap();
        assert!(marker.is_present());
        marker.clear();
        assert!(!marker.is_present());
    }
}
