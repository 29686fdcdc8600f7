//! Atomic JSON state store.
//!
//! `state.json` is written with a write-to-temp-then-rename sequence so a
//! reader polling the file with `std::fs::metadata` never observes a torn
//! document: either the old bytes or the new bytes, never a half-written
//! mix. The same pattern as a config editor writing its config back out
//! (write into a `NamedTempFile` created alongside the target, then
//! `persist()` over it, which is an atomic rename on every platform tempfile
//! supports).

use crate::errors::StateError;
use crate::model::AutopilotState;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

pub struct StateStore {
    state_file: PathBuf,
    state: AutopilotState,
}

impl StateStore {
    /// Load from `state_file` if it exists, otherwise start from a fresh
    /// in-memory state (no disk write happens until the first `set_state`).
    pub fn load_or_fresh(state_file: PathBuf) -> Result<Self, StateError> {
        if state_file.exists() {
            Self::restore(state_file)
        } else {
            Ok(Self {
                state_file,
                state: AutopilotState::fresh(),
            })
        }
    }

    /// Load from disk, erroring if the file is missing or malformed.
    pub fn restore(state_file: PathBuf) -> Result<Self, StateError> {
        let bytes = fs::read(&state_file).map_err(|source| StateError::ReadFailed {
            path: state_file.clone(),
            source,
        })?;
        let state: AutopilotState =
            serde_json::from_slice(&bytes).map_err(|source| StateError::ParseFailed {
                path: state_file.clone(),
                source,
            })?;
        Ok(Self { state_file, state })
    }

    /// A state store over a fresh state that has never touched disk, for
    /// callers that want an in-memory document before the first run.
    pub fn create_fresh(state_file: PathBuf) -> Self {
        Self {
            state_file,
            state: AutopilotState::fresh(),
        }
    }

    /// Defensive copy of the current state.
    pub fn get_state(&self) -> AutopilotState {
        self.state.clone()
    }

    /// Apply `mutate` to the in-memory state, bump `last_updated_at`, and
    /// persist atomically before returning.
    pub fn set_state(
        &mut self,
        mutate: impl FnOnce(&mut AutopilotState),
    ) -> Result<(), StateError> {
        mutate(&mut self.state);
        self.state.last_updated_at = Utc::now();
        self.persist()
    }

    fn persist(&self) -> Result<(), StateError> {
        persist_json(&self.state_file, &self.state)
    }
}

/// A [`StateStore`] shared behind a mutex so two independently-`Arc`'d
/// owners (the orchestrator's step loop and the question handler the
/// supervisor drives) can both mutate `state.json` without either holding
/// the store by value. Mirrors `StateStore`'s own `get_state`/`set_state`
/// names so call sites read the same either way.
#[derive(Clone)]
pub struct SharedState(Arc<Mutex<StateStore>>);

impl SharedState {
    pub fn new(store: StateStore) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }

    pub fn get_state(&self) -> AutopilotState {
        self.0.lock().expect("state store poisoned").get_state()
    }

    pub fn set_state(&self, mutate: impl FnOnce(&mut AutopilotState)) -> Result<(), StateError> {
        self.0.lock().expect("state store poisoned").set_state(mutate)
    }
}

/// Serializes `value` and writes it to `path` atomically: a temp file is
/// created in the same directory as `path` so the final rename is a same-
/// filesystem move, then persisted over `path`.
pub fn persist_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|source| StateError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })?;
    let json = serde_json::to_vec_pretty(value).expect("state document is always serializable");
    let mut tmp = NamedTempFile::new_in(dir).map_err(|source| StateError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })?;
    use std::io::Write;
    tmp.write_all(&json).map_err(|source| StateError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.persist(path)
        .map_err(|e| StateError::WriteFailed {
            path: path.to_path_buf(),
            source: e.error,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Phase;
    use tempfile::tempdir;

    #[test]
    fn create_fresh_does_not_touch_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let _store = StateStore::create_fresh(path.clone());
        assert!(!path.exists());
    }

    #[test]
    fn set_state_persists_and_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = StateStore::create_fresh(path.clone());
        store
            .set_state(|s| {
                s.phases.push(Phase::new("1", "Setup"));
                s.current_phase = 1;
            })
            .unwrap();

        assert!(path.exists());
        let reloaded = StateStore::restore(path).unwrap();
        let state = reloaded.get_state();
        assert_eq!(state.current_phase, 1);
        assert_eq!(state.phases.len(), 1);
        assert_eq!(state.phases[0].number, "1");
    }

    #[test]
    fn load_or_fresh_returns_fresh_state_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope").join("state.json");
        let store = StateStore::load_or_fresh(path).unwrap();
        let state = store.get_state();
        assert_eq!(state.current_phase, 0);
        assert!(state.phases.is_empty());
    }

    #[test]
    fn restore_fails_on_malformed_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"not json").unwrap();
        let result = StateStore::restore(path);
        assert!(matches!(result, Err(StateError::ParseFailed { .. })));
    }

    #[test]
    fn get_state_is_a_defensive_copy() {
        let dir = tempdir().unwrap();
        let mut store = StateStore::create_fresh(dir.path().join("state.json"));
        let mut copy = store.get_state();
        copy.phases.push(Phase::new("9", "Tamper"));
        store.set_state(|s| s.phases.push(Phase::new("1", "Real"))).unwrap();
        let state = store.get_state();
        assert_eq!(state.phases.len(), 1);
        assert_eq!(state.phases[0].number, "1");
    }
}
