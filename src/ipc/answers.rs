//! Answer drop-directory: the dashboard process writes one file per
//! delivered answer; the orchestrator polls the directory, hands each
//! answer to the question handler, and deletes the file regardless of
//! outcome so a stale or duplicate drop never wedges the inbox.

use crate::errors::IpcError;
use crate::ipc::EventWriter;
use crate::questions::QuestionHandler;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerFile {
    pub question_id: String,
    pub answers: BTreeMap<String, String>,
    pub answered_at: DateTime<Utc>,
}

pub struct AnswerWriter {
    dir: PathBuf,
}

impl AnswerWriter {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn submit(&self, question_id: &str, answers: BTreeMap<String, String>) -> Result<(), IpcError> {
        fs::create_dir_all(&self.dir).ok();
        let path = self.dir.join(format!("{question_id}.json"));
        let payload = AnswerFile {
            question_id: question_id.to_string(),
            answers,
            answered_at: Utc::now(),
        };
        crate::state::persist_json(&path, &payload).map_err(|_| IpcError::AnswerWriteFailed {
            path: path.clone(),
            source: std::io::Error::other("failed to persist answer"),
        })
    }
}

pub struct AnswerPoller {
    dir: PathBuf,
}

impl AnswerPoller {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Lists the inbox, resolves each file against `handler`, and deletes
    /// it regardless of whether the id was recognized. Returns the count
    /// of files processed (for logging), not the count accepted.
    pub fn poll(&self, handler: &QuestionHandler, events: &EventWriter) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut processed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bytes) = fs::read(&path) {
                if let Ok(answer) = serde_json::from_slice::<AnswerFile>(&bytes) {
                    handler.submit_answer(&answer.question_id, answer.answers, events);
                }
            }
            let _ = fs::remove_file(&path);
            processed += 1;
        }
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_events(dir: &std::path::Path) -> EventWriter {
        EventWriter::new(dir.join("events.ndjson"))
    }

    #[test]
    fn writer_then_poller_round_trips_and_deletes_file() {
        let dir = tempdir().unwrap();
        let inbox = dir.path().join("answers");
        let writer = AnswerWriter::new(inbox.clone());
        let handler = QuestionHandler::new();
        let events = test_events(dir.path());

        let mut answers = BTreeMap::new();
        answers.insert("Q1".to_string(), "Yes".to_string());

        let (id, rx) = handler.register("1", "execute");
        writer.submit(&id, answers.clone()).unwrap();

        let poller = AnswerPoller::new(inbox.clone());
        let processed = poller.poll(&handler, &events);
        assert_eq!(processed, 1);
        assert!(fs::read_dir(&inbox).unwrap().next().is_none());

        let resolution = rx.try_recv().unwrap();
        assert_eq!(resolution.answers.get("Q1").unwrap(), "Yes");
    }

    #[test]
    fn poller_deletes_stale_unknown_answer_without_crashing() {
        let dir = tempdir().unwrap();
        let inbox = dir.path().join("answers");
        fs::create_dir_all(&inbox).unwrap();
        fs::write(
            inbox.join("unknown-id.json"),
            br#"{"questionId":"unknown-id","answers":{},"answeredAt":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let handler = QuestionHandler::new();
        let events = test_events(dir.path());
        let poller = AnswerPoller::new(inbox.clone());
        let processed = poller.poll(&handler, &events);
        assert_eq!(processed, 1);
        assert!(fs::read_dir(&inbox).unwrap().next().is_none());
    }
}
