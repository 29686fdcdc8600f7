//! Single-flight, fan-in/fan-out handler for interactive questions raised
//! by the agent's `AskUserQuestion` tool. Each question gets an opaque id
//! and a deferred resolver; the dashboard answers (or shutdown rejects)
//! resolve it independently of any other in-flight question.

use crate::errors::QuestionError;
use crate::ipc::EventWriter;
use crate::model::{Question, QuestionItem};
use crate::state::SharedState;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QuestionResolution {
    pub allowed: bool,
    pub answers: BTreeMap<String, String>,
}

impl QuestionResolution {
    fn rejected() -> Self {
        Self {
            allowed: false,
            answers: BTreeMap::new(),
        }
    }
}

pub struct QuestionHandler {
    pending: Mutex<HashMap<String, oneshot::Sender<QuestionResolution>>>,
    state: Option<SharedState>,
}

impl Default for QuestionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl QuestionHandler {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            state: None,
        }
    }

    /// A handler that also records pending questions in `state.json`'s
    /// `pendingQuestions` so the dashboard's `/api/questions` surface has
    /// something to show; [`QuestionHandler::new`] is for callers (mostly
    /// tests) that only need the in-memory resolver table.
    pub fn with_state(state: SharedState) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            state: Some(state),
        }
    }

    /// Registers a fresh question id with a deferred resolver and returns
    /// both; callers that also need to emit the `question:pending` event
    /// should prefer [`QuestionHandler::handle_question`].
    pub fn register(&self, phase: &str, step: &str) -> (String, oneshot::Receiver<QuestionResolution>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("question table poisoned").insert(id.clone(), tx);
        let _ = (phase, step);
        (id, rx)
    }

    /// Registers the question, emits `question:pending`, and waits for a
    /// resolution. Resolves to a rejection if the sender is dropped
    /// (e.g. by [`QuestionHandler::reject_all`]).
    pub async fn handle_question(
        &self,
        items: &[QuestionItem],
        phase: &str,
        step: &str,
        events: &EventWriter,
    ) -> QuestionResolution {
        let (id, rx) = self.register(phase, step);
        let created_at = Utc::now();
        if let Some(state) = &self.state {
            let question = Question {
                id: id.clone(),
                phase: phase.to_string(),
                step: step.to_string(),
                items: items.to_vec(),
                created_at,
                answered_at: None,
                answers: None,
            };
            let _ = state.set_state(|s| s.pending_questions.push(question));
        }
        let _ = events.write(
            "question-pending",
            serde_json::json!({
                "id": id,
                "phase": phase,
                "step": step,
                "items": items,
                "createdAt": created_at,
            }),
        );
        rx.await.unwrap_or_else(|_| QuestionResolution::rejected())
    }

    /// Resolves a pending question: removes it from `state.json`'s
    /// `pendingQuestions` (if this handler was built with
    /// [`QuestionHandler::with_state`]), emits `question-answered`, and
    /// wakes whatever's awaiting the resolution. Returns `false` (no-op,
    /// no event) if `id` is unknown or was already answered.
    pub fn submit_answer(&self, id: &str, answers: BTreeMap<String, String>, events: &EventWriter) -> bool {
        let sender = self.pending.lock().expect("question table poisoned").remove(id);
        match sender {
            Some(tx) => {
                if let Some(state) = &self.state {
                    let _ = state.set_state(|s| s.pending_questions.retain(|q| q.id != id));
                }
                let _ = events.write(
                    "question-answered",
                    serde_json::json!({"id": id, "answers": answers}),
                );
                let _ = tx.send(QuestionResolution {
                    allowed: true,
                    answers,
                });
                true
            }
            None => false,
        }
    }

    /// Returns an error variant of [`submit_answer`] for callers that want
    /// a typed failure instead of a bare bool.
    pub fn submit_answer_checked(
        &self,
        id: &str,
        answers: BTreeMap<String, String>,
        events: &EventWriter,
    ) -> Result<(), QuestionError> {
        if self.submit_answer(id, answers, events) {
            Ok(())
        } else {
            Err(QuestionError::UnknownQuestion(id.to_string()))
        }
    }

    /// Rejects every outstanding question, e.g. on shutdown/abort so a
    /// blocked `canUseTool` call unwinds instead of hanging forever.
    pub fn reject_all(&self) {
        let mut pending = self.pending.lock().expect("question table poisoned");
        for (_, tx) in pending.drain() {
            let _ = tx.send(QuestionResolution::rejected());
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("question table poisoned").len()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.lock().expect("question table poisoned").keys().cloned().collect()
    }
}
