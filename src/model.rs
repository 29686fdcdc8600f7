//! Data model shared by the state store, the orchestrator, the IPC layer and
//! the HTTP API: `Phase`, `Question`, `Event`, `Heartbeat` and the top-level
//! `AutopilotState` document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One step within a phase. `Idle` is the resting state before the step has
/// been entered for this run; `Done` means the step's command returned
/// success and the result was persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Idle,
    Discuss,
    Plan,
    Execute,
    Verify,
    Done,
}

impl Default for StepState {
    fn default() -> Self {
        StepState::Idle
    }
}

/// The four steps a phase walks through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Discuss,
    Plan,
    Execute,
    Verify,
}

impl Step {
    pub const ALL: [Step; 4] = [Step::Discuss, Step::Plan, Step::Execute, Step::Verify];

    pub fn name(&self) -> &'static str {
        match self {
            Step::Discuss => "discuss",
            Step::Plan => "plan",
            Step::Execute => "execute",
            Step::Verify => "verify",
        }
    }

    pub fn as_entered_state(&self) -> StepState {
        match self {
            Step::Discuss => StepState::Discuss,
            Step::Plan => StepState::Plan,
            Step::Execute => StepState::Execute,
            Step::Verify => StepState::Verify,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepStates {
    #[serde(default)]
    pub discuss: StepState,
    #[serde(default)]
    pub plan: StepState,
    #[serde(default)]
    pub execute: StepState,
    #[serde(default)]
    pub verify: StepState,
}

impl StepStates {
    pub fn get(&self, step: Step) -> StepState {
        match step {
            Step::Discuss => self.discuss,
            Step::Plan => self.plan,
            Step::Execute => self.execute,
            Step::Verify => self.verify,
        }
    }

    pub fn set(&mut self, step: Step, state: StepState) {
        match step {
            Step::Discuss => self.discuss = state,
            Step::Plan => self.plan = state,
            Step::Execute => self.execute = state,
            Step::Verify => self.verify = state,
        }
    }

    pub fn done_count(&self) -> usize {
        [self.discuss, self.plan, self.execute, self.verify]
            .iter()
            .filter(|s| **s == StepState::Done)
            .count()
    }

    pub fn all_done(&self, skip_verify: bool) -> bool {
        if skip_verify {
            self.discuss == StepState::Done
                && self.plan == StepState::Done
                && self.execute == StepState::Done
        } else {
            self.done_count() == 4
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    /// "3" or "3.1" — decimals denote phases inserted during a gap loop.
    pub number: String,
    pub name: String,
    pub status: PhaseStatus,
    #[serde(default)]
    pub steps: StepStates,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub commits: Vec<Commit>,
    #[serde(default)]
    pub gap_iterations: u32,
    /// True for phases that were not present in the original roadmap and
    /// were inserted afterwards. The orchestrator never mutates this flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted: Option<bool>,
}

impl Phase {
    pub fn new(number: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            name: name.into(),
            status: PhaseStatus::Pending,
            steps: StepStates::default(),
            started_at: None,
            completed_at: None,
            commits: Vec::new(),
            gap_iterations: 0,
            inserted: None,
        }
    }

    /// Zero-pads the integer portion of `number` to at least width 2,
    /// preserving any decimal suffix. `"3"` -> `"03"`, `"3.1"` -> `"03.1"`.
    pub fn padded_number(&self) -> String {
        pad_phase_number(&self.number)
    }
}

pub fn pad_phase_number(number: &str) -> String {
    match number.split_once('.') {
        Some((whole, frac)) => format!("{:0>2}.{}", whole, frac),
        None => format!("{:0>2}", number),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionItem {
    pub question: String,
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub phase: String,
    pub step: String,
    pub items: Vec<QuestionItem>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub step: String,
    pub message: String,
    /// First 500 characters of the failing command's output.
    pub output_excerpt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    WaitingForHuman,
    Error,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrentStep {
    Idle,
    Discuss,
    Plan,
    Execute,
    Verify,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchAssignment {
    pub port: u16,
    pub assigned_at: DateTime<Utc>,
}

/// The single JSON document persisted at `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotState {
    pub status: RunStatus,
    pub current_phase: i64,
    pub current_step: CurrentStep,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub pending_questions: Vec<Question>,
    #[serde(default)]
    pub error_history: Vec<ErrorRecord>,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub branches: BTreeMap<String, BranchAssignment>,
}

impl AutopilotState {
    /// A minimal valid state for a fresh project; touches no disk.
    pub fn fresh() -> Self {
        let now = Utc::now();
        Self {
            status: RunStatus::Idle,
            current_phase: 0,
            current_step: CurrentStep::Idle,
            phases: Vec::new(),
            pending_questions: Vec::new(),
            error_history: Vec::new(),
            started_at: now,
            last_updated_at: now,
            branches: BTreeMap::new(),
        }
    }

    /// `round(100 * completed_steps / (4 * N))`; 0 when there are no phases.
    pub fn progress_percent(&self) -> u32 {
        let n = self.phases.len();
        if n == 0 {
            return 0;
        }
        let completed: usize = self.phases.iter().map(|p| p.steps.done_count()).sum();
        let total = 4 * n;
        ((completed as f64 / total as f64) * 100.0).round() as u32
    }

    pub fn phase_mut(&mut self, number: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.number == number)
    }

    pub fn phase(&self, number: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.number == number)
    }
}

/// One row of `events.ndjson`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Running,
    WaitingForHuman,
    Stopping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub status: HeartbeatStatus,
}
