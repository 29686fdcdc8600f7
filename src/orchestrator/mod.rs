//! Orchestrator state machine (§4.1): the phase/step sequencer that drives
//! the agent subprocess supervisor through discuss → plan → execute →
//! verify for each phase in the roadmap, resuming from whatever step the
//! persisted state says is next, retrying a failing command exactly once
//! before escalating, and running the bounded gap-detection loop after
//! verify reports a gap.
//!
//! This module owns *when* to run a command; [`crate::supervisor`] owns
//! *how* to run one. Every mutation goes through [`crate::state::StateStore`]
//! with persist-before-advance: a step is only marked `done` after its
//! command returned success and the new state has been written to disk, so
//! a crash between those two operations always resumes at the step that
//! was actually in flight, never one step ahead of it.

pub mod prompts;

use crate::config::Config;
use crate::errors::OrchestratorError;
use crate::git;
use crate::ipc::EventWriter;
use crate::model::{
    AutopilotState, CurrentStep, ErrorRecord, Phase, PhaseStatus, RunStatus, Step, StepState,
};
use crate::roadmap;
use crate::state::SharedState;
use crate::supervisor::{AgentSupervisor, CommandOptions};
use chrono::Utc;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Gap-detection loop is bounded to 3 iterations (§4.1c).
const GAP_LOOP_MAX_ITERATIONS: u32 = 3;

/// Project-init runs the agent's planning-document generation, which can
/// legitimately take much longer than a single phase step.
const PROJECT_INIT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

pub struct Orchestrator {
    config: Config,
    state: SharedState,
    supervisor: Arc<AgentSupervisor>,
    events: Arc<EventWriter>,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        state: SharedState,
        supervisor: Arc<AgentSupervisor>,
        events: Arc<EventWriter>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            state,
            supervisor,
            events,
            shutdown,
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    fn is_shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn snapshot(&self) -> AutopilotState {
        self.state.get_state()
    }

    /// Entry point: `run(prdPath, phaseFilter?)`.
    pub async fn run(
        &mut self,
        prd_path: Option<&Path>,
        phase_filter: Option<&[String]>,
    ) -> Result<(), OrchestratorError> {
        self.write_agent_config_sidecar()?;

        if self.snapshot().current_phase == 0 {
            self.run_project_init(prd_path).await?;
        }

        self.state.set_state(|s| {
            if s.status != RunStatus::Complete {
                s.status = RunStatus::Running;
            }
        })?;

        let numbers: Vec<String> = self.snapshot().phases.iter().map(|p| p.number.clone()).collect();
        for number in numbers {
            if self.is_shutdown_requested() {
                return self.persist_idle();
            }

            let Some(phase) = self.snapshot().phase(&number).cloned() else {
                continue;
            };
            if matches!(phase.status, PhaseStatus::Completed | PhaseStatus::Skipped) {
                continue;
            }
            if let Some(filter) = phase_filter {
                if !filter.iter().any(|n| n == &number) {
                    continue;
                }
            }

            match self.run_phase(&number).await {
                Ok(()) => {}
                Err(OrchestratorError::ShutdownRequested) => return Ok(()),
                Err(err) => return Err(err),
            }
        }

        if !self.is_shutdown_requested() {
            self.events.write("build-complete", json!({}))?;
            self.state.set_state(|s| {
                s.status = RunStatus::Complete;
                s.current_step = CurrentStep::Done;
            })?;
        }
        Ok(())
    }

    /// Step 1 of §4.1: write the agent-configuration sidecar, preserving
    /// any user keys already present and only overwriting the
    /// autopilot-owned ones.
    fn write_agent_config_sidecar(&self) -> Result<(), OrchestratorError> {
        let path = self.config.workspace_dir.join("agent-config.json");
        let mut doc: serde_json::Map<String, serde_json::Value> = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();

        doc.insert("modelProfile".to_string(), json!(self.config.model));
        doc.insert("researchDepth".to_string(), json!(self.config.depth));
        doc.insert("planChecker".to_string(), json!(true));
        doc.insert("verifier".to_string(), json!(!self.config.skip_verify));
        doc.insert("parallelization".to_string(), json!(1));

        crate::state::persist_json(&path, &serde_json::Value::Object(doc))?;
        Ok(())
    }

    /// Step 2 of §4.1: ensure a git repo exists, run the agent's
    /// project-init command with an extended timeout, parse the phases it
    /// produced, and persist them.
    async fn run_project_init(&mut self, prd_path: Option<&Path>) -> Result<(), OrchestratorError> {
        git::ensure_repo(&self.config.project_dir)?;

        let prompt = prompts::project_init(prd_path);
        let opts = CommandOptions::new(self.config.project_dir.clone())
            .step("project-init")
            .timeout(PROJECT_INIT_TIMEOUT);
        let result = self.supervisor.run_agent_command(&prompt, opts).await?;
        if !result.success {
            let message = result.error.unwrap_or_else(|| "project-init failed".to_string());
            return Err(OrchestratorError::Escalated {
                phase: "0".to_string(),
                step: "project-init".to_string(),
                message,
            });
        }

        let roadmap_path = self.config.project_dir.join("ROADMAP.md");
        let text = std::fs::read_to_string(&roadmap_path).map_err(|source| {
            OrchestratorError::RoadmapReadFailed {
                path: roadmap_path.clone(),
                source,
            }
        })?;
        let parsed = roadmap::parse_phases(&text)?;

        self.state.set_state(|s| {
            s.phases = parsed
                .iter()
                .map(|p| {
                    let mut phase = Phase::new(p.number.clone(), p.name.clone());
                    if p.completed {
                        phase.status = PhaseStatus::Completed;
                        phase.steps.discuss = StepState::Done;
                        phase.steps.plan = StepState::Done;
                        phase.steps.execute = StepState::Done;
                        phase.steps.verify = StepState::Done;
                        phase.completed_at = Some(Utc::now());
                    }
                    phase
                })
                .collect();
        })?;
        Ok(())
    }

    /// §4.1a: runs each of the four steps for `number`, resume-aware (only
    /// steps not already `done` run), then marks the phase completed.
    async fn run_phase(&mut self, number: &str) -> Result<(), OrchestratorError> {
        let already_in_progress = matches!(
            self.snapshot().phase(number).map(|p| p.status),
            Some(PhaseStatus::InProgress)
        );
        if !already_in_progress {
            let name = self.phase_name(number);
            let number_owned = number.to_string();
            self.state.set_state(|s| {
                s.current_phase = phase_number_prefix(&number_owned);
                if let Some(phase) = s.phase_mut(&number_owned) {
                    phase.status = PhaseStatus::InProgress;
                    if phase.started_at.is_none() {
                        phase.started_at = Some(Utc::now());
                    }
                }
            })?;
            self.events
                .write("phase-started", json!({"phase": number, "name": name}))?;
        }

        for step in Step::ALL {
            if step == Step::Verify && self.config.skip_verify {
                continue;
            }
            let done = self
                .snapshot()
                .phase(number)
                .map(|p| p.steps.get(step) == StepState::Done)
                .unwrap_or(false);
            if done {
                continue;
            }

            if step == Step::Verify {
                self.run_gap_loop(number).await?;
            } else {
                self.run_step(number, step).await?;
            }
        }

        let skip_verify = self.config.skip_verify;
        let newly_completed = self.state.set_state(|s| {
            if let Some(phase) = s.phase_mut(number) {
                if phase.steps.all_done(skip_verify) && phase.status != PhaseStatus::Completed {
                    phase.status = PhaseStatus::Completed;
                    phase.completed_at = Some(Utc::now());
                }
            }
        });
        newly_completed?;

        if matches!(
            self.snapshot().phase(number).map(|p| p.status),
            Some(PhaseStatus::Completed)
        ) {
            let name = self.phase_name(number);
            self.events
                .write("phase-completed", json!({"phase": number, "name": name}))?;
        }
        Ok(())
    }

    fn phase_name(&self, number: &str) -> String {
        self.snapshot()
            .phase(number)
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }

    /// §4.1b: the persist-before-advance step wrapper for discuss/plan/execute.
    async fn run_step(&mut self, number: &str, step: Step) -> Result<(), OrchestratorError> {
        if self.is_shutdown_requested() {
            self.persist_idle()?;
            return Err(OrchestratorError::ShutdownRequested);
        }

        let number_owned = number.to_string();
        self.state.set_state(|s| {
            if let Some(phase) = s.phase_mut(&number_owned) {
                phase.steps.set(step, step.as_entered_state());
            }
            s.current_step = step_to_current(step);
        })?;
        self.events
            .write("step-started", json!({"phase": number, "step": step.name()}))?;

        match self.run_step_work(number, step).await {
            Ok(()) => {
                let number_owned = number.to_string();
                self.state.set_state(|s| {
                    if let Some(phase) = s.phase_mut(&number_owned) {
                        phase.steps.set(step, StepState::Done);
                    }
                })?;
                self.events
                    .write("step-completed", json!({"phase": number, "step": step.name()}))?;
                Ok(())
            }
            Err(OrchestratorError::ShutdownRequested) => {
                self.persist_idle()?;
                Err(OrchestratorError::ShutdownRequested)
            }
            Err(err) => Err(err),
        }
    }

    async fn run_step_work(&mut self, number: &str, step: Step) -> Result<(), OrchestratorError> {
        let name = self.phase_name(number);
        match step {
            Step::Discuss => {
                if self.config.skip_discuss {
                    self.write_canned_context(number, &name)
                } else {
                    let prompt = prompts::discuss(number, &name);
                    self.run_agent_with_retry(number, step, &prompt, None).await
                }
            }
            Step::Plan => {
                let prompt = prompts::plan(number, &name, None);
                self.run_agent_with_retry(number, step, &prompt, None).await
            }
            Step::Execute => {
                let prompt = prompts::execute(number, &name, None);
                self.run_agent_with_retry(number, step, &prompt, None).await
            }
            Step::Verify => unreachable!("verify runs through the gap loop"),
        }
    }

    /// Discuss-skip path: write a deterministic canned context document in
    /// place of invoking the agent, and mark the step done without it.
    fn write_canned_context(&self, number: &str, name: &str) -> Result<(), OrchestratorError> {
        let dir = self.config.project_dir.join(roadmap::phase_dir_name(number, name));
        std::fs::create_dir_all(&dir).map_err(|e| OrchestratorError::Other(e.into()))?;
        let path = dir.join(roadmap::context_file_name(number));
        let content = format!(
            "# Context: Phase {number} — {name}\n\nDiscuss step skipped; this file stands in for the discussion output.\n"
        );
        std::fs::write(&path, content).map_err(|e| OrchestratorError::Other(e.into()))?;
        Ok(())
    }

    /// §4.1c: run verify, inspect the verification/UAT documents, and loop
    /// plan(gaps) → execute(gaps-only) up to [`GAP_LOOP_MAX_ITERATIONS`]
    /// times while gaps keep being found.
    async fn run_gap_loop(&mut self, number: &str) -> Result<(), OrchestratorError> {
        if self.is_shutdown_requested() {
            self.persist_idle()?;
            return Err(OrchestratorError::ShutdownRequested);
        }

        let number_owned = number.to_string();
        self.state.set_state(|s| {
            if let Some(phase) = s.phase_mut(&number_owned) {
                phase.steps.verify = StepState::Verify;
            }
            s.current_step = CurrentStep::Verify;
        })?;
        self.events
            .write("step-started", json!({"phase": number, "step": "verify"}))?;

        for _ in 0..GAP_LOOP_MAX_ITERATIONS {
            if self.is_shutdown_requested() {
                self.persist_idle()?;
                return Err(OrchestratorError::ShutdownRequested);
            }

            let name = self.phase_name(number);
            let verify_prompt = prompts::verify(number, &name);
            match self.run_agent_with_retry(number, Step::Verify, &verify_prompt, None).await {
                Ok(()) => {}
                Err(OrchestratorError::ShutdownRequested) => {
                    self.persist_idle()?;
                    return Err(OrchestratorError::ShutdownRequested);
                }
                Err(err) => return Err(err),
            }

            if !self.check_for_gaps(number)? {
                let number_owned = number.to_string();
                self.state.set_state(|s| {
                    if let Some(phase) = s.phase_mut(&number_owned) {
                        phase.steps.verify = StepState::Done;
                    }
                })?;
                self.events
                    .write("step-completed", json!({"phase": number, "step": "verify"}))?;
                return Ok(());
            }

            let name = self.phase_name(number);
            let plan_prompt = prompts::plan(number, &name, Some("gaps"));
            self.run_agent_with_retry(number, Step::Plan, &plan_prompt, None).await?;
            let execute_prompt = prompts::execute(number, &name, Some("gaps-only"));
            self.run_agent_with_retry(number, Step::Execute, &execute_prompt, None).await?;

            let number_owned = number.to_string();
            self.state.set_state(|s| {
                if let Some(phase) = s.phase_mut(&number_owned) {
                    phase.gap_iterations += 1;
                    phase.steps.verify = StepState::Idle;
                }
            })?;
        }

        let iterations = self
            .snapshot()
            .phase(number)
            .map(|p| p.gap_iterations)
            .unwrap_or(GAP_LOOP_MAX_ITERATIONS);
        self.events
            .write("gap-escalated", json!({"phase": number, "iterations": iterations}))?;
        Ok(())
    }

    /// Reads `<NN>-VERIFICATION.md` and `<NN>-UAT.md` from the phase's
    /// on-disk folder and applies the gap predicate (§4.1c).
    fn check_for_gaps(&self, number: &str) -> Result<bool, OrchestratorError> {
        let name = self.phase_name(number);
        let dir = self.config.project_dir.join(roadmap::phase_dir_name(number, &name));
        let verification = std::fs::read_to_string(dir.join(roadmap::verification_file_name(number))).ok();
        let uat = std::fs::read_to_string(dir.join(roadmap::uat_file_name(number))).ok();
        Ok(roadmap::check_for_gaps(verification.as_deref(), uat.as_deref()))
    }

    /// §4.1d: run once, and on failure (when shutdown isn't the cause)
    /// retry exactly once before recording an `ErrorRecord` and escalating.
    async fn run_agent_with_retry(
        &mut self,
        number: &str,
        step: Step,
        prompt: &str,
        timeout: Option<Duration>,
    ) -> Result<(), OrchestratorError> {
        let opts = |t: Option<Duration>| {
            let mut opts = CommandOptions::new(self.config.project_dir.clone())
                .phase(number.to_string())
                .step(step.name().to_string());
            if let Some(t) = t {
                opts = opts.timeout(t);
            }
            opts
        };

        let first = self.supervisor.run_agent_command(prompt, opts(timeout)).await?;
        if first.success {
            return Ok(());
        }
        if self.is_shutdown_requested() {
            return Err(OrchestratorError::ShutdownRequested);
        }

        let second = self.supervisor.run_agent_command(prompt, opts(timeout)).await?;
        if second.success {
            return Ok(());
        }
        if self.is_shutdown_requested() {
            return Err(OrchestratorError::ShutdownRequested);
        }

        let message = second.error.unwrap_or_else(|| "agent command failed".to_string());
        let excerpt: String = message.chars().take(500).collect();
        let number_owned = number.to_string();
        let step_name = step.name().to_string();
        self.state.set_state(|s| {
            s.error_history.push(ErrorRecord {
                timestamp: Utc::now(),
                phase: number_owned.clone(),
                step: step_name.clone(),
                message: message.clone(),
                output_excerpt: excerpt,
            });
            s.status = RunStatus::Error;
        })?;
        self.events.write(
            "error-escalation",
            json!({
                "phase": number,
                "step": step.name(),
                "error": message,
                "options": ["retry", "skip", "abort"],
            }),
        )?;
        Err(OrchestratorError::Escalated {
            phase: number.to_string(),
            step: step.name().to_string(),
            message: message.clone(),
        })
    }

    fn persist_idle(&mut self) -> Result<(), OrchestratorError> {
        self.state.set_state(|s| {
            s.status = RunStatus::Idle;
            s.current_step = CurrentStep::Idle;
        })?;
        Ok(())
    }
}

fn step_to_current(step: Step) -> CurrentStep {
    match step {
        Step::Discuss => CurrentStep::Discuss,
        Step::Plan => CurrentStep::Plan,
        Step::Execute => CurrentStep::Execute,
        Step::Verify => CurrentStep::Verify,
    }
}

/// `"3"` -> `3`, `"3.1"` -> `3`: `currentPhase` only tracks the integer
/// prefix, matching the persisted state document's `i64` field.
fn phase_number_prefix(number: &str) -> i64 {
    number.split('.').next().unwrap_or("0").parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use crate::questions::QuestionHandler;
    use tempfile::TempDir;

    fn success_script() -> Vec<String> {
        vec![
            "-c".to_string(),
            r#"echo '{"type":"result","subtype":"success","is_error":false,"result":"ok"}'"#.to_string(),
        ]
    }

    /// Fails on the first invocation (no counter file present yet), then
    /// succeeds on every call after, by dropping a marker file in `dir`.
    fn fail_then_succeed_script(dir: &Path) -> Vec<String> {
        let marker = dir.join("invoked-once");
        vec![
            "-c".to_string(),
            format!(
                r#"if [ -f "{marker}" ]; then
  echo '{{"type":"result","subtype":"success","is_error":false,"result":"ok"}}'
else
  touch "{marker}"
  echo '{{"type":"result","subtype":"error_during_execution","is_error":true,"result":"boom"}}'
fi"#,
                marker = marker.display()
            ),
        ]
    }

    struct Harness {
        dir: TempDir,
        config: Config,
        shutdown_tx: watch::Sender<bool>,
    }

    impl Harness {
        fn new(skip_discuss: bool, skip_verify: bool) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut raw = RawConfig::default();
            raw.skip_discuss = Some(skip_discuss);
            raw.skip_verify = Some(skip_verify);
            let config = Config::load(dir.path().to_path_buf(), raw).unwrap();
            let (shutdown_tx, _rx) = watch::channel(false);
            Self {
                dir,
                config,
                shutdown_tx,
            }
        }

        fn orchestrator(&self, agent_args: Vec<String>) -> Orchestrator {
            let store = crate::state::StateStore::create_fresh(self.config.state_file());
            let state = SharedState::new(store);
            state
                .set_state(|s| {
                    s.phases.push(Phase::new("1", "Setup"));
                    s.current_phase = 1;
                })
                .unwrap();

            let events = Arc::new(EventWriter::new(self.config.events_file()));
            let questions = Arc::new(QuestionHandler::with_state(state.clone()));
            let supervisor = Arc::new(AgentSupervisor::new(
                "sh",
                agent_args,
                questions,
                events.clone(),
                self.shutdown_tx.subscribe(),
            ));
            Orchestrator::new(self.config.clone(), state, supervisor, events, self.shutdown_tx.subscribe())
        }
    }

    #[tokio::test]
    async fn single_phase_completes_with_no_gaps() {
        let harness = Harness::new(true, false);
        std::fs::create_dir_all(harness.config.project_dir.join("01-setup")).unwrap();
        std::fs::write(
            harness.config.project_dir.join("01-setup/01-VERIFICATION.md"),
            "status: passed",
        )
        .unwrap();

        let mut orchestrator = harness.orchestrator(success_script());
        orchestrator.run(None, None).await.unwrap();

        let state = orchestrator.state().get_state();
        assert_eq!(state.phases[0].status, PhaseStatus::Completed);
        assert_eq!(state.status, RunStatus::Complete);
        assert!(state.phases[0].steps.all_done(false));

        let raw = std::fs::read_to_string(harness.config.events_file()).unwrap();
        let kinds: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<crate::model::Event>(line).ok())
            .map(|e| e.event)
            .collect();
        assert!(kinds.contains(&"phase-started".to_string()));
        assert!(kinds.contains(&"phase-completed".to_string()));
        assert!(kinds.contains(&"build-complete".to_string()));
    }

    #[tokio::test]
    async fn retry_recovers_from_a_single_failure() {
        let harness = Harness::new(true, true);
        std::fs::create_dir_all(harness.config.project_dir.join("01-setup")).unwrap();

        let agent_args = fail_then_succeed_script(harness.dir.path());
        let mut orchestrator = harness.orchestrator(agent_args);
        orchestrator.run(None, None).await.unwrap();

        let state = orchestrator.state().get_state();
        assert_eq!(state.phases[0].status, PhaseStatus::Completed);
        assert!(state.error_history.is_empty());
    }

    #[tokio::test]
    async fn gap_loop_escalates_after_three_iterations() {
        let harness = Harness::new(true, false);
        let phase_dir = harness.config.project_dir.join("01-setup");
        std::fs::create_dir_all(&phase_dir).unwrap();
        std::fs::write(phase_dir.join("01-VERIFICATION.md"), "status: gaps_found").unwrap();

        let mut orchestrator = harness.orchestrator(success_script());
        orchestrator.run(None, None).await.unwrap();

        let state = orchestrator.state().get_state();
        assert_eq!(state.phases[0].gap_iterations, GAP_LOOP_MAX_ITERATIONS);
        assert_ne!(state.phases[0].status, PhaseStatus::Completed);
    }

    #[tokio::test]
    async fn escalates_after_two_consecutive_failures() {
        let harness = Harness::new(true, true);
        std::fs::create_dir_all(harness.config.project_dir.join("01-setup")).unwrap();

        let always_fail = vec![
            "-c".to_string(),
            r#"echo '{"type":"result","subtype":"error_during_execution","is_error":true,"result":"boom"}'"#
                .to_string(),
        ];
        let mut orchestrator = harness.orchestrator(always_fail);
        let err = orchestrator.run(None, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Escalated { .. }));

        let state = orchestrator.state().get_state();
        assert_eq!(state.error_history.len(), 1);
        assert_eq!(state.status, RunStatus::Error);
    }

    #[tokio::test]
    async fn shutdown_prevents_step_from_advancing() {
        let harness = Harness::new(true, true);
        std::fs::create_dir_all(harness.config.project_dir.join("01-setup")).unwrap();
        harness.shutdown_tx.send(true).unwrap();

        let mut orchestrator = harness.orchestrator(success_script());
        orchestrator.run(None, None).await.unwrap();

        let state = orchestrator.state().get_state();
        assert_eq!(state.status, RunStatus::Idle);
        assert_ne!(state.phases[0].status, PhaseStatus::Completed);
    }

    #[test]
    fn phase_number_prefix_strips_decimal_suffix() {
        assert_eq!(phase_number_prefix("3"), 3);
        assert_eq!(phase_number_prefix("3.1"), 3);
    }
}
