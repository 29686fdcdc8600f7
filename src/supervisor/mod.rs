//! Agent subprocess supervisor: spawns exactly one agent command at a
//! time, streams its structured stdout, arbitrates tool-use requests
//! (routing `AskUserQuestion` to the question handler), and turns
//! cancellation/timeout into a typed `CommandResult` instead of a panic
//! or a hang.

pub mod stream;

use crate::errors::SupervisorError;
use crate::ipc::EventWriter;
use crate::questions::QuestionHandler;
use crate::supervisor::stream::{ContentBlock, StreamEvent, ASK_USER_QUESTION_TOOL};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    pub session_id: String,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
}

pub struct CommandOptions {
    pub cwd: PathBuf,
    pub phase: Option<String>,
    pub step: Option<String>,
    pub timeout: Option<Duration>,
}

impl CommandOptions {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            phase: None,
            step: None,
            timeout: None,
        }
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct AgentSupervisor {
    agent_cmd: String,
    agent_args: Vec<String>,
    questions: Arc<QuestionHandler>,
    events: Arc<EventWriter>,
    shutdown: tokio::sync::watch::Receiver<bool>,
    running: AtomicBool,
}

impl AgentSupervisor {
    pub fn new(
        agent_cmd: impl Into<String>,
        agent_args: Vec<String>,
        questions: Arc<QuestionHandler>,
        events: Arc<EventWriter>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Self {
        Self {
            agent_cmd: agent_cmd.into(),
            agent_args,
            questions,
            events,
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn run_agent_command(
        &self,
        prompt: &str,
        opts: CommandOptions,
    ) -> Result<CommandResult, SupervisorError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SupervisorError::AlreadyRunning);
        }
        let outcome = self.run_agent_command_inner(prompt, opts).await;
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_agent_command_inner(
        &self,
        prompt: &str,
        opts: CommandOptions,
    ) -> Result<CommandResult, SupervisorError> {
        let started = Instant::now();
        let mut child = Command::new(&self.agent_cmd)
            .args(&self.agent_args)
            .current_dir(&opts.cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(SupervisorError::SpawnFailed)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(SupervisorError::PromptWriteFailed)?;
            let _ = stdin.shutdown().await;
        }

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();

        let mut session_id = String::new();
        let mut accumulated_text = String::new();
        let mut final_result: Option<String> = None;
        let mut is_error = false;
        let mut cost_usd = None;
        let mut num_turns = None;
        let mut saw_result = false;

        let mut shutdown_rx = self.shutdown.clone();
        let timeout_sleep = match opts.timeout {
            Some(d) => tokio::time::sleep(d),
            None => tokio::time::sleep(Duration::from_secs(u64::MAX / 2)),
        };
        tokio::pin!(timeout_sleep);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed(), if !*shutdown_rx.borrow() => {
                    if *shutdown_rx.borrow() {
                        self.questions.reject_all();
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return Ok(aborted_result(session_id, started));
                    }
                }
                _ = &mut timeout_sleep => {
                    self.questions.reject_all();
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Ok(timed_out_result(session_id, started, opts.timeout));
                }
                line = lines.next_line() => {
                    let Some(line) = line.map_err(SupervisorError::SpawnFailed)? else {
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event: StreamEvent = match serde_json::from_str(&line) {
                        Ok(e) => e,
                        Err(_) => continue,
                    };

                    // Routing a question to the handler can block waiting for
                    // a human answer; race that wait against shutdown/timeout
                    // too, or a stop/timeout arriving mid-question would hang
                    // here instead of aborting the stream (the outer select's
                    // shutdown/timeout arms can't run while this is awaited).
                    if let Some(question_fut) = self.question_future(&event, &opts) {
                        tokio::pin!(question_fut);
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.changed(), if !*shutdown_rx.borrow() => {
                                if *shutdown_rx.borrow() {
                                    self.questions.reject_all();
                                    let _ = child.start_kill();
                                    let _ = child.wait().await;
                                    return Ok(aborted_result(session_id, started));
                                }
                            }
                            _ = &mut timeout_sleep => {
                                self.questions.reject_all();
                                let _ = child.start_kill();
                                let _ = child.wait().await;
                                return Ok(timed_out_result(session_id, started, opts.timeout));
                            }
                            _ = &mut question_fut => {}
                        }
                    }

                    match event {
                        StreamEvent::System { subtype, session_id: sid } => {
                            if subtype == "init" && !sid.is_empty() {
                                session_id = sid;
                            }
                        }
                        StreamEvent::Assistant { message, session_id: sid } => {
                            if !sid.is_empty() {
                                session_id = sid;
                            }
                            for block in message.content {
                                if let ContentBlock::Text { text } = block {
                                    accumulated_text.push_str(&text);
                                }
                            }
                        }
                        StreamEvent::Result { subtype, result, is_error: err, total_cost_usd, num_turns: turns, .. } => {
                            saw_result = true;
                            is_error = !stream::result_is_success(&subtype, err);
                            final_result = result;
                            cost_usd = total_cost_usd;
                            num_turns = turns;
                        }
                        _ => {}
                    }
                }
            }
            if saw_result {
                // Drain any remaining buffered lines isn't necessary; the
                // agent closes stdout shortly after its terminal message.
                break;
            }
        }

        let _ = child.wait().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if !saw_result {
            return Err(SupervisorError::NoResultMessage);
        }

        let combined = final_result.unwrap_or(accumulated_text);
        Ok(CommandResult {
            success: !is_error,
            result: Some(combined.clone()),
            error: if is_error { Some(combined) } else { None },
            session_id,
            duration_ms,
            cost_usd,
            num_turns,
        })
    }

    /// Builds the pending-question future for the first `AskUserQuestion`
    /// tool-use block in an assistant message, if any. Returned instead of
    /// awaited directly so the caller can race it against shutdown/timeout
    /// rather than blocking the read loop on a human answer.
    fn question_future<'a>(
        &'a self,
        event: &StreamEvent,
        opts: &CommandOptions,
    ) -> Option<impl std::future::Future<Output = ()> + 'a> {
        let StreamEvent::Assistant { message, .. } = event else {
            return None;
        };
        for block in &message.content {
            if let ContentBlock::ToolUse { name, input, .. } = block {
                if name == ASK_USER_QUESTION_TOOL {
                    if let Some(items) = parse_question_items(input) {
                        let phase = opts.phase.clone().unwrap_or_default();
                        let step = opts.step.clone().unwrap_or_default();
                        return Some(async move {
                            let _ = self
                                .questions
                                .handle_question(&items, &phase, &step, &self.events)
                                .await;
                        });
                    }
                }
            }
        }
        None
    }
}

fn parse_question_items(input: &serde_json::Value) -> Option<Vec<crate::model::QuestionItem>> {
    let items = input.get("items")?;
    serde_json::from_value(items.clone()).ok()
}

fn aborted_result(session_id: String, started: Instant) -> CommandResult {
    CommandResult {
        success: false,
        result: None,
        error: Some("agent command aborted".to_string()),
        session_id,
        duration_ms: started.elapsed().as_millis() as u64,
        cost_usd: None,
        num_turns: None,
    }
}

fn timed_out_result(session_id: String, started: Instant, timeout: Option<Duration>) -> CommandResult {
    CommandResult {
        success: false,
        result: None,
        error: Some(format!("agent command timed out after {:?}", timeout.unwrap_or_default())),
        session_id,
        duration_ms: started.elapsed().as_millis() as u64,
        cost_usd: None,
        num_turns: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_supervisor() -> (AgentSupervisor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let questions = Arc::new(QuestionHandler::new());
        let events = Arc::new(EventWriter::new(dir.path().join("events.ndjson")));
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let supervisor = AgentSupervisor::new("true", vec![], questions, events, rx);
        (supervisor, dir)
    }

    #[tokio::test]
    async fn rejects_second_concurrent_invocation() {
        let (supervisor, dir) = test_supervisor();
        let supervisor = Arc::new(supervisor);
        let s2 = supervisor.clone();
        let opts = CommandOptions::new(dir.path().to_path_buf());
        let opts2 = CommandOptions::new(dir.path().to_path_buf());

        // Use `cat` in place of a real agent binary so the first call
        // blocks on stdin long enough for the second call to race it.
        // `true` exits immediately, so instead drive the guard directly.
        supervisor.running.store(true, Ordering::SeqCst);
        let result = s2.run_agent_command("prompt", opts2).await;
        assert!(matches!(result, Err(SupervisorError::AlreadyRunning)));
        supervisor.running.store(false, Ordering::SeqCst);
        let _ = opts;
    }

    #[test]
    fn parse_question_items_reads_items_array() {
        let input = serde_json::json!({
            "items": [{"question": "Proceed?", "header": "", "options": [], "multiSelect": false}]
        });
        let items = parse_question_items(&input).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].question, "Proceed?");
    }

    #[test]
    fn parse_question_items_returns_none_without_items_key() {
        let input = serde_json::json!({});
        assert!(parse_question_items(&input).is_none());
    }
}
