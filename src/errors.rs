//! Typed error hierarchy for the autopilot orchestrator.
//!
//! One enum per subsystem, composed with `anyhow::Result` at the command/binary
//! boundary. Each enum implements `std::error::Error` via `thiserror` and most
//! convert into their caller's enum with `#[from]` so `?` keeps working across
//! module boundaries without losing the original error.

use thiserror::Error;

/// Errors from the atomic state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file at {path}: {source}")]
    ParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist state file at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the file-based IPC layer (events, heartbeat, answers, shutdown marker).
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to append event to {path}: {source}")]
    EventWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write answer file at {path}: {source}")]
    AnswerWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed answer file at {path}: {source}")]
    AnswerParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write heartbeat at {path}: {source}")]
    HeartbeatWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the agent subprocess supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("an agent command is already running")]
    AlreadyRunning,

    #[error("failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("failed to write prompt: {0}")]
    PromptWriteFailed(#[source] std::io::Error),

    #[error("agent command timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("agent command aborted")]
    Aborted,

    #[error("no result message received before the agent stream closed")]
    NoResultMessage,

    #[error("failed to parse agent stream message: {0}")]
    StreamParseFailed(#[source] serde_json::Error),
}

/// Errors surfaced while resolving an interactive question.
#[derive(Debug, Error)]
pub enum QuestionError {
    #[error("question {0} is unknown or already answered")]
    UnknownQuestion(String),
}

/// Errors from the phase/step state machine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error("agent command failed twice for phase {phase} step {step}: {message}")]
    Escalated {
        phase: String,
        step: String,
        message: String,
    },

    #[error("shutdown requested")]
    ShutdownRequested,

    #[error("failed to read roadmap at {path}: {source}")]
    RoadmapReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Roadmap(#[from] RoadmapError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the roadmap / verification parser.
#[derive(Debug, Error)]
pub enum RoadmapError {
    #[error("roadmap document contains no phase headings")]
    NoPhasesFound,

    #[error("phase range '{0}' is not a valid range expression")]
    InvalidRange(String),
}

/// Errors from git-repo bootstrapping and snapshotting.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to open or initialize git repository: {0}")]
    OpenOrInitFailed(#[source] git2::Error),

    #[error("failed to resolve current branch: {0}")]
    BranchResolutionFailed(#[source] git2::Error),

    #[error("git operation failed: {0}")]
    Operation(#[source] git2::Error),
}

/// Errors from the HTTP + SSE dashboard server.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("failed to bind listener: {0}")]
    BindFailed(#[source] std::io::Error),
}

/// Errors from the per-branch launcher.
#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("no free port found for branch '{branch}' in range [{base}, {base}+1000)")]
    NoFreePort { branch: String, base: u16 },

    #[error("failed to read PID file at {path}: {source}")]
    PidFileReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write PID file at {path}: {source}")]
    PidFileWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("autopilot is already running for branch '{branch}' (pid {pid})")]
    AlreadyRunning { branch: String, pid: u32 },

    #[error("not running for branch '{0}'")]
    NotRunning(String),

    #[error("failed to spawn detached orchestrator process: {0}")]
    SpawnFailed(#[source] std::io::Error),
}

/// Errors from the layered config loader.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config at field '{field}': {message}")]
    Invalid { field: String, message: String },

    #[error("failed to parse config file at {path}: {source}")]
    ParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_error_already_running_is_matchable() {
        let err = SupervisorError::AlreadyRunning;
        assert!(matches!(err, SupervisorError::AlreadyRunning));
    }

    #[test]
    fn orchestrator_error_escalated_message_contains_fields() {
        let err = OrchestratorError::Escalated {
            phase: "2".into(),
            step: "plan".into(),
            message: "boom".into(),
        };
        let text = err.to_string();
        assert!(text.contains("phase 2"));
        assert!(text.contains("plan"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn orchestrator_error_converts_from_state_error() {
        let inner = StateError::WriteFailed {
            path: "/tmp/state.json".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let err: OrchestratorError = inner.into();
        assert!(matches!(err, OrchestratorError::State(_)));
    }

    #[test]
    fn launcher_error_already_running_carries_pid() {
        let err = LauncherError::AlreadyRunning {
            branch: "main".into(),
            pid: 1234,
        };
        assert!(err.to_string().contains("1234"));
    }

    #[test]
    fn config_error_invalid_carries_field_path() {
        let err = ConfigError::Invalid {
            field: "port".into(),
            message: "must be a number".into(),
        };
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn roadmap_error_invalid_range_carries_input() {
        let err = RoadmapError::InvalidRange("5-3".into());
        assert!(err.to_string().contains("5-3"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StateError::ParseFailed {
            path: "x".into(),
            source: serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
        });
        assert_std_error(&SupervisorError::NoResultMessage);
        assert_std_error(&QuestionError::UnknownQuestion("q1".into()));
        assert_std_error(&RoadmapError::NoPhasesFound);
        assert_std_error(&HttpError::PortInUse(3847));
        assert_std_error(&LauncherError::NotRunning("main".into()));
        assert_std_error(&ConfigError::ParseFailed {
            path: "x".into(),
            source: serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
        });
    }
}
