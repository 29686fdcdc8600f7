//! Layered configuration loader.
//!
//! Precedence, highest wins: CLI flags > environment variables (prefix
//! `GSD_AUTOPILOT_`, `UPPER_SNAKE_CASE` -> field name, `"true"`/`"false"`
//! and digit-only strings coerced to bool/number) > `.gsd-autopilot.json`
//! in the project root > derived defaults > built-in defaults.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "GSD_AUTOPILOT_";
const CONFIG_FILE_NAME: &str = ".gsd-autopilot.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Quick,
    Standard,
    Comprehensive,
}

impl Default for Depth {
    fn default() -> Self {
        Depth::Standard
    }
}

impl std::str::FromStr for Depth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quick" => Ok(Depth::Quick),
            "standard" => Ok(Depth::Standard),
            "comprehensive" => Ok(Depth::Comprehensive),
            other => Err(format!(
                "unknown depth '{other}', expected quick|standard|comprehensive"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProfile {
    Quality,
    Balanced,
    Budget,
}

impl Default for ModelProfile {
    fn default() -> Self {
        ModelProfile::Balanced
    }
}

impl std::str::FromStr for ModelProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quality" => Ok(ModelProfile::Quality),
            "balanced" => Ok(ModelProfile::Balanced),
            "budget" => Ok(ModelProfile::Budget),
            other => Err(format!(
                "unknown model profile '{other}', expected quality|balanced|budget"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyAdapter {
    Console,
    System,
    Teams,
    Slack,
    Webhook,
}

impl Default for NotifyAdapter {
    fn default() -> Self {
        NotifyAdapter::Console
    }
}

impl std::str::FromStr for NotifyAdapter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "console" => Ok(NotifyAdapter::Console),
            "system" => Ok(NotifyAdapter::System),
            "teams" => Ok(NotifyAdapter::Teams),
            "slack" => Ok(NotifyAdapter::Slack),
            "webhook" => Ok(NotifyAdapter::Webhook),
            other => Err(format!(
                "unknown notify adapter '{other}', expected console|system|teams|slack|webhook"
            )),
        }
    }
}

/// The fields that can come from any layer. Every field is optional here;
/// [`RawConfig::merge`] keeps the first non-`None` value across layers in
/// precedence order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub prd: Option<PathBuf>,
    #[serde(default)]
    pub resume: Option<bool>,
    #[serde(default)]
    pub phases: Option<String>,
    #[serde(default)]
    pub skip_discuss: Option<bool>,
    #[serde(default)]
    pub skip_verify: Option<bool>,
    #[serde(default)]
    pub depth: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub notify: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub adapter_path: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub verbose: Option<bool>,
    #[serde(default)]
    pub quiet: Option<bool>,
    #[serde(default)]
    pub agent_cmd: Option<String>,
}

impl RawConfig {
    /// Merges `other` into `self`, keeping `self`'s value wherever it is
    /// already set. Call in precedence order, highest layer first:
    /// `cli.merge(env); cli.merge(file)`.
    pub fn merge(mut self, other: RawConfig) -> Self {
        self.prd = self.prd.or(other.prd);
        self.resume = self.resume.or(other.resume);
        self.phases = self.phases.or(other.phases);
        self.skip_discuss = self.skip_discuss.or(other.skip_discuss);
        self.skip_verify = self.skip_verify.or(other.skip_verify);
        self.depth = self.depth.or(other.depth);
        self.model = self.model.or(other.model);
        self.notify = self.notify.or(other.notify);
        self.webhook_url = self.webhook_url.or(other.webhook_url);
        self.adapter_path = self.adapter_path.or(other.adapter_path);
        self.port = self.port.or(other.port);
        self.verbose = self.verbose.or(other.verbose);
        self.quiet = self.quiet.or(other.quiet);
        self.agent_cmd = self.agent_cmd.or(other.agent_cmd);
        self
    }

    /// Reads `GSD_AUTOPILOT_*` environment variables into a [`RawConfig`].
    /// Bool fields accept `"true"`/`"false"` (case-insensitive); numeric
    /// fields accept digit-only strings.
    pub fn from_env() -> Self {
        Self {
            prd: env_path("PRD"),
            resume: env_bool("RESUME"),
            phases: env_string("PHASES"),
            skip_discuss: env_bool("SKIP_DISCUSS"),
            skip_verify: env_bool("SKIP_VERIFY"),
            depth: env_string("DEPTH"),
            model: env_string("MODEL"),
            notify: env_string("NOTIFY"),
            webhook_url: env_string("WEBHOOK_URL"),
            adapter_path: env_path("ADAPTER_PATH"),
            port: env_u16("PORT"),
            verbose: env_bool("VERBOSE"),
            quiet: env_bool("QUIET"),
            agent_cmd: env_string("AGENT_CMD"),
        }
    }

    /// Loads `.gsd-autopilot.json` from `project_dir`; an absent file is not
    /// an error and yields an all-`None` config.
    pub fn from_file(project_dir: &Path) -> Result<Self, ConfigError> {
        let path = project_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFailed {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::ParseFailed { path, source })
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}")).ok()
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_string(key).map(PathBuf::from)
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| v.eq_ignore_ascii_case("true"))
}

fn env_u16(key: &str) -> Option<u16> {
    env_string(key).and_then(|v| v.parse().ok())
}

/// Fully resolved configuration, passed by value (never a global singleton)
/// through construction of the orchestrator, supervisor and HTTP server.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub prd: Option<PathBuf>,
    pub resume: bool,
    pub phases: Option<String>,
    pub skip_discuss: bool,
    pub skip_verify: bool,
    pub depth: Depth,
    pub model: ModelProfile,
    pub notify: NotifyAdapter,
    pub webhook_url: Option<String>,
    pub adapter_path: Option<PathBuf>,
    pub port: u16,
    pub verbose: bool,
    pub quiet: bool,
    pub agent_cmd: String,
}

/// Relative path of the reserved workspace subdirectory, per spec: under a
/// reserved subdirectory of the project (conventionally `.planning/autopilot/`).
pub const WORKSPACE_SUBDIR: &str = ".planning/autopilot";

pub const DEFAULT_PORT: u16 = 3847;

impl Config {
    /// Merges `cli` (highest precedence) with env vars and the project
    /// config file, then fills in derived and built-in defaults.
    pub fn load(project_dir: PathBuf, cli: RawConfig) -> Result<Self, ConfigError> {
        let env = RawConfig::from_env();
        let file = RawConfig::from_file(&project_dir)?;
        let raw = cli.merge(env).merge(file);

        let depth = parse_or_invalid("depth", raw.depth.as_deref())?.unwrap_or_default();
        let model = parse_or_invalid("model", raw.model.as_deref())?.unwrap_or_default();
        let notify = parse_or_invalid("notify", raw.notify.as_deref())?.unwrap_or_default();

        if notify == NotifyAdapter::Webhook && raw.webhook_url.is_none() {
            return Err(ConfigError::Invalid {
                field: "webhookUrl".to_string(),
                message: "required when notify adapter is 'webhook'".to_string(),
            });
        }

        Ok(Self {
            workspace_dir: project_dir.join(WORKSPACE_SUBDIR),
            project_dir,
            prd: raw.prd,
            resume: raw.resume.unwrap_or(false),
            phases: raw.phases,
            skip_discuss: raw.skip_discuss.unwrap_or(false),
            skip_verify: raw.skip_verify.unwrap_or(false),
            depth,
            model,
            notify,
            webhook_url: raw.webhook_url,
            adapter_path: raw.adapter_path,
            port: raw.port.unwrap_or(DEFAULT_PORT),
            verbose: raw.verbose.unwrap_or(false),
            quiet: raw.quiet.unwrap_or(false),
            agent_cmd: raw.agent_cmd.unwrap_or_else(|| "claude".to_string()),
        })
    }

    pub fn state_file(&self) -> PathBuf {
        self.workspace_dir.join("state.json")
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.workspace_dir.join("heartbeat.json")
    }

    pub fn shutdown_marker_file(&self) -> PathBuf {
        self.workspace_dir.join("shutdown")
    }

    pub fn events_file(&self) -> PathBuf {
        self.workspace_dir.join("events.ndjson")
    }

    pub fn answers_dir(&self) -> PathBuf {
        self.workspace_dir.join("answers")
    }

    pub fn pid_file(&self, branch: &str) -> PathBuf {
        self.workspace_dir
            .join(format!("{}.pid", sanitize_branch(branch)))
    }
}

/// `/` -> `--`, per the launcher's PID file naming rule.
pub fn sanitize_branch(branch: &str) -> String {
    branch.replace('/', "--")
}

fn parse_or_invalid<T>(field: &str, value: Option<&str>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr<Err = String>,
{
    match value {
        None => Ok(None),
        Some(s) => s
            .parse::<T>()
            .map(Some)
            .map_err(|message| ConfigError::Invalid {
                field: field.to_string(),
                message,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn merge_keeps_highest_precedence_value() {
        let cli = RawConfig {
            port: Some(9000),
            ..Default::default()
        };
        let env = RawConfig {
            port: Some(9001),
            verbose: Some(true),
            ..Default::default()
        };
        let merged = cli.merge(env);
        assert_eq!(merged.port, Some(9000));
        assert!(merged.verbose.unwrap());
    }

    #[test]
    fn load_fills_builtin_defaults_when_nothing_set() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf(), RawConfig::default()).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.depth, Depth::Standard);
        assert_eq!(config.model, ModelProfile::Balanced);
        assert_eq!(config.notify, NotifyAdapter::Console);
        assert!(!config.resume);
        assert!(!config.skip_verify);
    }

    #[test]
    fn load_reads_project_file() {
        let dir = tempdir().unwrap();
        // RawConfig's field names (snake_case) are what the file uses.
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"port": 4100, "skip_verify": true}"#,
        )
        .unwrap();
        let config = Config::load(dir.path().to_path_buf(), RawConfig::default()).unwrap();
        assert_eq!(config.port, 4100);
        assert!(config.skip_verify);
    }

    #[test]
    fn cli_overrides_file() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"port": 4100}"#,
        )
        .unwrap();
        let cli = RawConfig {
            port: Some(5555),
            ..Default::default()
        };
        let config = Config::load(dir.path().to_path_buf(), cli).unwrap();
        assert_eq!(config.port, 5555);
    }

    #[test]
    fn env_overrides_file_but_not_cli() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"port": 4100}"#,
        )
        .unwrap();
        unsafe { std::env::set_var("GSD_AUTOPILOT_PORT", "4200") };
        let config = Config::load(dir.path().to_path_buf(), RawConfig::default()).unwrap();
        assert_eq!(config.port, 4200);
        unsafe { std::env::remove_var("GSD_AUTOPILOT_PORT") };
    }

    #[test]
    fn invalid_depth_reports_field_path() {
        let cli = RawConfig {
            depth: Some("blazing".to_string()),
            ..Default::default()
        };
        let dir = tempdir().unwrap();
        let err = Config::load(dir.path().to_path_buf(), cli).unwrap_err();
        match err {
            ConfigError::Invalid { field, message } => {
                assert_eq!(field, "depth");
                assert!(message.contains("blazing"));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn webhook_adapter_requires_webhook_url() {
        let cli = RawConfig {
            notify: Some("webhook".to_string()),
            ..Default::default()
        };
        let dir = tempdir().unwrap();
        let err = Config::load(dir.path().to_path_buf(), cli).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == "webhookUrl"));
    }

    #[test]
    fn sanitize_branch_replaces_slashes() {
        assert_eq!(sanitize_branch("feature/foo"), "feature--foo");
        assert_eq!(sanitize_branch("main"), "main");
    }

    #[test]
    fn workspace_paths_are_under_reserved_subdir() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf(), RawConfig::default()).unwrap();
        assert!(config.state_file().ends_with(".planning/autopilot/state.json"));
        assert!(config.pid_file("main").ends_with(".planning/autopilot/main.pid"));
    }
}
