//! Configuration management for the control loop.
//!
//! Configuration is read once at startup from `.ralph/config.toml` and then
//! overridden by explicit environment variables. Missing files fall back to
//! defaults; every value is validated before the loop starts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LoopError, Result};

/// Name of the state directory inside the project.
pub const STATE_DIR: &str = ".ralph";

/// Name of the configuration file inside the state directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Upper bounds accepted by [`LoopConfig::validate`].
pub const MAX_TIMEOUT_MINUTES: u64 = 24 * 60;
pub const MAX_EXPIRY_HOURS: u64 = 365 * 24;
pub const MAX_COOLDOWN_MINUTES: u64 = 7 * 24 * 60;

/// Output format requested from the agent CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Single JSON result object.
    Json,
    /// Plain text.
    Text,
    /// Newline-delimited JSON events.
    StreamJson,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::StreamJson => write!(f, "stream-json"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "text" => Ok(OutputFormat::Text),
            "stream-json" | "stream_json" => Ok(OutputFormat::StreamJson),
            other => Err(LoopError::invalid_config(
                "output_format",
                format!("unknown format '{other}' (expected json, text or stream-json)"),
            )),
        }
    }
}

/// How the agent process is supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Output redirected to a file; the controller polls and tails it.
    Background,
    /// Output consumed line by line through the stream filter.
    Streaming,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Background => write!(f, "background"),
            ExecutionMode::Streaming => write!(f, "streaming"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "background" => Ok(ExecutionMode::Background),
            "streaming" | "stream" => Ok(ExecutionMode::Streaming),
            other => Err(LoopError::invalid_config(
                "execution_mode",
                format!("unknown mode '{other}' (expected background or streaming)"),
            )),
        }
    }
}

/// Agent invocation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable to invoke.
    pub command: String,
    /// Prompt file, relative to the project directory.
    pub prompt_file: PathBuf,
    /// Plan file whose checklist drives `plan_complete`.
    pub plan_file: PathBuf,
    /// Wall-clock timeout per invocation.
    pub timeout_minutes: u64,
    pub output_format: OutputFormat,
    /// Tools the agent may use without asking.
    pub allowed_tools: Vec<String>,
    pub execution_mode: ExecutionMode,
    /// Liveness poll interval in background mode.
    pub poll_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            prompt_file: PathBuf::from("PROMPT.md"),
            plan_file: PathBuf::from("IMPLEMENTATION_PLAN.md"),
            timeout_minutes: 15,
            output_format: OutputFormat::Json,
            allowed_tools: vec![
                "Write".to_string(),
                "Read".to_string(),
                "Edit".to_string(),
                "Bash(git *)".to_string(),
            ],
            execution_mode: ExecutionMode::Background,
            poll_interval_secs: 10,
        }
    }
}

/// Call budget settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_calls_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls_per_hour: 100,
        }
    }
}

/// Continuity settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Resume the agent's previous context between calls.
    pub continuity: bool,
    /// Continuity tokens older than this are discarded.
    pub expiry_hours: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            continuity: true,
            expiry_hours: 24,
        }
    }
}

/// Stagnation detection thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub no_progress_threshold: u32,
    pub same_error_threshold: u32,
    /// Minimum total decline (percent) across the shrinking run.
    pub output_decline_percent: u32,
    /// Length of the trailing shrinking run that is inspected.
    pub output_decline_loops: u32,
    pub cooldown_minutes: u64,
    /// Close an open breaker automatically once the cooldown elapses.
    pub auto_reset: bool,
    /// Reset the breaker when the loop starts.
    pub reset_on_startup: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            no_progress_threshold: 3,
            same_error_threshold: 3,
            output_decline_percent: 70,
            output_decline_loops: 3,
            cooldown_minutes: 30,
            auto_reset: false,
            reset_on_startup: false,
        }
    }
}

/// Complete loop configuration.
///
/// # Example
///
/// ```
/// use ralph_loop::config::LoopConfig;
///
/// let config = LoopConfig::default();
/// assert_eq!(config.rate_limit.max_calls_per_hour, 100);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoopConfig {
    pub agent: AgentConfig,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub verbose: bool,
}

impl LoopConfig {
    /// Load configuration from a project directory, then apply environment overrides.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::load_file(project_dir)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load only the settings file (no environment overrides).
    pub fn load_file(project_dir: &Path) -> Result<Self> {
        let path = Self::config_path(project_dir);
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        toml::from_str(&content)
            .map_err(|e| LoopError::config_with_path(e.to_string(), path.clone()))
    }

    /// Get the state directory for a project
    pub fn state_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR)
    }

    /// Get the config file path for a project
    pub fn config_path(project_dir: &Path) -> PathBuf {
        Self::state_dir(project_dir).join(CONFIG_FILE)
    }

    /// Apply environment overrides using the given lookup.
    ///
    /// The lookup is injected so tests never touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MAX_CALLS_PER_HOUR") {
            self.rate_limit.max_calls_per_hour = parse_env("MAX_CALLS_PER_HOUR", &v)?;
        }
        if let Some(v) = lookup("CLAUDE_TIMEOUT_MINUTES") {
            self.agent.timeout_minutes = parse_env("CLAUDE_TIMEOUT_MINUTES", &v)?;
        }
        if let Some(v) = lookup("CLAUDE_OUTPUT_FORMAT") {
            self.agent.output_format = v.parse()?;
        }
        if let Some(v) = lookup("CLAUDE_ALLOWED_TOOLS") {
            self.agent.allowed_tools = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("CLAUDE_USE_CONTINUE") {
            self.session.continuity = parse_bool("CLAUDE_USE_CONTINUE", &v)?;
        }
        if let Some(v) = lookup("CLAUDE_SESSION_EXPIRY_HOURS") {
            self.session.expiry_hours = parse_env("CLAUDE_SESSION_EXPIRY_HOURS", &v)?;
        }
        if let Some(v) = lookup("CB_NO_PROGRESS_THRESHOLD") {
            self.circuit_breaker.no_progress_threshold =
                parse_env("CB_NO_PROGRESS_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("CB_SAME_ERROR_THRESHOLD") {
            self.circuit_breaker.same_error_threshold = parse_env("CB_SAME_ERROR_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("CB_OUTPUT_DECLINE_PERCENT") {
            self.circuit_breaker.output_decline_percent =
                parse_env("CB_OUTPUT_DECLINE_PERCENT", &v)?;
        }
        if let Some(v) = lookup("CB_COOLDOWN_MINUTES") {
            self.circuit_breaker.cooldown_minutes = parse_env("CB_COOLDOWN_MINUTES", &v)?;
        }
        if let Some(v) = lookup("CB_AUTO_RESET") {
            self.circuit_breaker.auto_reset = parse_bool("CB_AUTO_RESET", &v)?;
        }
        if let Some(v) = lookup("RALPH_RESET_ON_STARTUP") {
            self.circuit_breaker.reset_on_startup = parse_bool("RALPH_RESET_ON_STARTUP", &v)?;
        }
        if let Some(v) = lookup("RALPH_VERBOSE") {
            self.verbose = parse_bool("RALPH_VERBOSE", &v)?;
        }
        if let Some(v) = lookup("RALPH_EXECUTION_MODE") {
            self.agent.execution_mode = v.parse()?;
        }
        Ok(())
    }

    /// Validate all values.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.max_calls_per_hour == 0 {
            return Err(LoopError::invalid_config(
                "max_calls_per_hour",
                "must be greater than zero",
            ));
        }
        if self.agent.timeout_minutes == 0 || self.agent.timeout_minutes > MAX_TIMEOUT_MINUTES {
            return Err(LoopError::invalid_config(
                "timeout_minutes",
                format!("must be between 1 and {MAX_TIMEOUT_MINUTES}"),
            ));
        }
        if self.session.expiry_hours == 0 || self.session.expiry_hours > MAX_EXPIRY_HOURS {
            return Err(LoopError::invalid_config(
                "expiry_hours",
                format!("must be between 1 and {MAX_EXPIRY_HOURS}"),
            ));
        }
        if self.agent.command.trim().is_empty() {
            return Err(LoopError::invalid_config("command", "must not be empty"));
        }
        if self.agent.poll_interval_secs == 0 {
            return Err(LoopError::invalid_config(
                "poll_interval_secs",
                "must be greater than zero",
            ));
        }
        let cb = &self.circuit_breaker;
        if cb.no_progress_threshold == 0 || cb.same_error_threshold == 0 {
            return Err(LoopError::invalid_config(
                "circuit_breaker",
                "thresholds must be greater than zero",
            ));
        }
        if cb.output_decline_percent == 0 || cb.output_decline_percent > 100 {
            return Err(LoopError::invalid_config(
                "output_decline_percent",
                "must be between 1 and 100",
            ));
        }
        if cb.cooldown_minutes > MAX_COOLDOWN_MINUTES {
            return Err(LoopError::invalid_config(
                "cooldown_minutes",
                format!("must be at most {MAX_COOLDOWN_MINUTES}"),
            ));
        }
        if cb.output_decline_loops < 2 {
            return Err(LoopError::invalid_config(
                "output_decline_loops",
                "must be at least 2",
            ));
        }
        Ok(())
    }

    /// Hard limit for one agent invocation.
    #[must_use]
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_minutes.saturating_mul(60))
    }

    /// Age at which a continuity token or lifecycle record expires.
    #[must_use]
    pub fn session_expiry(&self) -> Duration {
        Duration::from_secs(self.session.expiry_hours.saturating_mul(3600))
    }

    /// Output format actually passed to the agent.
    ///
    /// Streaming supervision needs newline-delimited events.
    #[must_use]
    pub fn effective_output_format(&self) -> OutputFormat {
        match self.agent.execution_mode {
            ExecutionMode::Streaming => OutputFormat::StreamJson,
            ExecutionMode::Background => self.agent.output_format,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LoopError::invalid_config(key, format!("cannot parse '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(LoopError::invalid_config(
            key,
            format!("expected a boolean, got '{value}'"),
        )),
    }
}
