//! Trait definitions for the loop's external collaborators.
//!
//! These traits abstract the agent process, repository change detection,
//! time, and the operator so the controller can be exercised without
//! spawning processes, touching git, or waiting on wall-clock time.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Timestamp source and suspension primitive.
///
/// Sleeping goes through the clock so tests can advance simulated time
/// instead of blocking.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Counts files changed in the repository since a marker.
///
/// # Example
///
/// ```rust,ignore
/// let marker = changes.marker();
/// // ... agent runs ...
/// let changed = changes.changed_files_since(&marker);
/// ```
pub trait ChangeDetector: Send + Sync {
    /// Capture a marker describing the repository before an invocation.
    fn marker(&self) -> String;

    /// Number of distinct files changed in the working tree, the index, and
    /// commits made since `marker`.
    fn changed_files_since(&self, marker: &str) -> u32;
}

/// One agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub loop_number: u32,
    pub prompt: String,
    /// Token used to resume the agent's previous context.
    pub continuity_token: Option<String>,
    /// Hard wall-clock limit.
    pub timeout: Duration,
}

/// Result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentRun {
    /// Process exit code; `None` when killed or terminated by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
    /// Captured stdout and stderr.
    pub output: String,
}

impl AgentRun {
    /// A run that exited with the given code.
    #[must_use]
    pub fn exited(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            timed_out: false,
            duration: Duration::ZERO,
            output: output.into(),
        }
    }

    /// A run that was killed at the timeout.
    #[must_use]
    pub fn timed_out(duration: Duration, output: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            timed_out: true,
            duration,
            output: output.into(),
        }
    }

    /// Only a confirmed exit code of 0 counts as success.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Process-execution primitive for the coding agent.
#[async_trait]
pub trait AgentProcess: Send + Sync {
    /// Run the agent once, bounded by `request.timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or supervised.
    /// Non-zero exits and timeouts are reported through [`AgentRun`].
    async fn run(&self, request: &AgentRequest) -> Result<AgentRun>;
}

/// Operator decision while the external API quota is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorChoice {
    /// Wait for the quota window and try again.
    Wait,
    /// Stop the run.
    Exit,
    /// Nobody answered in time.
    NoResponse,
}

/// Bounded operator input.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Ask whether to wait out an API quota pause. Must return within `timeout`.
    async fn api_limit_choice(&self, timeout: Duration) -> OperatorChoice;
}
