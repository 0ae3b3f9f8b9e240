//! Mock implementations of the collaborator traits.
//!
//! These mocks provide controllable test doubles, enabling deterministic
//! controller tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::LoopError;

use super::traits::{
    AgentProcess, AgentRequest, AgentRun, ChangeDetector, Clock, OperatorChoice, OperatorPrompt,
};

/// Simulated clock. `sleep` advances time instantly.
///
/// Clones share the same time source.
///
/// # Example
///
/// ```rust
/// use ralph_loop::testing::{Clock, MockClock};
///
/// let clock = MockClock::at("2025-03-01T10:15:00Z");
/// clock.advance(chrono::Duration::minutes(50));
/// assert_eq!(clock.now().to_rfc3339(), "2025-03-01T11:05:00+00:00");
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    slept: Arc<Mutex<Duration>>,
}

impl MockClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            slept: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Create a clock from an RFC 3339 timestamp.
    ///
    /// # Panics
    ///
    /// Panics if the timestamp does not parse; intended for tests only.
    #[must_use]
    pub fn at(rfc3339: &str) -> Self {
        let now = DateTime::parse_from_rfc3339(rfc3339)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|e| panic!("invalid test timestamp {rfc3339}: {e}"));
        Self::new(now)
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }

    /// Total simulated time spent in `sleep`.
    #[must_use]
    pub fn total_slept(&self) -> Duration {
        self.slept.lock().map(|s| *s).unwrap_or_default()
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(by) = chrono::Duration::from_std(duration) {
            self.advance(by);
        }
        if let Ok(mut slept) = self.slept.lock() {
            *slept += duration;
        }
    }
}

/// Change detector returning scripted counts.
#[derive(Debug, Clone, Default)]
pub struct MockChangeDetector {
    counts: Arc<Mutex<VecDeque<u32>>>,
    fallback: u32,
}

impl MockChangeDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts returned by successive calls.
    #[must_use]
    pub fn with_changes(self, counts: Vec<u32>) -> Self {
        if let Ok(mut queue) = self.counts.lock() {
            queue.extend(counts);
        }
        self
    }

    /// Count returned once the script is exhausted.
    #[must_use]
    pub fn with_fallback(mut self, count: u32) -> Self {
        self.fallback = count;
        self
    }
}

impl ChangeDetector for MockChangeDetector {
    fn marker(&self) -> String {
        "mock-marker".to_string()
    }

    fn changed_files_since(&self, _marker: &str) -> u32 {
        self.counts
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(self.fallback)
    }
}

/// Agent process returning scripted runs and recording requests.
///
/// # Example
///
/// ```rust,ignore
/// let agent = MockAgentProcess::new()
///     .with_run(AgentRun::exited(0, "done"))
///     .with_spawn_error("not installed");
/// ```
#[derive(Debug, Clone)]
enum ScriptedFailure {
    Spawn(String),
    NotInstalled(String),
}

#[derive(Debug, Clone, Default)]
pub struct MockAgentProcess {
    script: Arc<Mutex<VecDeque<Result<AgentRun, ScriptedFailure>>>>,
    requests: Arc<Mutex<Vec<AgentRequest>>>,
    fallback: AgentRun,
}

impl MockAgentProcess {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fallback: AgentRun::exited(0, ""),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_run(self, run: AgentRun) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(run));
        }
        self
    }

    /// Next invocation fails to spawn.
    #[must_use]
    pub fn with_spawn_error(self, message: &str) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(ScriptedFailure::Spawn(message.to_string())));
        }
        self
    }

    /// Next invocation finds the agent command missing.
    #[must_use]
    pub fn with_missing_command(self, command: &str) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(ScriptedFailure::NotInstalled(command.to_string())));
        }
        self
    }

    /// Run returned once the script is exhausted.
    #[must_use]
    pub fn with_fallback(mut self, run: AgentRun) -> Self {
        self.fallback = run;
        self
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AgentProcess for MockAgentProcess {
    async fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Ok(run)) => Ok(run),
            Some(Err(ScriptedFailure::Spawn(message))) => Err(LoopError::agent(message).into()),
            Some(Err(ScriptedFailure::NotInstalled(command))) => {
                Err(LoopError::AgentNotFound { command }.into())
            }
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Operator that always gives the same answer.
#[derive(Debug, Clone)]
pub struct MockOperatorPrompt {
    choices: Arc<Mutex<VecDeque<OperatorChoice>>>,
    fallback: OperatorChoice,
}

impl MockOperatorPrompt {
    #[must_use]
    pub fn new(fallback: OperatorChoice) -> Self {
        Self {
            choices: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
        }
    }

    /// Answers given before falling back.
    #[must_use]
    pub fn with_choices(self, choices: Vec<OperatorChoice>) -> Self {
        if let Ok(mut queue) = self.choices.lock() {
            queue.extend(choices);
        }
        self
    }
}

impl Default for MockOperatorPrompt {
    fn default() -> Self {
        Self::new(OperatorChoice::NoResponse)
    }
}

#[async_trait]
impl OperatorPrompt for MockOperatorPrompt {
    async fn api_limit_choice(&self, _timeout: Duration) -> OperatorChoice {
        self.choices
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(self.fallback)
    }
}
