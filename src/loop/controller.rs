//! Loop controller.
//!
//! Drives the agent through repeated iterations until an exit condition, a
//! halt, or an operator interrupt. Each iteration:
//!
//! 1. halts if the circuit breaker is open
//! 2. waits out an exhausted call budget (without counting an iteration)
//! 3. stops if the exit-signal policy says the work is done
//! 4. invokes the agent and classifies the outcome
//! 5. feeds the outcome back into the breaker, the analyzer and the session
//!
//! The controller supports dependency injection through
//! [`LoopDependencies`], enabling deterministic testing with mocks.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use super::agent::ClaudeCodeProcess;
use super::operations::{GitChangeDetector, StdinOperatorPrompt, SystemClock};
use super::shutdown::shutdown_signal;
use super::state::{InvocationOutcome, LoopExit, LoopPhase};
use crate::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::config::LoopConfig;
use crate::error::LoopError;
use crate::rate_limit::RateLimiter;
use crate::session::{SessionManager, SessionResume};
use crate::signals::{analyze_output, ExitReason, ExitSignalAnalyzer, PlanProgress};
use crate::state::{RunStatus, StateStore};
use crate::testing::{
    AgentProcess, AgentRequest, AgentRun, ChangeDetector, Clock, OperatorChoice, OperatorPrompt,
};

/// External collaborators of the controller.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use ralph_loop::r#loop::LoopDependencies;
/// use ralph_loop::testing::{MockAgentProcess, MockChangeDetector, MockClock, MockOperatorPrompt};
///
/// let deps = LoopDependencies {
///     agent: Arc::new(MockAgentProcess::new()),
///     changes: Arc::new(MockChangeDetector::new()),
///     clock: Arc::new(MockClock::at("2025-03-01T10:00:00Z")),
///     operator: Arc::new(MockOperatorPrompt::default()),
/// };
/// ```
#[derive(Clone)]
pub struct LoopDependencies {
    pub agent: Arc<dyn AgentProcess>,
    pub changes: Arc<dyn ChangeDetector>,
    pub clock: Arc<dyn Clock>,
    pub operator: Arc<dyn OperatorPrompt>,
}

impl std::fmt::Debug for LoopDependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopDependencies")
            .field("agent", &"<dyn AgentProcess>")
            .field("changes", &"<dyn ChangeDetector>")
            .field("clock", &"<dyn Clock>")
            .field("operator", &"<dyn OperatorPrompt>")
            .finish()
    }
}

impl LoopDependencies {
    /// Create real dependencies for production use.
    #[must_use]
    pub fn real(project_dir: &Path, config: &LoopConfig) -> Self {
        let log_dir = StateStore::new(LoopConfig::state_dir(project_dir)).log_dir();
        Self {
            agent: Arc::new(ClaudeCodeProcess::new(project_dir, &log_dir, config)),
            changes: Arc::new(GitChangeDetector::new(project_dir.to_path_buf())),
            clock: Arc::new(SystemClock),
            operator: Arc::new(StdinOperatorPrompt),
        }
    }
}

/// Fixed pauses between iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTimings {
    /// Pause after a successful iteration.
    pub post_success_pause: Duration,
    /// Pause after a failed iteration. Constant; the breaker bounds repetition.
    pub failure_backoff: Duration,
    /// How long to wait when the operator chooses to sit out an API limit.
    pub api_limit_wait: Duration,
    /// How long the operator has to answer.
    pub operator_timeout: Duration,
}

impl Default for LoopTimings {
    fn default() -> Self {
        Self {
            post_success_pause: Duration::from_secs(5),
            failure_backoff: Duration::from_secs(30),
            api_limit_wait: Duration::from_secs(60 * 60),
            operator_timeout: Duration::from_secs(30),
        }
    }
}

/// Synthetic error line recorded for runs killed at the timeout.
fn timeout_error_line(run: &AgentRun) -> String {
    format!("error: agent timed out after {}s", run.duration.as_secs())
}

/// The control loop state machine.
pub struct LoopController {
    project_dir: PathBuf,
    config: LoopConfig,
    store: StateStore,
    deps: LoopDependencies,
    timings: LoopTimings,
    rate_limiter: RateLimiter,
    breaker: CircuitBreaker,
    session: SessionManager,
    analyzer: ExitSignalAnalyzer,
    phase: LoopPhase,
    loop_count: u32,
    last_action: String,
}

impl std::fmt::Debug for LoopController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopController")
            .field("project_dir", &self.project_dir)
            .field("phase", &self.phase)
            .field("loop_count", &self.loop_count)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl LoopController {
    /// Create a controller with real dependencies.
    #[must_use]
    pub fn new(project_dir: PathBuf, config: LoopConfig) -> Self {
        let deps = LoopDependencies::real(&project_dir, &config);
        Self::with_deps(project_dir, config, deps)
    }

    /// Create a controller with injected dependencies.
    #[must_use]
    pub fn with_deps(project_dir: PathBuf, config: LoopConfig, deps: LoopDependencies) -> Self {
        let store = StateStore::new(LoopConfig::state_dir(&project_dir));
        let rate_limiter = RateLimiter::new(
            store.clone(),
            deps.clock.clone(),
            config.rate_limit.max_calls_per_hour,
        );
        let breaker = CircuitBreaker::new(
            store.clone(),
            deps.clock.clone(),
            config.circuit_breaker.clone(),
        );
        let session = SessionManager::new(
            store.clone(),
            deps.clock.clone(),
            config.session_expiry(),
        );
        let analyzer = ExitSignalAnalyzer::new(store.clone());

        Self {
            project_dir,
            config,
            store,
            deps,
            timings: LoopTimings::default(),
            rate_limiter,
            breaker,
            session,
            analyzer,
            phase: LoopPhase::Startup,
            loop_count: 0,
            last_action: "startup".to_string(),
        }
    }

    /// Override the fixed pauses.
    #[must_use]
    pub fn with_timings(mut self, timings: LoopTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Show a countdown bar while waiting for the call budget.
    #[must_use]
    pub fn with_countdown(mut self, show: bool) -> Self {
        self.rate_limiter = self.rate_limiter.with_countdown(show);
        self
    }

    #[must_use]
    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    #[must_use]
    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    /// Run until a terminal state or an operator interrupt (SIGINT/SIGTERM).
    ///
    /// Holds the project lock for the whole run.
    ///
    /// # Errors
    ///
    /// Returns an error if another loop owns the project or a fatal error
    /// occurs (missing prompt, unwritable state).
    pub async fn run(&mut self) -> Result<LoopExit> {
        let _lock = self.store.lock()?;
        let interrupt = async {
            if let Err(e) = shutdown_signal().await {
                warn!("Could not install signal handlers: {}", e);
                std::future::pending::<()>().await;
            }
        };
        self.run_until(interrupt).await
    }

    /// Run until a terminal state or until `interrupt` resolves.
    pub async fn run_until<F>(&mut self, interrupt: F) -> Result<LoopExit>
    where
        F: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            biased;
            () = interrupt => None,
            result = self.run_loop() => Some(result),
        };

        match outcome {
            None => self.handle_interrupt(),
            Some(Ok(exit)) => Ok(exit),
            Some(Err(e)) => {
                error!("Loop failed: {:#}", e);
                self.phase = LoopPhase::FailedFatal;
                self.last_action = "fatal_error".to_string();
                if let Err(status_err) = self.write_status("failed", Some("fatal_error")) {
                    warn!("Could not write final status: {}", status_err);
                }
                Err(e)
            }
        }
    }

    fn handle_interrupt(&mut self) -> Result<LoopExit> {
        info!("Interrupted by operator after {} loop(s)", self.loop_count);
        let exit = LoopExit::Interrupted;
        self.session.reset(exit.reason(), self.loop_count)?;
        self.last_action = "interrupted".to_string();
        self.write_status(exit.status_label(), Some(exit.reason()))?;
        Ok(exit)
    }

    async fn run_loop(&mut self) -> Result<LoopExit> {
        self.startup()?;

        loop {
            if self.breaker.should_halt() {
                warn!("Circuit breaker is open, halting");
                return self.halt_circuit("circuit_breaker_open");
            }

            if !self.rate_limiter.can_proceed() {
                self.phase = LoopPhase::WaitingRateLimit;
                self.last_action = "rate_limit_wait".to_string();
                self.write_status("paused", None)?;
                self.rate_limiter.wait_for_reset().await;
                self.phase = LoopPhase::Iterating;
                continue;
            }

            let plan = PlanProgress::load(&self.project_dir.join(&self.config.agent.plan_file));
            if let Some(reason) = self.analyzer.decide(&plan) {
                return self.finish_on_signal(reason);
            }

            self.loop_count += 1;
            self.phase = LoopPhase::Iterating;
            self.last_action = "executing".to_string();
            self.write_status("running", None)?;

            match self.execute_iteration().await? {
                InvocationOutcome::Success => {
                    self.last_action = "success".to_string();
                    self.write_status("running", None)?;
                    self.deps.clock.sleep(self.timings.post_success_pause).await;
                }
                InvocationOutcome::CircuitTrip => {
                    warn!("Circuit breaker tripped on loop {}", self.loop_count);
                    return self.halt_circuit("circuit_breaker_trip");
                }
                InvocationOutcome::ApiQuotaExceeded => {
                    if let Some(exit) = self.wait_for_api_limit().await? {
                        return Ok(exit);
                    }
                }
                InvocationOutcome::GenericFailure => {
                    warn!(
                        "Loop {} failed, retrying in {}s",
                        self.loop_count,
                        self.timings.failure_backoff.as_secs()
                    );
                    self.last_action = "failed".to_string();
                    self.write_status("running", None)?;
                    self.deps.clock.sleep(self.timings.failure_backoff).await;
                }
            }
        }
    }

    fn startup(&mut self) -> Result<()> {
        self.phase = LoopPhase::Startup;
        self.store.ensure_dirs()?;

        if self.config.circuit_breaker.reset_on_startup {
            self.breaker.reset("startup_reset")?;
        }

        match self.session.resume_or_new()? {
            SessionResume::Resume(token) => debug!("Continuing agent session {}", token),
            SessionResume::Fresh => debug!("Starting a fresh agent session"),
        }

        info!(
            "Loop starting in {} (budget {}/h, timeout {}m)",
            self.project_dir.display(),
            self.rate_limiter.limit(),
            self.config.agent.timeout_minutes
        );
        self.phase = LoopPhase::Iterating;
        Ok(())
    }

    async fn execute_iteration(&mut self) -> Result<InvocationOutcome> {
        let loop_number = self.loop_count;
        let prompt_path = self.project_dir.join(&self.config.agent.prompt_file);
        if !prompt_path.is_file() {
            return Err(LoopError::MissingFile { path: prompt_path }.into());
        }
        let prompt = std::fs::read_to_string(&prompt_path)
            .with_context(|| format!("Failed to read {}", prompt_path.display()))?;

        let continuity_token = if self.config.session.continuity {
            self.session.token()
        } else {
            None
        };
        let request = AgentRequest {
            loop_number,
            prompt,
            continuity_token,
            timeout: self.config.agent_timeout(),
        };

        let marker = self.deps.changes.marker();
        info!("Loop #{}: invoking agent", loop_number);
        let run = match self.deps.agent.run(&request).await {
            Ok(run) => run,
            Err(e) => {
                if e.downcast_ref::<LoopError>().is_some_and(LoopError::is_fatal) {
                    return Err(e);
                }
                warn!("Agent invocation failed: {:#}", e);
                AgentRun {
                    output: format!("error: agent invocation failed: {e}"),
                    ..AgentRun::default()
                }
            }
        };

        let signals = analyze_output(&run.output);
        let files_changed = self.deps.changes.changed_files_since(&marker);
        self.session.refresh(loop_number)?;

        if run.succeeded() {
            let calls = self.rate_limiter.record_call()?;
            if self.config.session.continuity {
                if let Some(token) = &signals.continuity_token {
                    self.session.store_token(token)?;
                }
            }
            let analysis = self.analyzer.record(loop_number, &signals)?;
            let state = self.breaker.record_result(
                loop_number,
                files_changed,
                signals.has_errors,
                &run.output,
            )?;

            info!(
                "Loop #{} succeeded in {}s: {} file(s) changed, {}/{} calls{}",
                loop_number,
                run.duration.as_secs(),
                files_changed,
                calls,
                self.rate_limiter.limit(),
                analysis
                    .work_summary
                    .as_deref()
                    .map(|s| format!(", {s}"))
                    .unwrap_or_default()
            );

            return Ok(match state {
                BreakerState::Open => InvocationOutcome::CircuitTrip,
                BreakerState::Closed => InvocationOutcome::Success,
            });
        }

        if !run.timed_out && signals.api_quota_exceeded {
            warn!("Loop #{}: API usage limit reached", loop_number);
            return Ok(InvocationOutcome::ApiQuotaExceeded);
        }

        let output = if run.timed_out {
            warn!(
                "Loop #{} timed out after {}s",
                loop_number,
                run.duration.as_secs()
            );
            format!("{}\n{}", timeout_error_line(&run), run.output)
        } else {
            warn!(
                "Loop #{} exited with code {}",
                loop_number,
                run.exit_code
                    .map_or_else(|| "none".to_string(), |c| c.to_string())
            );
            run.output
        };

        let state = self
            .breaker
            .record_result(loop_number, files_changed, true, &output)?;
        Ok(match state {
            BreakerState::Open => InvocationOutcome::CircuitTrip,
            BreakerState::Closed => InvocationOutcome::GenericFailure,
        })
    }

    /// Ask the operator what to do about an exhausted API quota.
    ///
    /// Returns `Some(exit)` when the run should stop.
    async fn wait_for_api_limit(&mut self) -> Result<Option<LoopExit>> {
        self.phase = LoopPhase::WaitingApiLimit;
        self.last_action = "api_limit".to_string();
        self.write_status("paused", Some("api_limit"))?;

        let choice = self
            .deps
            .operator
            .api_limit_choice(self.timings.operator_timeout)
            .await;

        match choice {
            OperatorChoice::Wait => {
                info!(
                    "Waiting {}m for the API limit to reset",
                    self.timings.api_limit_wait.as_secs() / 60
                );
                self.deps.clock.sleep(self.timings.api_limit_wait).await;
                self.phase = LoopPhase::Iterating;
                Ok(None)
            }
            OperatorChoice::Exit | OperatorChoice::NoResponse => {
                let exit = LoopExit::ApiLimitExit;
                info!("Stopping: {}", exit);
                self.write_status(exit.status_label(), Some(exit.reason()))?;
                Ok(Some(exit))
            }
        }
    }

    fn halt_circuit(&mut self, reason: &str) -> Result<LoopExit> {
        self.phase = LoopPhase::HaltedCircuit;
        self.session.reset(reason, self.loop_count)?;
        self.last_action = "halted".to_string();
        let exit = LoopExit::HaltedCircuit;
        self.write_status(exit.status_label(), Some(reason))?;
        Ok(exit)
    }

    fn finish_on_signal(&mut self, reason: ExitReason) -> Result<LoopExit> {
        let exit = if reason == ExitReason::PermissionDenied {
            self.phase = LoopPhase::HaltedPermission;
            let denied = self.analyzer.latest().denied_commands;
            warn!("Agent was denied: {}", denied.join(", "));
            self.session.reset(reason.as_str(), self.loop_count)?;
            LoopExit::HaltedPermission(denied)
        } else {
            self.phase = LoopPhase::Completed;
            info!("Exit condition reached: {}", reason);
            self.session.reset("project_complete", self.loop_count)?;
            LoopExit::Completed(reason)
        };

        self.last_action = "exit".to_string();
        self.write_status(exit.status_label(), Some(exit.reason()))?;
        Ok(exit)
    }

    fn write_status(&self, status: &str, exit_reason: Option<&str>) -> Result<()> {
        RunStatus {
            timestamp: Some(self.deps.clock.now()),
            loop_count: self.loop_count,
            calls_this_window: self.rate_limiter.calls_made(),
            budget_limit: self.rate_limiter.limit(),
            last_action: self.last_action.clone(),
            status: status.to_string(),
            exit_reason: exit_reason.map(String::from),
            next_reset_time: Some(self.rate_limiter.next_reset_time()),
        }
        .save(&self.store)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerState;
    use crate::session::SessionRecord;
    use crate::state::{CIRCUIT_BREAKER_FILE, SESSION_FILE};
    use crate::testing::{MockAgentProcess, MockChangeDetector, MockClock, MockOperatorPrompt};
    use tempfile::TempDir;

    const COMPLETE: &str = "Finished the last task.\n---RALPH_STATUS---\nSTATUS: COMPLETE\nEXIT_SIGNAL: true\n---END_RALPH_STATUS---";

    struct Harness {
        temp: TempDir,
        clock: MockClock,
        agent: MockAgentProcess,
        changes: MockChangeDetector,
        operator: MockOperatorPrompt,
        config: LoopConfig,
    }

    impl Harness {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            std::fs::write(temp.path().join("PROMPT.md"), "Work on the plan.").unwrap();
            Self {
                temp,
                clock: MockClock::at("2025-03-01T10:15:00Z"),
                agent: MockAgentProcess::new(),
                changes: MockChangeDetector::new().with_fallback(1),
                operator: MockOperatorPrompt::default(),
                config: LoopConfig::default(),
            }
        }

        fn controller(&self) -> LoopController {
            let deps = LoopDependencies {
                agent: Arc::new(self.agent.clone()),
                changes: Arc::new(self.changes.clone()),
                clock: Arc::new(self.clock.clone()),
                operator: Arc::new(self.operator.clone()),
            };
            LoopController::with_deps(self.temp.path().to_path_buf(), self.config.clone(), deps)
        }

        fn store(&self) -> StateStore {
            StateStore::new(LoopConfig::state_dir(self.temp.path()))
        }

        fn status(&self) -> RunStatus {
            RunStatus::load(&self.store()).unwrap()
        }

        fn session(&self) -> SessionRecord {
            self.store().read_json(SESSION_FILE)
        }

        fn calls_made(&self) -> u32 {
            RateLimiter::new(
                self.store(),
                Arc::new(self.clock.clone()),
                self.config.rate_limit.max_calls_per_hour,
            )
            .calls_made()
        }
    }

    async fn run(harness: &Harness) -> Result<LoopExit> {
        harness
            .controller()
            .run_until(std::future::pending())
            .await
    }

    #[tokio::test]
    async fn test_completes_on_project_complete() {
        let mut harness = Harness::new();
        harness.agent = MockAgentProcess::new().with_fallback(AgentRun::exited(0, COMPLETE));

        let exit = run(&harness).await.unwrap();

        assert_eq!(exit, LoopExit::Completed(ExitReason::ProjectComplete));
        assert_eq!(harness.agent.call_count(), 2);
        assert_eq!(harness.calls_made(), 2);
        assert_eq!(harness.status().status, "completed");
        assert_eq!(
            harness.status().exit_reason.as_deref(),
            Some("project_complete")
        );
        assert_eq!(
            harness.session().reset_reason.as_deref(),
            Some("project_complete")
        );
    }

    #[tokio::test]
    async fn test_no_progress_trips_breaker_on_third_loop() {
        let mut harness = Harness::new();
        harness.agent =
            MockAgentProcess::new().with_fallback(AgentRun::exited(0, "Looked around."));
        harness.changes = MockChangeDetector::new().with_fallback(0);

        let exit = run(&harness).await.unwrap();

        assert_eq!(exit, LoopExit::HaltedCircuit);
        assert_eq!(harness.agent.call_count(), 3);
        assert_eq!(
            harness.session().reset_reason.as_deref(),
            Some("circuit_breaker_trip")
        );
        let breaker: CircuitBreakerState = harness.store().read_json(CIRCUIT_BREAKER_FILE);
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn test_open_breaker_halts_before_invoking() {
        let harness = Harness::new();
        let mut breaker = CircuitBreaker::new(
            harness.store(),
            Arc::new(harness.clock.clone()),
            harness.config.circuit_breaker.clone(),
        );
        for n in 1..=3 {
            breaker.record_result(n, 0, false, "").unwrap();
        }

        let exit = run(&harness).await.unwrap();

        assert_eq!(exit, LoopExit::HaltedCircuit);
        assert_eq!(harness.agent.call_count(), 0);
        assert_eq!(
            harness.session().reset_reason.as_deref(),
            Some("circuit_breaker_open")
        );
    }

    #[tokio::test]
    async fn test_reset_on_startup_clears_open_breaker() {
        let mut harness = Harness::new();
        harness.config.circuit_breaker.reset_on_startup = true;
        harness.agent = MockAgentProcess::new().with_fallback(AgentRun::exited(0, COMPLETE));
        let mut breaker = CircuitBreaker::new(
            harness.store(),
            Arc::new(harness.clock.clone()),
            harness.config.circuit_breaker.clone(),
        );
        for n in 1..=3 {
            breaker.record_result(n, 0, false, "").unwrap();
        }

        let exit = run(&harness).await.unwrap();
        assert_eq!(exit, LoopExit::Completed(ExitReason::ProjectComplete));
    }

    #[tokio::test]
    async fn test_permission_denial_halts() {
        let mut harness = Harness::new();
        harness.agent = MockAgentProcess::new().with_run(AgentRun::exited(
            0,
            r#"{"type":"result","is_error":false,"result":"Could not install.","session_id":"s-1","permission_denials":[{"tool_name":"Bash","tool_input":{"command":"npm install"}}]}"#,
        ));

        let exit = run(&harness).await.unwrap();

        assert_eq!(
            exit,
            LoopExit::HaltedPermission(vec!["Bash(npm install)".to_string()])
        );
        assert_eq!(harness.agent.call_count(), 1);
        assert_eq!(harness.status().status, "halted");
        assert_eq!(
            harness.status().exit_reason.as_deref(),
            Some("permission_denied")
        );
    }

    #[tokio::test]
    async fn test_api_limit_without_answer_exits() {
        let mut harness = Harness::new();
        harness.agent = MockAgentProcess::new()
            .with_run(AgentRun::exited(1, "Claude AI usage limit reached"));

        let exit = run(&harness).await.unwrap();

        assert_eq!(exit, LoopExit::ApiLimitExit);
        assert_eq!(harness.calls_made(), 0);
        assert_eq!(harness.status().status, "api_limit");
    }

    #[tokio::test]
    async fn test_api_limit_wait_then_continue() {
        let mut harness = Harness::new();
        harness.operator = MockOperatorPrompt::default().with_choices(vec![OperatorChoice::Wait]);
        harness.agent = MockAgentProcess::new()
            .with_run(AgentRun::exited(1, "429 Too Many Requests"))
            .with_fallback(AgentRun::exited(0, COMPLETE));

        let exit = run(&harness).await.unwrap();

        assert_eq!(exit, LoopExit::Completed(ExitReason::ProjectComplete));
        assert_eq!(harness.agent.call_count(), 3);
        assert!(harness.clock.total_slept() >= Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_tool_output_mentioning_limits_is_generic_failure() {
        let mut harness = Harness::new();
        let failed = [
            r#"{"type":"system","subtype":"init","session_id":"s-2"}"#,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"pub mod rate_limit;"}]}}"#,
            r#"{"type":"result","is_error":true,"result":"error: build failed"}"#,
        ]
        .join("\n");
        harness.agent = MockAgentProcess::new()
            .with_run(AgentRun::exited(1, failed))
            .with_fallback(AgentRun::exited(0, COMPLETE));

        let exit = run(&harness).await.unwrap();

        assert_eq!(exit, LoopExit::Completed(ExitReason::ProjectComplete));
        assert_eq!(harness.agent.call_count(), 3);
        assert_eq!(harness.calls_made(), 2);
        // Retried after the fixed failure backoff, not the API-limit wait.
        assert!(harness.clock.total_slept() < Duration::from_secs(3600));
        assert!(harness.clock.total_slept() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_repeated_failures_trip_same_error() {
        let mut harness = Harness::new();
        harness.agent = MockAgentProcess::new()
            .with_fallback(AgentRun::exited(1, "error: build failed at step 3"));

        let exit = run(&harness).await.unwrap();

        assert_eq!(exit, LoopExit::HaltedCircuit);
        assert_eq!(harness.agent.call_count(), 3);
        assert_eq!(harness.calls_made(), 0);
        // Two fixed backoffs between the three failures.
        assert_eq!(harness.clock.total_slept(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_timeouts_feed_the_breaker() {
        let mut harness = Harness::new();
        harness.agent = MockAgentProcess::new()
            .with_fallback(AgentRun::timed_out(Duration::from_secs(900), "partial"));

        let exit = run(&harness).await.unwrap();

        assert_eq!(exit, LoopExit::HaltedCircuit);
        assert_eq!(harness.agent.call_count(), 3);
        assert_eq!(harness.calls_made(), 0);
    }

    #[tokio::test]
    async fn test_spawn_error_is_retried() {
        let mut harness = Harness::new();
        harness.agent = MockAgentProcess::new()
            .with_spawn_error("No such file or directory")
            .with_fallback(AgentRun::exited(0, COMPLETE));

        let exit = run(&harness).await.unwrap();

        assert_eq!(exit, LoopExit::Completed(ExitReason::ProjectComplete));
        assert_eq!(harness.agent.call_count(), 3);
        assert_eq!(harness.calls_made(), 2);
    }

    #[tokio::test]
    async fn test_missing_agent_is_fatal() {
        let mut harness = Harness::new();
        harness.agent = MockAgentProcess::new().with_missing_command("claude");

        let mut controller = harness.controller();
        let err = controller
            .run_until(std::future::pending())
            .await
            .unwrap_err();

        let loop_err = err.downcast_ref::<LoopError>().unwrap();
        assert!(matches!(loop_err, LoopError::AgentNotFound { .. }));
        assert_eq!(loop_err.exit_code(), 6);
        assert_eq!(controller.phase(), LoopPhase::FailedFatal);
        assert_eq!(harness.agent.call_count(), 1);
        assert_eq!(harness.status().status, "failed");
    }

    #[tokio::test]
    async fn test_exhausted_budget_waits_for_next_window() {
        let mut harness = Harness::new();
        harness.config.rate_limit.max_calls_per_hour = 1;
        harness.agent = MockAgentProcess::new().with_fallback(AgentRun::exited(0, COMPLETE));

        let exit = run(&harness).await.unwrap();

        assert_eq!(exit, LoopExit::Completed(ExitReason::ProjectComplete));
        assert_eq!(harness.agent.call_count(), 2);
        assert!(harness.clock.now() >= MockClock::at("2025-03-01T12:00:00Z").now());
    }

    #[tokio::test]
    async fn test_continuity_token_is_passed_on() {
        let mut harness = Harness::new();
        let json = |text: &str| {
            serde_json::json!({
                "type": "result",
                "is_error": false,
                "result": text,
                "session_id": "agent-session-7",
            })
            .to_string()
        };
        harness.agent = MockAgentProcess::new().with_fallback(AgentRun::exited(0, json(COMPLETE)));

        run(&harness).await.unwrap();

        let requests = harness.agent.requests();
        assert_eq!(requests[0].continuity_token, None);
        assert_eq!(
            requests[1].continuity_token.as_deref(),
            Some("agent-session-7")
        );
    }

    #[tokio::test]
    async fn test_plan_complete_stops_before_invoking() {
        let harness = Harness::new();
        std::fs::write(
            harness.temp.path().join("IMPLEMENTATION_PLAN.md"),
            "- [x] parser\n- [x] codegen\n",
        )
        .unwrap();

        let exit = run(&harness).await.unwrap();

        assert_eq!(exit, LoopExit::Completed(ExitReason::PlanComplete));
        assert_eq!(harness.agent.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_prompt_is_fatal() {
        let harness = Harness::new();
        std::fs::remove_file(harness.temp.path().join("PROMPT.md")).unwrap();

        let mut controller = harness.controller();
        let err = controller
            .run_until(std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<LoopError>(),
            Some(LoopError::MissingFile { .. })
        ));
        assert_eq!(controller.phase(), LoopPhase::FailedFatal);
        assert_eq!(harness.status().status, "failed");
    }

    #[tokio::test]
    async fn test_interrupt_resets_session_and_stops() {
        let harness = Harness::new();
        let mut controller = harness.controller();

        let exit = controller.run_until(async {}).await.unwrap();

        assert_eq!(exit, LoopExit::Interrupted);
        assert_eq!(harness.agent.call_count(), 0);
        assert_eq!(harness.status().status, "stopped");
        assert_eq!(
            harness.session().reset_reason.as_deref(),
            Some("manual_interrupt")
        );
    }
}
