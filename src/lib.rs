//! Ralph Loop - autonomous control loop for Claude Code
//!
//! Repeatedly invokes a coding agent against a project until the work is
//! done, while guarding against runaway cost and wasted effort.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`rate_limit`] - Hourly call budget
//! - [`circuit_breaker`] - Stagnation detection
//! - [`signals`] - Agent output classification and the exit policy
//! - [`session`] - Continuity token and session lifecycle
//! - [`r#loop`] - The controller state machine and the agent process
//! - [`state`] - File-per-concern persisted state under `.ralph/`
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`logging`] - Tracing subscriber setup
//! - [`testing`] - Collaborator traits and mocks
//!
//! # Example
//!
//! ```rust,ignore
//! use ralph_loop::config::LoopConfig;
//! use ralph_loop::r#loop::LoopController;
//!
//! let config = LoopConfig::load(&project_dir)?;
//! let mut controller = LoopController::new(project_dir, config);
//! let exit = controller.run().await?;
//! std::process::exit(exit.exit_code());
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod logging;
pub mod r#loop;
pub mod rate_limit;
pub mod session;
pub mod signals;
pub mod state;
pub mod testing;

// Re-export commonly used types
pub use error::{LoopError, Result};

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerState, TripReason};
pub use config::{ExecutionMode, LoopConfig, OutputFormat};
pub use r#loop::{LoopController, LoopDependencies, LoopExit, LoopPhase};
pub use rate_limit::{CallBudget, RateLimiter};
pub use session::{SessionManager, SessionRecord, SessionResume};
pub use signals::{
    analyze_output, evaluate_exit, ExitReason, ExitSignalAnalyzer, ExitSignalWindow,
    OutputSignals, PlanProgress, ResponseAnalysis,
};
pub use state::{RunStatus, StateStore};

// Re-export testing types for convenience
pub use testing::{
    AgentProcess, AgentRequest, AgentRun, ChangeDetector, Clock, MockAgentProcess,
    MockChangeDetector, MockClock, MockOperatorPrompt, OperatorChoice, OperatorPrompt,
};
