//! The autonomous control loop.
//!
//! - [`controller`] - state machine composing the rate limiter, circuit
//!   breaker, exit-signal analyzer and session manager
//! - [`state`] - phases, invocation outcomes and terminal results
//! - [`agent`] - Claude Code process supervision
//! - [`stream`] - live-view filter for stream-json output
//! - [`operations`] - real implementations of the collaborator traits
//! - [`shutdown`] - operator interrupt detection
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐     ┌────────────────┐     ┌────────────────┐
//! │ LoopController │────>│ CircuitBreaker │     │  RateLimiter   │
//! │                │────────────────────────────>│                │
//! └────────────────┘     └────────────────┘     └────────────────┘
//!         │                      ▲
//!         v                      │ outcome
//! ┌────────────────┐     ┌────────────────┐     ┌────────────────┐
//! │ AgentProcess   │────>│ ExitSignal     │     │ SessionManager │
//! │                │     │ Analyzer       │     │                │
//! └────────────────┘     └────────────────┘     └────────────────┘
//! ```

pub mod agent;
pub mod controller;
pub mod operations;
pub mod shutdown;
pub mod state;
pub mod stream;

pub use controller::{LoopController, LoopDependencies, LoopTimings};
pub use state::{InvocationOutcome, LoopExit, LoopPhase};
