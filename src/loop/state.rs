//! Loop phases, iteration outcomes and terminal results.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::signals::ExitReason;

/// Position of the controller in its state machine.
///
/// ```text
/// STARTUP ─► ITERATING ─┬─► WAITING_RATE_LIMIT ─┐
///               ▲       ├─► WAITING_API_LIMIT ──┤
///               └───────┴───────────────────────┘
///                       ├─► HALTED_CIRCUIT
///                       ├─► HALTED_PERMISSION
///                       ├─► COMPLETED
///                       └─► FAILED_FATAL
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopPhase {
    #[default]
    Startup,
    Iterating,
    WaitingRateLimit,
    WaitingApiLimit,
    HaltedCircuit,
    HaltedPermission,
    Completed,
    FailedFatal,
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoopPhase::Startup => "STARTUP",
            LoopPhase::Iterating => "ITERATING",
            LoopPhase::WaitingRateLimit => "WAITING_RATE_LIMIT",
            LoopPhase::WaitingApiLimit => "WAITING_API_LIMIT",
            LoopPhase::HaltedCircuit => "HALTED_CIRCUIT",
            LoopPhase::HaltedPermission => "HALTED_PERMISSION",
            LoopPhase::Completed => "COMPLETED",
            LoopPhase::FailedFatal => "FAILED_FATAL",
        };
        f.write_str(label)
    }
}

/// Classification of one agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// Exit code 0.
    Success,
    /// Non-zero exit, timeout or spawn failure.
    GenericFailure,
    /// Failed because the external API quota is exhausted.
    ApiQuotaExceeded,
    /// Recording the outcome opened the circuit breaker.
    CircuitTrip,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// An exit condition was met.
    Completed(ExitReason),
    /// The circuit breaker is open.
    HaltedCircuit,
    /// The agent was denied the listed tools or commands.
    HaltedPermission(Vec<String>),
    /// The API quota is exhausted and the operator did not choose to wait.
    ApiLimitExit,
    /// Operator interrupt.
    Interrupted,
}

impl LoopExit {
    /// Process exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            LoopExit::Completed(_) => 0,
            LoopExit::HaltedPermission(_) => 2,
            LoopExit::HaltedCircuit => 3,
            LoopExit::ApiLimitExit => 4,
            LoopExit::Interrupted => 130,
        }
    }

    /// Value persisted in `status.json`.
    #[must_use]
    pub fn status_label(&self) -> &'static str {
        match self {
            LoopExit::Completed(_) => "completed",
            LoopExit::HaltedCircuit | LoopExit::HaltedPermission(_) => "halted",
            LoopExit::ApiLimitExit => "api_limit",
            LoopExit::Interrupted => "stopped",
        }
    }

    /// Machine-readable reason persisted alongside the status.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            LoopExit::Completed(reason) => reason.as_str(),
            LoopExit::HaltedCircuit => "circuit_breaker_open",
            LoopExit::HaltedPermission(_) => "permission_denied",
            LoopExit::ApiLimitExit => "api_limit_exit",
            LoopExit::Interrupted => "manual_interrupt",
        }
    }
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopExit::Completed(reason) => write!(f, "completed ({reason})"),
            LoopExit::HaltedCircuit => write!(f, "halted: circuit breaker open"),
            LoopExit::HaltedPermission(denied) => {
                write!(f, "halted: permission denied for {}", denied.join(", "))
            }
            LoopExit::ApiLimitExit => write!(f, "stopped: API usage limit reached"),
            LoopExit::Interrupted => write!(f, "stopped by operator"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let exits = [
            LoopExit::Completed(ExitReason::PlanComplete),
            LoopExit::HaltedPermission(vec![]),
            LoopExit::HaltedCircuit,
            LoopExit::ApiLimitExit,
            LoopExit::Interrupted,
        ];
        let mut codes: Vec<i32> = exits.iter().map(LoopExit::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), exits.len());
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(
            LoopExit::Completed(ExitReason::TestSaturation).reason(),
            "test_saturation"
        );
        assert_eq!(LoopExit::ApiLimitExit.reason(), "api_limit_exit");
        assert_eq!(LoopExit::Interrupted.status_label(), "stopped");
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(LoopPhase::WaitingApiLimit.to_string(), "WAITING_API_LIMIT");
    }
}
