//! Circuit breaker state types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of output lengths kept for the decline check.
pub const OUTPUT_HISTORY_LIMIT: usize = 10;

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Loops may run.
    #[default]
    Closed,
    /// Stagnation detected; loops are halted.
    Open,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
        }
    }
}

/// Condition that opened the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    /// Consecutive loops without any changed file.
    NoProgress,
    /// Consecutive loops failing with the same error.
    SameError,
    /// Output size shrinking loop after loop.
    OutputDecline,
}

impl TripReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TripReason::NoProgress => "no_progress",
            TripReason::SameError => "same_error",
            TripReason::OutputDecline => "output_decline",
        }
    }
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted breaker state.
///
/// Invariant: `state == Open` implies `opened_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CircuitBreakerState {
    pub state: BreakerState,
    pub consecutive_no_progress: u32,
    pub consecutive_same_error: u32,
    pub last_error_signature: Option<String>,
    /// Most recent output lengths, oldest first.
    pub output_length_history: Vec<usize>,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_minutes: u64,
    pub auto_reset_enabled: bool,
    pub trip_reason: Option<TripReason>,
    /// Reason given for the last manual or automatic reset.
    pub reset_reason: Option<String>,
    pub last_loop: u32,
    /// Times the breaker has opened since the state file was created.
    pub total_opens: u32,
}

impl CircuitBreakerState {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }

    /// Whether the stored record satisfies its invariants.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        !(self.is_open() && self.opened_at.is_none())
    }

    pub(crate) fn push_output_length(&mut self, length: usize) {
        self.output_length_history.push(length);
        if self.output_length_history.len() > OUTPUT_HISTORY_LIMIT {
            let excess = self.output_length_history.len() - OUTPUT_HISTORY_LIMIT;
            self.output_length_history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_uppercase() {
        let json = serde_json::to_string(&BreakerState::Open).unwrap();
        assert_eq!(json, "\"OPEN\"");
    }

    #[test]
    fn test_open_without_timestamp_is_inconsistent() {
        let state = CircuitBreakerState {
            state: BreakerState::Open,
            ..Default::default()
        };
        assert!(!state.is_consistent());
        assert!(CircuitBreakerState::default().is_consistent());
    }

    #[test]
    fn test_output_history_is_bounded() {
        let mut state = CircuitBreakerState::default();
        for len in 0..25 {
            state.push_output_length(len);
        }
        assert_eq!(state.output_length_history.len(), OUTPUT_HISTORY_LIMIT);
        assert_eq!(state.output_length_history[0], 15);
        assert_eq!(*state.output_length_history.last().unwrap(), 24);
    }
}
