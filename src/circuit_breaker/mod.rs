//! Stagnation detection.
//!
//! The breaker is fed one outcome per loop and opens when the loop stops
//! making measurable progress:
//!
//! - **no progress**: N consecutive loops that changed no file
//! - **same error**: M consecutive loops failing with the same error signature
//! - **output decline**: output shrinking loop after loop by a large margin
//!
//! Once open it stays open until a manual [`CircuitBreaker::reset`] or, with
//! auto-reset enabled, until the cooldown elapses.

mod signature;
pub mod types;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::Result;
use crate::state::{StateStore, CIRCUIT_BREAKER_FILE};
use crate::testing::Clock;

pub use signature::{error_lines, error_signature, is_error_line, MAX_SIGNATURE_LEN};
pub use types::{BreakerState, CircuitBreakerState, TripReason, OUTPUT_HISTORY_LIMIT};

/// Signature recorded for failures that print no recognizable error line.
const UNKNOWN_ERROR_SIGNATURE: &str = "error: unrecognized failure";

/// Persistent circuit breaker.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use ralph_loop::circuit_breaker::{BreakerState, CircuitBreaker};
/// use ralph_loop::config::CircuitBreakerConfig;
/// use ralph_loop::state::StateStore;
/// use ralph_loop::testing::MockClock;
///
/// let dir = tempfile::tempdir().unwrap();
/// let clock = Arc::new(MockClock::at("2025-03-01T10:00:00Z"));
/// let mut breaker = CircuitBreaker::new(
///     StateStore::new(dir.path()),
///     clock,
///     CircuitBreakerConfig::default(),
/// );
///
/// for loop_number in 1..=3 {
///     breaker.record_result(loop_number, 0, false, "nothing changed").unwrap();
/// }
/// assert_eq!(breaker.state().state, BreakerState::Open);
/// ```
pub struct CircuitBreaker {
    store: StateStore,
    clock: Arc<dyn Clock>,
    config: CircuitBreakerConfig,
    state: CircuitBreakerState,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Load the breaker from the state directory.
    ///
    /// An inconsistent record (open without a timestamp) is replaced by a
    /// closed breaker.
    #[must_use]
    pub fn new(store: StateStore, clock: Arc<dyn Clock>, config: CircuitBreakerConfig) -> Self {
        let mut state: CircuitBreakerState = store.read_json(CIRCUIT_BREAKER_FILE);
        if !state.is_consistent() {
            warn!("Circuit breaker state is open without a timestamp, closing it");
            state = CircuitBreakerState::default();
        }
        state.cooldown_minutes = config.cooldown_minutes;
        state.auto_reset_enabled = config.auto_reset;

        Self {
            store,
            clock,
            config,
            state,
        }
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> &CircuitBreakerState {
        &self.state
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// Feed one loop outcome into the breaker and persist the result.
    ///
    /// Returns the breaker position after evaluation.
    pub fn record_result(
        &mut self,
        loop_number: u32,
        files_changed: u32,
        has_errors: bool,
        output: &str,
    ) -> Result<BreakerState> {
        let state = &mut self.state;
        state.last_loop = loop_number;

        if files_changed > 0 {
            state.consecutive_no_progress = 0;
        } else {
            state.consecutive_no_progress += 1;
        }

        if has_errors {
            let signature = error_signature(output)
                .unwrap_or_else(|| UNKNOWN_ERROR_SIGNATURE.to_string());
            if state.last_error_signature.as_deref() == Some(signature.as_str()) {
                state.consecutive_same_error += 1;
            } else {
                state.consecutive_same_error = 1;
                state.last_error_signature = Some(signature);
            }
        } else {
            state.consecutive_same_error = 0;
            state.last_error_signature = None;
        }

        state.push_output_length(output.len());

        debug!(
            "Breaker loop {}: no_progress={} same_error={} output_len={}",
            loop_number,
            state.consecutive_no_progress,
            state.consecutive_same_error,
            output.len()
        );

        if !self.state.is_open() {
            if let Some(reason) = self.trip_condition() {
                self.open(reason);
            }
        }

        self.persist()?;
        Ok(self.state.state)
    }

    /// Whether the loop must halt.
    ///
    /// An open breaker with auto-reset enabled closes itself here once the
    /// cooldown has elapsed.
    pub fn should_halt(&mut self) -> bool {
        if !self.state.is_open() {
            return false;
        }

        if self.state.auto_reset_enabled {
            let cooldown = i64::try_from(self.state.cooldown_minutes)
                .ok()
                .and_then(chrono::Duration::try_minutes);
            if let (Some(opened_at), Some(cooldown)) = (self.state.opened_at, cooldown) {
                if self.clock.now() - opened_at >= cooldown {
                    info!(
                        "Circuit breaker cooldown of {}m elapsed, closing",
                        self.state.cooldown_minutes
                    );
                    self.clear("cooldown_elapsed");
                    if let Err(e) = self.persist() {
                        warn!("Could not persist breaker auto-reset: {}", e);
                    }
                    return false;
                }
            }
        }

        true
    }

    /// Clear all counters and close the breaker.
    pub fn reset(&mut self, reason: &str) -> Result<()> {
        info!("Circuit breaker reset: {}", reason);
        self.clear(reason);
        self.persist()
    }

    fn clear(&mut self, reason: &str) {
        let total_opens = self.state.total_opens;
        let last_loop = self.state.last_loop;
        self.state = CircuitBreakerState {
            cooldown_minutes: self.config.cooldown_minutes,
            auto_reset_enabled: self.config.auto_reset,
            reset_reason: Some(reason.to_string()),
            total_opens,
            last_loop,
            ..Default::default()
        };
    }

    fn trip_condition(&self) -> Option<TripReason> {
        let state = &self.state;
        if state.consecutive_no_progress >= self.config.no_progress_threshold {
            return Some(TripReason::NoProgress);
        }
        if state.consecutive_same_error >= self.config.same_error_threshold {
            return Some(TripReason::SameError);
        }
        if output_declined(
            &state.output_length_history,
            self.config.output_decline_loops as usize,
            self.config.output_decline_percent,
        ) {
            return Some(TripReason::OutputDecline);
        }
        None
    }

    fn open(&mut self, reason: TripReason) {
        warn!(
            "Circuit breaker OPEN after loop {}: {}",
            self.state.last_loop, reason
        );
        self.state.state = BreakerState::Open;
        self.state.opened_at = Some(self.clock.now());
        self.state.trip_reason = Some(reason);
        self.state.total_opens += 1;
    }

    fn persist(&self) -> Result<()> {
        self.store.write_json(CIRCUIT_BREAKER_FILE, &self.state)
    }
}

/// Whether the trailing `run` lengths are strictly shrinking and fell by at
/// least `percent` from the first to the last.
fn output_declined(history: &[usize], run: usize, percent: u32) -> bool {
    if run < 2 || history.len() < run {
        return false;
    }
    let tail = &history[history.len() - run..];
    if !tail.windows(2).all(|pair| pair[1] < pair[0]) {
        return false;
    }
    let first = tail[0] as u64;
    let last = tail[run - 1] as u64;
    (first - last) * 100 >= first * u64::from(percent)
}
