//! Exit-signal analysis.
//!
//! Each loop's output is classified by [`analyze_output`] and folded into an
//! [`ExitSignalWindow`] of recent loop numbers. [`evaluate_exit`] applies a
//! fixed-priority policy over that window, the latest analysis and the plan
//! checklist to decide whether the project is finished.
//!
//! The window is "monotonic until reset": a loop without a signal never
//! removes earlier entries. Only a session reset clears it.

pub mod analyzer;
pub mod plan;

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::state::{StateStore, EXIT_SIGNALS_FILE, RESPONSE_ANALYSIS_FILE};

pub use analyzer::{analyze_output, OutputSignals, StatusBlock, WorkType};
pub use plan::PlanProgress;

/// Loop numbers retained per signal sequence.
pub const RECENT_SIGNAL_LIMIT: usize = 5;

/// Test-only loops that indicate the agent is just re-running tests.
pub const TEST_SATURATION_LOOPS: usize = 3;

/// Done signals required to finish.
pub const DONE_SIGNAL_LOOPS: usize = 2;

/// Completion indicators that end the run regardless of the exit marker.
pub const SAFETY_COMPLETION_LOOPS: usize = 5;

/// Completion indicators required alongside an explicit exit signal.
pub const PROJECT_COMPLETE_INDICATORS: usize = 2;

/// Recent loops that produced each signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitSignalWindow {
    pub test_only_loops: Vec<u32>,
    pub done_signals: Vec<u32>,
    pub completion_indicators: Vec<u32>,
}

impl ExitSignalWindow {
    /// Fold one loop's signals into the window.
    pub fn record(&mut self, loop_number: u32, signals: &OutputSignals) {
        if signals.test_only {
            push_recent(&mut self.test_only_loops, loop_number);
        }
        if signals.done_signal {
            push_recent(&mut self.done_signals, loop_number);
        }
        if signals.completion_indicator {
            push_recent(&mut self.completion_indicators, loop_number);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.test_only_loops.is_empty()
            && self.done_signals.is_empty()
            && self.completion_indicators.is_empty()
    }
}

fn push_recent(sequence: &mut Vec<u32>, loop_number: u32) {
    sequence.push(loop_number);
    if sequence.len() > RECENT_SIGNAL_LIMIT {
        let excess = sequence.len() - RECENT_SIGNAL_LIMIT;
        sequence.drain(..excess);
    }
}

/// Latest loop's analysis, overwritten every loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseAnalysis {
    pub loop_number: u32,
    pub has_permission_denials: bool,
    pub denied_commands: Vec<String>,
    pub denied_count: u32,
    pub exit_signal: bool,
    pub work_summary: Option<String>,
    pub confidence_score: u32,
}

impl ResponseAnalysis {
    #[must_use]
    pub fn from_signals(loop_number: u32, signals: &OutputSignals) -> Self {
        Self {
            loop_number,
            has_permission_denials: signals.has_permission_denials(),
            denied_commands: signals.permission_denials.clone(),
            denied_count: signals.permission_denials.len() as u32,
            exit_signal: signals.exit_signal,
            work_summary: signals.work_summary.clone(),
            confidence_score: signals.confidence_score,
        }
    }
}

/// Why the loop decided to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    PermissionDenied,
    TestSaturation,
    CompletionSignals,
    SafetyCircuitBreaker,
    ProjectComplete,
    PlanComplete,
}

impl ExitReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::PermissionDenied => "permission_denied",
            ExitReason::TestSaturation => "test_saturation",
            ExitReason::CompletionSignals => "completion_signals",
            ExitReason::SafetyCircuitBreaker => "safety_circuit_breaker",
            ExitReason::ProjectComplete => "project_complete",
            ExitReason::PlanComplete => "plan_complete",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-priority exit policy. The first matching rule wins.
///
/// # Example
///
/// ```
/// use ralph_loop::signals::{evaluate_exit, ExitReason, ExitSignalWindow, PlanProgress, ResponseAnalysis};
///
/// let window = ExitSignalWindow {
///     completion_indicators: vec![4, 5],
///     ..Default::default()
/// };
/// let latest = ResponseAnalysis { exit_signal: true, ..Default::default() };
/// assert_eq!(
///     evaluate_exit(&window, &latest, &PlanProgress::default()),
///     Some(ExitReason::ProjectComplete)
/// );
/// ```
#[must_use]
pub fn evaluate_exit(
    window: &ExitSignalWindow,
    latest: &ResponseAnalysis,
    plan: &PlanProgress,
) -> Option<ExitReason> {
    if latest.has_permission_denials {
        return Some(ExitReason::PermissionDenied);
    }
    if window.test_only_loops.len() >= TEST_SATURATION_LOOPS {
        return Some(ExitReason::TestSaturation);
    }
    if window.done_signals.len() >= DONE_SIGNAL_LOOPS {
        return Some(ExitReason::CompletionSignals);
    }
    if window.completion_indicators.len() >= SAFETY_COMPLETION_LOOPS {
        return Some(ExitReason::SafetyCircuitBreaker);
    }
    if window.completion_indicators.len() >= PROJECT_COMPLETE_INDICATORS && latest.exit_signal {
        return Some(ExitReason::ProjectComplete);
    }
    if plan.is_complete() {
        return Some(ExitReason::PlanComplete);
    }
    None
}

/// Persistent exit-signal bookkeeping.
#[derive(Debug, Clone)]
pub struct ExitSignalAnalyzer {
    store: StateStore,
}

impl ExitSignalAnalyzer {
    #[must_use]
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Fold a loop's signals into the window and overwrite the latest analysis.
    pub fn record(&self, loop_number: u32, signals: &OutputSignals) -> Result<ResponseAnalysis> {
        let mut window = self.window();
        window.record(loop_number, signals);
        self.store.write_json(EXIT_SIGNALS_FILE, &window)?;

        let analysis = ResponseAnalysis::from_signals(loop_number, signals);
        self.store.write_json(RESPONSE_ANALYSIS_FILE, &analysis)?;

        debug!(
            "Loop {} signals: test_only={} done={} complete={} exit={} denials={} confidence={}",
            loop_number,
            signals.test_only,
            signals.done_signal,
            signals.completion_indicator,
            signals.exit_signal,
            analysis.denied_count,
            analysis.confidence_score
        );
        Ok(analysis)
    }

    /// Evaluate the exit policy against persisted state.
    #[must_use]
    pub fn decide(&self, plan: &PlanProgress) -> Option<ExitReason> {
        let decision = evaluate_exit(&self.window(), &self.latest(), plan);
        if let Some(reason) = decision {
            info!("Exit condition met: {}", reason);
        }
        decision
    }

    #[must_use]
    pub fn window(&self) -> ExitSignalWindow {
        self.store.read_json(EXIT_SIGNALS_FILE)
    }

    #[must_use]
    pub fn latest(&self) -> ResponseAnalysis {
        self.store.read_json(RESPONSE_ANALYSIS_FILE)
    }

    /// Empty the window and the latest analysis.
    pub fn clear(&self) -> Result<()> {
        self.store
            .write_json(EXIT_SIGNALS_FILE, &ExitSignalWindow::default())?;
        self.store
            .write_json(RESPONSE_ANALYSIS_FILE, &ResponseAnalysis::default())
    }
}
