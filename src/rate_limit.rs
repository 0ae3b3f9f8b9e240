//! Hourly call budget.
//!
//! The budget resets on hour boundaries: the stored window key is compared
//! with the key of the current hour and a mismatch zeroes the counter. This is
//! a boundary reset, not a rolling window, so a burst straddling the boundary
//! is legal.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::state::{StateStore, CALL_COUNT_FILE, LAST_RESET_FILE};
use crate::testing::Clock;

/// Calls recorded in the current window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallBudget {
    pub window_key: String,
    pub count: u32,
    pub limit: u32,
}

impl CallBudget {
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.count >= self.limit
    }
}

/// Hour-granularity window key, e.g. `2025030114`.
#[must_use]
pub fn window_key(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H").to_string()
}

/// Start of the hour following `at`.
#[must_use]
pub fn next_window_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
        + chrono::Duration::hours(1)
}

/// Enforces the per-hour call budget.
pub struct RateLimiter {
    store: StateStore,
    clock: Arc<dyn Clock>,
    limit: u32,
    show_countdown: bool,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store)
            .field("clock", &"<dyn Clock>")
            .field("limit", &self.limit)
            .finish()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: StateStore, clock: Arc<dyn Clock>, limit: u32) -> Self {
        Self {
            store,
            clock,
            limit,
            show_countdown: false,
        }
    }

    /// Render a countdown bar while waiting for the window to roll over.
    #[must_use]
    pub fn with_countdown(mut self, show: bool) -> Self {
        self.show_countdown = show;
        self
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Current budget, zeroed (and persisted) when the window has rolled over.
    pub fn budget(&self) -> Result<CallBudget> {
        let current = window_key(self.clock.now());
        let stored = self.store.read_text(LAST_RESET_FILE);

        if stored.as_deref() != Some(current.as_str()) {
            debug!(
                "Call window rolled over ({} -> {}), resetting counter",
                stored.as_deref().unwrap_or("none"),
                current
            );
            self.store.write_text(CALL_COUNT_FILE, "0")?;
            self.store.write_text(LAST_RESET_FILE, &current)?;
            return Ok(CallBudget {
                window_key: current,
                count: 0,
                limit: self.limit,
            });
        }

        let count = match self.store.read_text(CALL_COUNT_FILE) {
            None => 0,
            Some(raw) => raw.parse::<u32>().unwrap_or_else(|_| {
                warn!("Invalid call counter '{}', treating as 0", raw);
                0
            }),
        };

        Ok(CallBudget {
            window_key: current,
            count: count.min(self.limit),
            limit: self.limit,
        })
    }

    /// Whether another call fits in the current window.
    #[must_use]
    pub fn can_proceed(&self) -> bool {
        match self.budget() {
            Ok(budget) => !budget.is_exhausted(),
            Err(e) => {
                warn!("Could not read call budget: {}", e);
                false
            }
        }
    }

    /// Record one confirmed successful call. Returns the new count.
    pub fn record_call(&self) -> Result<u32> {
        let budget = self.budget()?;
        let count = (budget.count + 1).min(self.limit);
        self.store.write_text(CALL_COUNT_FILE, &count.to_string())?;
        debug!("Call budget: {}/{}", count, self.limit);
        Ok(count)
    }

    /// Calls recorded in the current window.
    #[must_use]
    pub fn calls_made(&self) -> u32 {
        self.budget().map(|b| b.count).unwrap_or(0)
    }

    /// Calls still available in the current window.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.budget().map_or(0, |b| b.remaining())
    }

    /// When the current window ends.
    #[must_use]
    pub fn next_reset_time(&self) -> DateTime<Utc> {
        next_window_start(self.clock.now())
    }

    /// Block until the window rolls over.
    pub async fn wait_for_reset(&self) {
        let reset_at = self.next_reset_time();
        let total = (reset_at - self.clock.now()).num_seconds().max(0) as u64;
        info!(
            "Call budget of {} exhausted, waiting {}s until {}",
            self.limit,
            total,
            reset_at.format("%H:%M:%S")
        );

        let bar = if self.show_countdown {
            let bar = ProgressBar::new(total);
            if let Ok(style) =
                ProgressStyle::with_template("{spinner} Rate limit reset in {msg} [{bar:40}]")
            {
                bar.set_style(style);
            }
            bar
        } else {
            ProgressBar::hidden()
        };

        loop {
            let now = self.clock.now();
            if now >= reset_at {
                break;
            }
            let remaining = (reset_at - now).to_std().unwrap_or(Duration::ZERO);
            bar.set_position(total.saturating_sub(remaining.as_secs()));
            bar.set_message(format_countdown(remaining));

            let step = if self.show_countdown {
                remaining.min(Duration::from_secs(1))
            } else {
                remaining
            };
            self.clock.sleep(step).await;
        }

        bar.finish_and_clear();
        info!("Rate limit window reset");
    }
}

fn format_countdown(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
