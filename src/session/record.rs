//! Session lifecycle record and transition log.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of transitions kept in the history file.
pub const MAX_TRANSITIONS: usize = 50;

/// Lifecycle of the current loop session.
///
/// An empty `session_id` always comes with empty `created_at` and
/// `last_used_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRecord {
    pub session_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub reset_at: Option<DateTime<Utc>>,
    pub reset_reason: Option<String>,
}

impl SessionRecord {
    /// Empty record stamped with a reset.
    #[must_use]
    pub fn reset(at: DateTime<Utc>, reason: &str) -> Self {
        Self {
            reset_at: Some(at),
            reset_reason: Some(reason.to_string()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.session_id.is_some()
    }

    /// Whether an active record has gone unused for at least `expiry`.
    ///
    /// An active record without a last-use time counts as expired; a
    /// last-use time in the future does not.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.last_used_at {
            Some(last_used) => (now - last_used)
                .to_std()
                .is_ok_and(|idle| idle >= expiry),
            None => true,
        }
    }

    /// Whether this record is already the result of a reset for `reason`.
    #[must_use]
    pub fn is_reset_for(&self, reason: &str) -> bool {
        !self.is_active()
            && self.reset_at.is_some()
            && self.reset_reason.as_deref() == Some(reason)
    }

    pub(crate) fn state_label(&self) -> &'static str {
        if self.is_active() {
            "active"
        } else {
            "inactive"
        }
    }
}

/// One lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTransition {
    pub timestamp: DateTime<Utc>,
    pub from_state: String,
    pub to_state: String,
    pub reason: String,
    pub loop_number: u32,
}

/// Bounded, append-only transition history. Oldest entries are evicted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionLog {
    entries: VecDeque<SessionTransition>,
}

impl TransitionLog {
    pub fn push(&mut self, transition: SessionTransition) {
        self.entries.push_back(transition);
        while self.entries.len() > MAX_TRANSITIONS {
            self.entries.pop_front();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent transition.
    #[must_use]
    pub fn last(&self) -> Option<&SessionTransition> {
        self.entries.back()
    }

    /// Transitions, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &SessionTransition> {
        self.entries.iter()
    }
}
