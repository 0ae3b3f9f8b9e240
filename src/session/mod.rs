//! Session continuity and lifecycle.
//!
//! Two things are tracked here:
//!
//! - the agent's **continuity token** (`claude_session_id`), which lets the
//!   next invocation resume the agent's prior context. It expires after a
//!   configurable age measured from the token file's modification time.
//! - the loop's own **lifecycle record** (`session.json`) plus a bounded
//!   transition log (`session_history.json`).
//!
//! A reset empties the record, drops the token and clears the exit-signal
//! window so the next run starts from a clean slate.

pub mod record;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::signals::ExitSignalAnalyzer;
use crate::state::{StateStore, CONTINUITY_TOKEN_FILE, SESSION_FILE, SESSION_HISTORY_FILE};
use crate::testing::Clock;

pub use record::{SessionRecord, SessionTransition, TransitionLog, MAX_TRANSITIONS};

/// Outcome of checking for a resumable continuity token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResume {
    /// A fresh token exists; pass it to the agent.
    Resume(String),
    /// Start a new agent conversation.
    Fresh,
}

/// Owns the continuity token, the lifecycle record and the transition log.
pub struct SessionManager {
    store: StateStore,
    clock: Arc<dyn Clock>,
    expiry: Duration,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("store", &self.store)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(store: StateStore, clock: Arc<dyn Clock>, expiry: Duration) -> Self {
        Self {
            store,
            clock,
            expiry,
        }
    }

    /// Decide whether the stored continuity token can be reused.
    ///
    /// A token whose age cannot be determined, or whose age has reached the
    /// expiry, is deleted. The lifecycle record is left untouched.
    pub fn resume_or_new(&self) -> Result<SessionResume> {
        let Some(token) = self.token() else {
            return Ok(SessionResume::Fresh);
        };

        match self.token_age() {
            Some(age) if age < self.expiry => {
                info!("Resuming agent session {} (age {}m)", token, age.as_secs() / 60);
                Ok(SessionResume::Resume(token))
            }
            age => {
                match age {
                    Some(age) => info!(
                        "Agent session {} expired after {}h, starting fresh",
                        token,
                        age.as_secs() / 3600
                    ),
                    None => warn!("Could not determine age of agent session {}, starting fresh", token),
                }
                self.store.remove(CONTINUITY_TOKEN_FILE)?;
                let record = self.record();
                self.append_transition(record.state_label(), "expired", "session_expired", 0)?;
                Ok(SessionResume::Fresh)
            }
        }
    }

    /// Age of the token file, `None` when unknown or in the future.
    fn token_age(&self) -> Option<Duration> {
        let modified: DateTime<Utc> = self.store.modified(CONTINUITY_TOKEN_FILE).ok()?.into();
        (self.clock.now() - modified).to_std().ok()
    }

    /// Mark the session as used by `loop_number`, starting one if needed.
    ///
    /// A record left unused for the expiry period is superseded by a new one.
    pub fn refresh(&self, loop_number: u32) -> Result<SessionRecord> {
        let now = self.clock.now();
        let mut record = self.record();

        if record.is_expired(now, self.expiry) {
            info!(
                "Session {} idle past {}h, starting a new one",
                record.session_id.as_deref().unwrap_or("unknown"),
                self.expiry.as_secs() / 3600
            );
            self.append_transition(record.state_label(), "expired", "session_expired", loop_number)?;
            record = SessionRecord::default();
        }

        if record.session_id.is_none() {
            let id = mint_session_id(now);
            debug!("Started session {}", id);
            self.append_transition(record.state_label(), "active", "session_started", loop_number)?;
            record.session_id = Some(id);
            record.created_at = Some(now);
        }
        record.last_used_at = Some(now);

        self.store.write_json(SESSION_FILE, &record)?;
        Ok(record)
    }

    /// End the session.
    ///
    /// Repeating a reset with the same reason leaves the state unchanged.
    pub fn reset(&self, reason: &str, loop_number: u32) -> Result<()> {
        let record = self.record();

        self.store.remove(CONTINUITY_TOKEN_FILE)?;
        ExitSignalAnalyzer::new(self.store.clone()).clear()?;

        if record.is_reset_for(reason) {
            debug!("Session already reset ({}), nothing to do", reason);
            return Ok(());
        }

        info!("Session reset: {}", reason);
        self.store
            .write_json(SESSION_FILE, &SessionRecord::reset(self.clock.now(), reason))?;
        self.append_transition(record.state_label(), "reset", reason, loop_number)
    }

    /// Persist the agent's continuity token.
    ///
    /// Rewriting an unchanged token restarts its expiry clock.
    pub fn store_token(&self, token: &str) -> Result<()> {
        self.store.write_text(CONTINUITY_TOKEN_FILE, token)
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.store.read_text(CONTINUITY_TOKEN_FILE)
    }

    #[must_use]
    pub fn record(&self) -> SessionRecord {
        self.store.read_json(SESSION_FILE)
    }

    #[must_use]
    pub fn history(&self) -> TransitionLog {
        self.store.read_json(SESSION_HISTORY_FILE)
    }

    fn append_transition(&self, from: &str, to: &str, reason: &str, loop_number: u32) -> Result<()> {
        let mut log = self.history();
        log.push(SessionTransition {
            timestamp: self.clock.now(),
            from_state: from.to_string(),
            to_state: to.to_string(),
            reason: reason.to_string(),
            loop_number,
        });
        self.store.write_json(SESSION_HISTORY_FILE, &log)
    }
}

/// `ralph-<unix-seconds>-<random hex>`.
fn mint_session_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("ralph-{}-{}", now.timestamp(), &random[..8])
}
