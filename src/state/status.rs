//! Run-status snapshot rewritten every iteration for external observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{StateStore, STATUS_FILE};
use crate::error::Result;

/// Snapshot of the run as seen from outside the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunStatus {
    pub timestamp: Option<DateTime<Utc>>,
    pub loop_count: u32,
    pub calls_this_window: u32,
    pub budget_limit: u32,
    pub last_action: String,
    /// `running`, `paused`, `completed`, `halted`, `stopped`, `failed`...
    pub status: String,
    pub exit_reason: Option<String>,
    pub next_reset_time: Option<DateTime<Utc>>,
}

impl RunStatus {
    /// Load the last written snapshot, if any.
    #[must_use]
    pub fn load(store: &StateStore) -> Option<Self> {
        if !store.exists(STATUS_FILE) {
            return None;
        }
        let status: RunStatus = store.read_json(STATUS_FILE);
        status.timestamp.is_some().then_some(status)
    }

    pub fn save(&self, store: &StateStore) -> Result<()> {
        store.write_json(STATUS_FILE, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_status() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path());
        assert!(RunStatus::load(&store).is_none());
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path());
        let status = RunStatus {
            timestamp: Some(Utc::now()),
            loop_count: 7,
            calls_this_window: 3,
            budget_limit: 100,
            last_action: "executing".into(),
            status: "running".into(),
            exit_reason: None,
            next_reset_time: None,
        };
        status.save(&store).unwrap();
        assert_eq!(RunStatus::load(&store), Some(status));
    }
}
