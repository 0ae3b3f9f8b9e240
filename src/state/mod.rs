//! Persisted control-plane state.
//!
//! Every concern lives in its own file under `.ralph/`. The controller is the
//! only writer while a run is active; readers validate what they load and
//! substitute a safe empty default when a file is missing or corrupted.
//!
//! # Layout
//!
//! ```text
//! .ralph/
//!   ├── call_count              call budget counter (integer)
//!   ├── last_reset              window key of the counter
//!   ├── circuit_breaker.json    breaker state
//!   ├── session.json            session lifecycle record
//!   ├── session_history.json    transition log (<= 50 entries)
//!   ├── exit_signals.json       exit-signal window
//!   ├── response_analysis.json  latest response analysis
//!   ├── status.json             run-status snapshot
//!   ├── claude_session_id       continuity token
//!   └── logs/
//! ```

pub mod status;

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{LoopError, Result};

pub use status::RunStatus;

pub const CALL_COUNT_FILE: &str = "call_count";
pub const LAST_RESET_FILE: &str = "last_reset";
pub const CIRCUIT_BREAKER_FILE: &str = "circuit_breaker.json";
pub const SESSION_FILE: &str = "session.json";
pub const SESSION_HISTORY_FILE: &str = "session_history.json";
pub const EXIT_SIGNALS_FILE: &str = "exit_signals.json";
pub const RESPONSE_ANALYSIS_FILE: &str = "response_analysis.json";
pub const STATUS_FILE: &str = "status.json";
pub const CONTINUITY_TOKEN_FILE: &str = "claude_session_id";
pub const LOG_DIR: &str = "logs";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file held for the lifetime of a run.
const LOCK_FILE: &str = "loop.lock";

/// File-per-concern state store rooted at the state directory.
///
/// # Example
///
/// ```rust
/// use ralph_loop::state::StateStore;
///
/// let dir = tempfile::tempdir().unwrap();
/// let store = StateStore::new(dir.path());
/// store.write_text("call_count", "3").unwrap();
/// assert_eq!(store.read_text("call_count").as_deref(), Some("3"));
/// ```
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Root of the state directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of a state file.
    #[must_use]
    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Directory holding run logs and agent output captures.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.dir.join(LOG_DIR)
    }

    /// Create the state and log directories if needed.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.log_dir())?;
        Ok(())
    }

    #[must_use]
    pub fn exists(&self, file: &str) -> bool {
        self.path(file).exists()
    }

    /// Read a structured record, falling back to the default on any failure.
    pub fn read_json<T>(&self, file: &str) -> T
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path(file);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
            Err(e) => {
                warn!("Could not read {}: {}. Using empty state.", path.display(), e);
                return T::default();
            }
        };

        if contents.trim().is_empty() {
            return T::default();
        }

        match serde_json::from_str(&contents) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "Corrupted state file at {}: {}. Using empty state.",
                    path.display(),
                    e
                );
                T::default()
            }
        }
    }

    /// Write a structured record atomically.
    pub fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        self.write_text(file, &json)
    }

    /// Read a plain-text value, trimmed. Missing or unreadable files yield `None`.
    #[must_use]
    pub fn read_text(&self, file: &str) -> Option<String> {
        match fs::read_to_string(self.path(file)) {
            Ok(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(_) => None,
        }
    }

    /// Write a plain-text value atomically (tmp file + rename).
    pub fn write_text(&self, file: &str, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let tmp_path = self.path(&format!("{file}{TMP_SUFFIX}"));
        let write = || -> std::io::Result<()> {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(contents.as_bytes())?;
            tmp.sync_all()?;
            fs::rename(&tmp_path, self.path(file))
        };

        write().map_err(|e| LoopError::state_write(file, e.to_string()))
    }

    /// Delete a state file; missing files are not an error.
    pub fn remove(&self, file: &str) -> Result<()> {
        match fs::remove_file(self.path(file)) {
            Ok(()) => {
                debug!("Removed state file {}", file);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Last modification time of a state file.
    pub fn modified(&self, file: &str) -> std::io::Result<SystemTime> {
        fs::metadata(self.path(file))?.modified()
    }

    /// Take the single-writer lock for this state directory.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::AlreadyRunning`] when another process holds it.
    pub fn lock(&self) -> Result<StateLock> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path(LOCK_FILE))?;

        file.try_lock_exclusive()
            .map_err(|_| LoopError::AlreadyRunning {
                dir: self.dir.clone(),
            })?;

        Ok(StateLock { file })
    }
}

/// Exclusive advisory lock released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
