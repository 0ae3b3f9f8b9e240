//! Custom error types for the control loop.
//!
//! Structured errors let the controller tell recoverable conditions
//! (transient agent failures) apart from the ones that end a run.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for loop operations
#[derive(Error, Debug)]
pub enum LoopError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Missing required file
    #[error("Missing required file: {path}")]
    MissingFile { path: PathBuf },

    // =========================================================================
    // Agent Errors
    // =========================================================================
    /// The agent command is not installed
    #[error("Agent command not found: {command}")]
    AgentNotFound { command: String },

    /// Agent process could not be started or supervised
    #[error("Agent process error: {message}")]
    AgentProcess { message: String },

    // =========================================================================
    // State Errors
    // =========================================================================
    /// Another controller already owns the state directory
    #[error("Another loop is already running in {dir}")]
    AlreadyRunning { dir: PathBuf },

    /// Persisted state could not be written
    #[error("State write failed for {file}: {message}")]
    StateWrite { file: String, message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoopError {
    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an agent process error
    pub fn agent(message: impl Into<String>) -> Self {
        Self::AgentProcess {
            message: message.into(),
        }
    }

    /// Create a state write error
    pub fn state_write(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StateWrite {
            file: file.into(),
            message: message.into(),
        }
    }

    /// Check if this error is fatal (should abort the run rather than be
    /// retried as a failed iteration)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning { .. }
                | Self::AgentNotFound { .. }
                | Self::MissingFile { .. }
                | Self::StateWrite { .. }
                | Self::Config { .. }
                | Self::InvalidConfig { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AlreadyRunning { .. } => 5,
            Self::MissingFile { .. } | Self::AgentNotFound { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for loop results
pub type Result<T> = std::result::Result<T, LoopError>;
