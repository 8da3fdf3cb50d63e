//! Error types for background jobs

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Background job errors
#[derive(Debug, Error)]
pub enum JobError {
    /// Working directory is missing or is not a directory; nothing was started
    #[error("Bad working directory: {}", path.display())]
    BadWorkingDir { path: PathBuf },

    /// The OS could not create the process
    #[error("Failed to start process: {0}")]
    ExecFailed(#[source] io::Error),

    /// Process disappeared between spawn and reap
    #[error("Failed to wait for process (PID: {pid}): {reason}")]
    WaitFailed { pid: u32, reason: String },

    /// Waiting was abandoned through a cancellation token
    #[error("Waiting for job was cancelled")]
    Cancelled,

    /// Command exited with a non-zero code and reported errors
    #[error("Command failed with exit code {exit_code}: {errors}")]
    CommandFailed { exit_code: i32, errors: String },

    /// Invalid configuration
    #[error("Invalid jobs configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be loaded
    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    /// Operation is not available for this job or platform
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// I/O on a job's pipes failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl JobError {
    /// Whether the error was raised before any process was started
    pub fn is_spawn_error(&self) -> bool {
        matches!(self, JobError::BadWorkingDir { .. } | JobError::ExecFailed(_))
    }
}

/// Result type for job operations
pub type Result<T> = std::result::Result<T, JobError>;
