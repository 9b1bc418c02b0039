use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job was registered without the settings it needs.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The job's schedule could not be evaluated.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Misuse of the lock manager or an I/O failure on a lock file.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Building or delivering a failure notification failed.
    #[error("Mail error: {0}")]
    Mail(String),

    /// A detached job payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<minuteman_core::CoreError> for SchedulerError {
    fn from(e: minuteman_core::CoreError) -> Self {
        match e {
            minuteman_core::CoreError::Config(msg) => SchedulerError::Config(msg),
            minuteman_core::CoreError::Serialization(e) => SchedulerError::Serialization(e),
            minuteman_core::CoreError::Io(e) => SchedulerError::Io(e),
        }
    }
}

/// Schedule evaluation errors.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid schedule '{expression}': {reason}")]
    Parse { expression: String, reason: String },
}

/// Lock manager errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Programmer error: double acquire or release without acquire.
    #[error("{0}")]
    Logic(String),

    /// Every non-blocking attempt found the lock held by someone else.
    #[error("Job is still locked (lockfile: {})!", path.display())]
    Busy { path: PathBuf },

    #[error("Lock file I/O error ({}): {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        LockError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
