use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Malformed job parameters, rejected before anything is stored.
    #[error("Invalid job: {0}")]
    Validation(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The job occupies the running slot and cannot be changed that way now.
    #[error("Job is currently running: {id}")]
    JobRunning { id: String },

    /// A JSON column could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A thread panicked while holding a scheduler lock.
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl SchedulerError {
    /// Short error code string returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::JobRunning { .. } => "JOB_RUNNING",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::LockPoisoned(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
