use thiserror::Error;

/// Errors surfaced by the job store and its callers.
#[derive(Debug, Error)]
pub enum Error {
    /// No job with the given id.
    #[error("job not found: {0}")]
    NotFound(String),

    /// Enqueue collided with an existing job id.
    #[error("job already exists: {0}")]
    AlreadyExists(String),

    /// The operation requires the subject to be in a different state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Malformed user input: bad job JSON, unknown state filter, or a
    /// non-numeric value for a numeric config key.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Failure in the underlying storage engine.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Filesystem failure around the data directory or pid file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Process exit code the CLI maps this error to.
    ///
    /// 1 for internal errors, 2 for validation errors, 3 for state
    /// conflicts.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidInput(_) => 2,
            Error::NotFound(_) | Error::AlreadyExists(_) | Error::InvalidState(_) => 3,
            Error::Storage(_) | Error::Io(_) => 1,
        }
    }
}
