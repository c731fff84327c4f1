use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Trigger installation failed for table {table}: {reason}")]
    TriggerBuild { table: String, reason: String },

    #[error("Apply error: {0}")]
    Apply(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Lock contention and friends clear on retry; callers back off instead
    /// of failing the slave.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Store(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Constraint violations on the registry map to validation errors so the
    /// admin surface can answer 400 instead of 500.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Error::Store(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
