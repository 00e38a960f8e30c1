use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// No connection became available within the acquire deadline.
    #[error("timed out acquiring a database connection")]
    AcquireTimeout,

    #[error("connection pool is shut down")]
    PoolClosed,

    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// A UNIQUE constraint fired. `constraint` carries the backend's
    /// duplicate-key message so callers can map it onto a field.
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// The user-id sequence has reached its maximum.
    #[error("user id sequence exhausted")]
    SequenceExhausted,

    #[error(transparent)]
    Backend(sqlx::Error),
}

/// MySQL ER_DUP_ENTRY.
const DUP_ENTRY: &str = "23000";

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = err
            && db.code().as_deref() == Some(DUP_ENTRY)
        {
            return Self::UniqueViolation {
                constraint: db.message().to_string(),
            };
        }
        Self::Backend(err)
    }
}
