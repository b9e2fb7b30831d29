//! Error types for the backplane library.

use thiserror::Error;

/// Result type alias for backplane operations.
pub type BackplaneResult<T> = Result<T, BackplaneError>;

/// PostgreSQL unique violation (SQLSTATE 23505).
const UNIQUE_VIOLATION: &str = "23505";
/// PostgreSQL foreign key violation (SQLSTATE 23503).
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Errors that can occur while publishing, polling, acknowledging or cleaning.
#[derive(Error, Debug)]
pub enum BackplaneError {
    /// Connectivity to the shared store was lost (pool exhausted/closed, I/O, TLS)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Schema could not be provisioned or reached during bootstrap
    #[error("Backplane schema unavailable: {0}")]
    SchemaUnavailable(String),

    /// Envelope flagged as invocation without a method name
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Writing a decoded message to one local connection failed
    #[error("Delivery to connection {connection_id} failed: {reason}")]
    Delivery {
        connection_id: String,
        reason: String,
    },

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Backplane error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for BackplaneError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => BackplaneError::StoreUnavailable(err.to_string()),
            other => BackplaneError::Database(other),
        }
    }
}

impl BackplaneError {
    /// Check if error is a uniqueness violation.
    ///
    /// For ack insertion and subscriber registration this is the expected
    /// outcome of a lost race, not a failure.
    pub fn is_unique_violation(&self) -> bool {
        self.sql_state().as_deref() == Some(UNIQUE_VIOLATION)
    }

    /// Check if error is a foreign key violation (ack for a removed message).
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sql_state().as_deref() == Some(FOREIGN_KEY_VIOLATION)
    }

    /// Check if error is transient (the owning loop should retry next cycle)
    pub fn is_transient(&self) -> bool {
        matches!(self, BackplaneError::StoreUnavailable(_))
    }

    fn sql_state(&self) -> Option<String> {
        match self {
            BackplaneError::Database(sqlx_err) => sqlx_err
                .as_database_error()
                .and_then(|db_err| db_err.code().map(|code| code.into_owned())),
            _ => None,
        }
    }
}
