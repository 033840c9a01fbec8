use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors surfaced to callers of the driver.
///
/// `Aborted` never appears here: aborts are absorbed by the retry state
/// machine and only show up as `RetryBudgetExceeded` once it gives up.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Optimistic concurrency check failed on '{table}': expected {column} = {expected}, found {found}")]
    OptimisticConcurrency {
        table: String,
        column: String,
        expected: String,
        found: String,
    },
    #[error("Malformed statement: {reason} (sql: {sql})")]
    MalformedStatement { sql: String, reason: String },
    #[error("Transaction aborted {attempts} times, giving up (last abort: {last_abort})")]
    RetryBudgetExceeded { attempts: u32, last_abort: String },
    #[error("Database error on attempt {attempt}: {message} (sql: {sql})")]
    FatalDatabase {
        sql: String,
        attempt: u32,
        message: String,
    },
    #[error("Replayed statement returned a different result than attempt {attempt} observed (sql: {sql})")]
    ConcurrentModification { sql: String, attempt: u32 },
    #[error("Transaction cancelled during attempt {attempt}")]
    Cancelled { attempt: u32 },
    #[error("{scope} timeout exceeded: {elapsed:?} > {limit:?}")]
    Timeout {
        scope: TimeoutScope,
        elapsed: Duration,
        limit: Duration,
    },
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DriverError {
    /// Errors the caller may resolve by re-running the whole logical operation.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::RetryBudgetExceeded { .. })
    }

    /// Version mismatches, either from a locking read or a 0-row versioned DML.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::OptimisticConcurrency { .. })
    }

    pub(crate) fn malformed(sql: &str, reason: impl Into<String>) -> Self {
        Self::MalformedStatement {
            sql: sql.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for DriverError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutScope {
    Statement,
    Transaction,
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Statement => write!(f, "Statement"),
            Self::Transaction => write!(f, "Transaction"),
        }
    }
}

/// Errors reported by the underlying database client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The database aborted the transaction; the whole attempt must restart.
    #[error("Transaction aborted: {message}")]
    Aborted {
        message: String,
        retry_delay: Option<Duration>,
    },
    #[error("{0}")]
    Database(String),
}

impl ClientError {
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
            retry_delay: None,
        }
    }

    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

// Statement-level failures inside a client are plain database errors.
impl From<DriverError> for ClientError {
    fn from(err: DriverError) -> Self {
        Self::Database(err.to_string())
    }
}
