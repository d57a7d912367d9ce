//! Error types for the transaction router.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Failures raised by a unit of work are carried unchanged inside [`TxError::Work`] so
//! callers can still recover the original cause after rollback has run.

use crate::models::Propagation;
use thiserror::Error;

/// Boxed error raised by a unit of work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum TxError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Illegal transaction state for propagation '{propagation}': {message}")]
    IllegalTransactionState {
        propagation: Propagation,
        message: String,
    },

    #[error("Transaction rolled back: {message}")]
    UnexpectedRollback { message: String },

    #[error("Routing key '{key}' is not registered (known keys: {known})")]
    RoutingKeyNotRegistered { key: String, known: String },

    #[error("Read-only transaction: {operation} is not allowed")]
    ReadOnlyTransaction { operation: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Unit of work failed: {source}")]
    Work {
        #[source]
        source: BoxError,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TxError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an illegal transaction state error (MANDATORY without, NEVER with a transaction).
    pub fn illegal_state(propagation: Propagation, message: impl Into<String>) -> Self {
        Self::IllegalTransactionState {
            propagation,
            message: message.into(),
        }
    }

    /// Create an unexpected rollback error.
    pub fn unexpected_rollback(message: impl Into<String>) -> Self {
        Self::UnexpectedRollback {
            message: message.into(),
        }
    }

    /// Create a routing key not registered error.
    pub fn routing_key_not_registered(key: impl Into<String>, known: &[&str]) -> Self {
        Self::RoutingKeyNotRegistered {
            key: key.into(),
            known: known.join(", "),
        }
    }

    /// Create a read-only violation error.
    pub fn read_only(operation: impl Into<String>) -> Self {
        Self::ReadOnlyTransaction {
            operation: operation.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wrap a failure raised inside a unit of work.
    pub fn work<E>(source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Work {
            source: source.into(),
        }
    }

    /// Wrap a plain message as a unit-of-work failure.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::work(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::RoutingKeyNotRegistered { .. } => {
                Some("Register a target for this key or use one of the known keys")
            }
            Self::IllegalTransactionState { .. } => {
                Some("Check the propagation declared for this call against its call stack")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Informational only: nothing in this crate retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// True for MANDATORY/NEVER violations detected before the unit of work ran.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalTransactionState { .. })
    }

    /// The original failure raised by a unit of work, if this is one.
    pub fn work_source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Work { source } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// Recover the original unit-of-work error as a concrete type.
    pub fn downcast_work<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.work_source().and_then(|source| source.downcast_ref::<E>())
    }
}

/// Convert sqlx errors to TxError.
impl From<sqlx::Error> for TxError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => TxError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                TxError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => TxError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            // Sessions report the pool's own acquire timeout; see `DbSession::acquire`
            sqlx::Error::PoolTimedOut => TxError::connection(
                "Timed out waiting for a pooled connection",
                "Increase the pool size or the acquire timeout",
            ),
            sqlx::Error::PoolClosed => {
                TxError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => TxError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => TxError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => TxError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => TxError::database(
                format!("Column not found: {}", col),
                None,
                "Check the selected column names",
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                TxError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => TxError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => TxError::internal("Database worker crashed"),
            _ => TxError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for transactional operations.
pub type TxResult<T> = Result<T, TxError>;
