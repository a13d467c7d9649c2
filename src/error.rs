//! Error types for the instrumentation layer.
//!
//! All failures surface as [`DbError`]. Driver errors are only ever wrapped,
//! never replaced: the transaction manager joins extra context onto the
//! original error and the predicates below (`is_canceled`, `is_tx_done`, ...)
//! look through every branch of a joined error.

use crate::context::ContextError;
use thiserror::Error;

/// Boxed application error carried through the transaction manager.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "40001" for serialization failure
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("No rows returned")]
    RowNotFound,

    /// An optional driver capability is not implemented by the wrapped object.
    #[error("Unsupported operation: {capability}")]
    Unsupported { capability: &'static str },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("Transaction has already been committed or rolled back")]
    TxDone,

    #[error("Transaction already exists in context")]
    TxExists,

    /// Marker joined onto commits that hit an already finished transaction
    /// without any cancellation in play.
    #[error("Transaction aborted")]
    TxAborted,

    #[error("Commit canceled: {source}")]
    CommitCanceled {
        #[source]
        source: Box<DbError>,
    },

    /// The transaction finished while the context was being cancelled. The
    /// server-side outcome is unknown.
    #[error("Commit failed after transaction was already finished: {context}")]
    AmbiguousCommit { context: ContextError },

    #[error("Commit on already finished transaction: {}", DbError::TxAborted)]
    CommitAborted,

    #[error("Commit failed: {source}")]
    Commit {
        #[source]
        source: Box<DbError>,
    },

    #[error("{cause} (rollback: {rollback})")]
    Rollback {
        #[source]
        cause: Box<DbError>,
        rollback: Box<DbError>,
    },

    #[error(transparent)]
    Application(BoxError),
}

impl DbError {
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

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn unsupported(capability: &'static str) -> Self {
        Self::Unsupported { capability }
    }

    /// Wrap a caller-defined error so it can flow through a transaction body.
    pub fn application<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Application(Box::new(err))
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Database { .. }
        )
    }

    /// Returns true if `pred` holds for this error or any error joined into it.
    pub fn any(&self, pred: &dyn Fn(&DbError) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            Self::CommitCanceled { source } | Self::Commit { source } => source.any(pred),
            Self::Rollback { cause, rollback } => cause.any(pred) || rollback.any(pred),
            Self::AmbiguousCommit { context } => pred(&Self::Context(*context)),
            _ => false,
        }
    }

    /// First context error found in this error or its joined errors.
    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            Self::Context(c) | Self::AmbiguousCommit { context: c } => Some(*c),
            Self::CommitCanceled { source } | Self::Commit { source } => source.context_error(),
            Self::Rollback { cause, rollback } => {
                cause.context_error().or_else(|| rollback.context_error())
            }
            _ => None,
        }
    }

    pub fn is_context(&self) -> bool {
        self.context_error().is_some()
    }

    pub fn is_canceled(&self) -> bool {
        self.any(&|e| matches!(e, Self::Context(ContextError::Canceled)))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.any(&|e| matches!(e, Self::Context(ContextError::DeadlineExceeded)))
    }

    pub fn is_tx_done(&self) -> bool {
        self.any(&|e| {
            matches!(
                e,
                Self::TxDone | Self::AmbiguousCommit { .. } | Self::CommitAborted
            )
        })
    }

    pub fn is_tx_exists(&self) -> bool {
        self.any(&|e| matches!(e, Self::TxExists))
    }

    pub fn is_ambiguous(&self) -> bool {
        self.any(&|e| matches!(e, Self::AmbiguousCommit { .. }))
    }

    pub fn is_aborted(&self) -> bool {
        self.any(&|e| matches!(e, Self::TxAborted | Self::CommitAborted))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Locate a caller error of type `E` anywhere in the joined chain.
    pub fn find<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Application(inner) => inner.downcast_ref::<E>(),
            Self::CommitCanceled { source } | Self::Commit { source } => source.find(),
            Self::Rollback { cause, rollback } => cause.find().or_else(|| rollback.find()),
            _ => None,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::RowNotFound,
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
