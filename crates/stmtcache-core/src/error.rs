//! Error types for stmtcache operations.

use std::fmt;

/// The primary error type for all stmtcache operations.
#[derive(Debug)]
pub enum Error {
    /// Executor (scope) errors: closed scope, recursion, mapping
    Executor(ExecutorError),
    /// Cache gate errors: lock timeout, protocol violation, cancelled wait
    Cache(CacheError),
    /// Query execution errors raised by the execution adapter
    Query(QueryError),
    /// Connection-related errors raised by the execution adapter
    Connection(ConnectionError),
    /// Transaction errors (commit, rollback, close of the resource)
    Transaction(TransactionError),
    /// Type conversion errors
    Type(TypeError),
    /// Configuration errors
    Config(ConfigError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ExecutorError {
    pub kind: ExecutorErrorKind,
    pub statement_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorErrorKind {
    /// The scope was already closed
    Closed,
    /// A query re-entered a key that is still being computed
    RecursiveQuery,
    /// A single-valued extraction found more than one result
    TooManyResults,
    /// A deferred load found its dependency in an unexpected state
    DeferredLoad,
    /// Result materialization failed
    Mapping,
}

#[derive(Debug)]
pub struct CacheError {
    pub kind: CacheErrorKind,
    /// Identity of the cache that raised the error
    pub cache_id: String,
    /// Rendered cache key, when the error concerns one key
    pub key: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheErrorKind {
    /// Waiting on a key's gate exceeded the configured timeout
    LockTimeout,
    /// A gate was released that was never acquired (or released twice)
    LockProtocol,
    /// The waiting caller was cancelled while blocked on a gate
    Cancelled,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Commit failed
    Commit,
    /// Rollback failed
    Rollback,
    /// Releasing the resource failed
    Close,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Error raised by any operation attempted after the scope was closed.
    pub fn closed(message: impl Into<String>) -> Self {
        Error::Executor(ExecutorError {
            kind: ExecutorErrorKind::Closed,
            statement_id: None,
            message: message.into(),
        })
    }

    /// Is this a retryable error (deadlock, serialization, lock and statement timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::Cache(c) => c.kind == CacheErrorKind::LockTimeout,
            _ => false,
        }
    }

    /// Was the operation rejected because the scope is closed?
    pub fn is_closed_scope(&self) -> bool {
        matches!(self, Error::Executor(e) if e.kind == ExecutorErrorKind::Closed)
    }

    /// Did waiting on a cache gate time out?
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Error::Cache(e) if e.kind == CacheErrorKind::LockTimeout)
    }

    /// Was a gate released without being held?
    pub fn is_lock_protocol_violation(&self) -> bool {
        matches!(self, Error::Cache(e) if e.kind == CacheErrorKind::LockProtocol)
    }

    /// Was the operation (or a wait on a gate) cancelled?
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cache(e) if e.kind == CacheErrorKind::Cancelled)
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the statement id attached to an executor error, if any.
    pub fn statement_id(&self) -> Option<&str> {
        match self {
            Error::Executor(e) => e.statement_id.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Executor(e) => match &e.statement_id {
                Some(id) => write!(f, "Executor error in statement '{}': {}", id, e.message),
                None => write!(f, "Executor error: {}", e.message),
            },
            Error::Cache(e) => write!(f, "Cache error at cache '{}': {}", e.cache_id, e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ExecutorError> for Error {
    fn from(err: ExecutorError) -> Self {
        Error::Executor(err)
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        Error::Cache(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(ConfigError {
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

/// Result type alias for stmtcache operations.
pub type Result<T> = std::result::Result<T, Error>;
