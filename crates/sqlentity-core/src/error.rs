//! Error types for persistence operations.
//!
//! Failures fall into four families. Expected, recoverable conditions
//! (optimistic lock loss, unique violations) never surface here at all:
//! callers see `Ok(false)` or an [`crate::driver::ExecOutcome`] instead.
//! Everything in this module is a real fault: connectivity and
//! configuration problems, programming errors against the connection
//! state machine, and remote-call failures translated into the local
//! vocabulary.

use std::fmt;

/// The primary error type for all persistence operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, login)
    Connection(ConnectionError),
    /// Statement execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// Misuse of the connection state machine (closed handle, double
    /// attach, cursor op on a forward-only statement). Always propagates.
    Consistency(String),
    /// Remote session call failed below the request/response layer
    Remote(RemoteError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
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
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    Refused,
    /// Connection pool exhausted
    PoolExhausted,
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
    /// Constraint violation (unique, primary key)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Row lock wait exceeded the busy timeout
    LockTimeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool exhausted (no available connections)
    Exhausted,
    /// Connection checkout timeout
    Timeout,
    /// Pool is closed
    Closed,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

#[derive(Debug)]
pub struct RemoteError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl QueryError {
    /// Build a generic database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self {
            kind: QueryErrorKind::Database,
            sql: None,
            sqlstate: None,
            message: message.into(),
            source: None,
        }
    }

    /// Build a unique-constraint violation carrying SQLSTATE 23505.
    pub fn unique_violation(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: QueryErrorKind::Constraint,
            sql: Some(sql.into()),
            sqlstate: Some("23505".to_string()),
            message: message.into(),
            source: None,
        }
    }

    /// Build a syntax error for the given statement text.
    pub fn syntax(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: QueryErrorKind::Syntax,
            sql: Some(sql.into()),
            sqlstate: None,
            message: message.into(),
            source: None,
        }
    }

    /// Build a missing-table-or-column error.
    pub fn not_found(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: QueryErrorKind::NotFound,
            sql: Some(sql.into()),
            sqlstate: None,
            message: message.into(),
            source: None,
        }
    }

    /// Build a row-lock busy-timeout error.
    pub fn lock_timeout(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: QueryErrorKind::LockTimeout,
            sql: Some(sql.into()),
            sqlstate: None,
            message: message.into(),
            source: None,
        }
    }

    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }
}

impl Error {
    /// Build a consistency error (misuse of the API, always propagates).
    pub fn consistency(message: impl Into<String>) -> Self {
        Error::Consistency(message.into())
    }

    /// Is this a retryable error (deadlock, serialization, pool pressure)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock
                    | QueryErrorKind::Serialization
                    | QueryErrorKind::LockTimeout
            ),
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Exhausted | PoolErrorKind::Timeout),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::PoolExhausted),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Authentication
                    | ConnectionErrorKind::Disconnected
                    | ConnectionErrorKind::DnsResolution
                    | ConnectionErrorKind::Refused
            ),
            Error::Remote(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Is this a unique constraint violation?
    ///
    /// The session layer turns these into a sticky flag plus a `false`
    /// return; only driver-level code should ever observe one directly.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Query(q) => q.is_unique_violation(),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

/// User-meaningful classification of a failed login.
///
/// Interactive front ends inspect the error left behind by a failed open
/// and decide whether to blame the operator (wrong password, bad host
/// name) or the environment (server down, pool drained).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailure {
    /// Wrong user or password
    BadCredentials,
    /// Host name did not resolve or is unreachable
    HostUnreachable,
    /// Server reachable but refusing or dropping connections
    ServerDown,
    /// All pooled connections in use
    PoolSaturated,
    /// Anything else
    Other,
}

impl LoginFailure {
    /// Classify a failed login attempt.
    pub fn classify(err: &Error) -> Self {
        match err {
            Error::Connection(c) => match c.kind {
                ConnectionErrorKind::Authentication => LoginFailure::BadCredentials,
                ConnectionErrorKind::DnsResolution => LoginFailure::HostUnreachable,
                ConnectionErrorKind::Connect
                | ConnectionErrorKind::Refused
                | ConnectionErrorKind::Disconnected => LoginFailure::ServerDown,
                ConnectionErrorKind::PoolExhausted => LoginFailure::PoolSaturated,
            },
            Error::Pool(p) => match p.kind {
                PoolErrorKind::Exhausted | PoolErrorKind::Timeout => LoginFailure::PoolSaturated,
                PoolErrorKind::Closed => LoginFailure::ServerDown,
            },
            Error::Timeout | Error::Io(_) => LoginFailure::ServerDown,
            _ => LoginFailure::Other,
        }
    }

    /// Can the operator fix this by changing their input?
    pub fn is_user_correctable(&self) -> bool {
        matches!(self, LoginFailure::BadCredentials | LoginFailure::HostUnreachable)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
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
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Consistency(msg) => write!(f, "Consistency error: {}", msg),
            Error::Remote(e) => write!(f, "Remote call failed: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Remote(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
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

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        Error::Remote(err)
    }
}

/// Result type alias for persistence operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_helpers() {
        let query = QueryError::unique_violation("INSERT INTO modcounter", "duplicate key");

        assert!(query.is_unique_violation());

        let err = Error::Query(query);
        assert!(err.is_unique_violation());
        assert_eq!(err.sqlstate(), Some("23505"));
        assert_eq!(err.sql(), Some("INSERT INTO modcounter"));
    }

    #[test]
    fn retryable_and_connection_flags() {
        let deadlock = Error::Query(QueryError {
            kind: QueryErrorKind::Deadlock,
            sql: None,
            sqlstate: None,
            message: "deadlock detected".to_string(),
            source: None,
        });
        assert!(deadlock.is_retryable());

        let pool_exhausted = Error::Pool(PoolError {
            kind: PoolErrorKind::Exhausted,
            message: "pool exhausted".to_string(),
        });
        assert!(pool_exhausted.is_retryable());

        let conn_error = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: "lost connection".to_string(),
            source: None,
        });
        assert!(conn_error.is_connection_error());

        let misuse = Error::consistency("connection is closed");
        assert!(!misuse.is_retryable());
        assert!(!misuse.is_connection_error());
    }

    #[test]
    fn login_failure_classification() {
        let auth = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Authentication,
            message: "password rejected".to_string(),
            source: None,
        });
        assert_eq!(LoginFailure::classify(&auth), LoginFailure::BadCredentials);
        assert!(LoginFailure::classify(&auth).is_user_correctable());

        let refused = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Refused,
            message: "connection refused".to_string(),
            source: None,
        });
        assert_eq!(LoginFailure::classify(&refused), LoginFailure::ServerDown);
        assert!(!LoginFailure::classify(&refused).is_user_correctable());

        let drained = Error::Pool(PoolError {
            kind: PoolErrorKind::Timeout,
            message: "checkout timed out".to_string(),
        });
        assert_eq!(LoginFailure::classify(&drained), LoginFailure::PoolSaturated);

        assert_eq!(
            LoginFailure::classify(&Error::consistency("whatever")),
            LoginFailure::Other
        );
    }
}
