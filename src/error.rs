//! Error types for the database test harness.
//!
//! Every public operation returns [`HarnessResult`]. Variants carry enough
//! context (pool name, transaction id, schema name) for a failing test to
//! report what went wrong without extra logging.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Pool '{pool}' failed to initialize after {attempts} attempt(s): {message}")]
    PoolInitialization {
        pool: String,
        message: String,
        attempts: u32,
    },

    #[error("Pool '{pool}' exhausted: no connection available after {attempts} attempt(s) ({waited_ms}ms)")]
    PoolExhausted {
        pool: String,
        attempts: u32,
        waited_ms: u64,
    },

    #[error("Pool '{pool}' is closed")]
    PoolClosed { pool: String },

    #[error("Pool not found: {pool}")]
    PoolNotFound { pool: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Transaction '{transaction_id}' is not active")]
    TransactionInactive { transaction_id: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Savepoint '{savepoint}' not found in transaction '{transaction_id}'")]
    SavepointNotFound {
        savepoint: String,
        transaction_id: String,
    },

    #[error("Circular dependency detected at schema '{schema}': {}", path.join(" -> "))]
    CircularDependency { schema: String, path: Vec<String> },

    #[error("No seeded data for schema '{schema}'")]
    NoSeededData { schema: String },

    #[error("Cleanup verification failed: {}", residue.join("; "))]
    CleanupVerificationFailed { residue: Vec<String> },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Operation '{operation}' is not supported by the {backend} backend")]
    Unsupported { backend: String, operation: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Migration '{migration}' failed: {message}")]
    Migration { migration: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl HarnessError {
    pub fn pool_initialization(
        pool: impl Into<String>,
        message: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self::PoolInitialization {
            pool: pool.into(),
            message: message.into(),
            attempts,
        }
    }

    pub fn pool_exhausted(pool: impl Into<String>, attempts: u32, waited_ms: u64) -> Self {
        Self::PoolExhausted {
            pool: pool.into(),
            attempts,
            waited_ms,
        }
    }

    pub fn pool_closed(pool: impl Into<String>) -> Self {
        Self::PoolClosed { pool: pool.into() }
    }

    pub fn pool_not_found(pool: impl Into<String>) -> Self {
        Self::PoolNotFound { pool: pool.into() }
    }

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

    pub fn transaction_inactive(transaction_id: impl Into<String>) -> Self {
        Self::TransactionInactive {
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    pub fn savepoint_not_found(
        savepoint: impl Into<String>,
        transaction_id: impl Into<String>,
    ) -> Self {
        Self::SavepointNotFound {
            savepoint: savepoint.into(),
            transaction_id: transaction_id.into(),
        }
    }

    pub fn circular_dependency(schema: impl Into<String>, path: Vec<String>) -> Self {
        Self::CircularDependency {
            schema: schema.into(),
            path,
        }
    }

    pub fn no_seeded_data(schema: impl Into<String>) -> Self {
        Self::NoSeededData {
            schema: schema.into(),
        }
    }

    pub fn cleanup_verification_failed(residue: Vec<String>) -> Self {
        Self::CleanupVerificationFailed { residue }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn unsupported(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            backend: backend.into(),
            operation: operation.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn migration(migration: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Migration {
            migration: migration.into(),
            message: message.into(),
        }
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
            Self::PoolExhausted { .. } => {
                Some("Release connections promptly or raise max_connections")
            }
            Self::CircularDependency { .. } => {
                Some("Break the cycle by removing a dependency or relationship between schemas")
            }
            Self::NoSeededData { .. } => Some("Seed the schema before asking for its records"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::PoolExhausted { .. }
        )
    }

    /// Errors that should abort the whole suite rather than a single test.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PoolInitialization { .. }
                | Self::CircularDependency { .. }
                | Self::Configuration { .. }
        )
    }
}

/// Convert sqlx errors to HarnessError.
impl From<sqlx::Error> for HarnessError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => HarnessError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                HarnessError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => HarnessError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => HarnessError::timeout("driver pool acquire", 0),
            sqlx::Error::PoolClosed => {
                HarnessError::connection("Driver pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => HarnessError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => HarnessError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => HarnessError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                HarnessError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                HarnessError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => {
                HarnessError::internal(format!("Decode error: {}", source))
            }
            sqlx::Error::WorkerCrashed => HarnessError::internal("Database worker crashed"),
            _ => HarnessError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<regex::Error> for HarnessError {
    fn from(err: regex::Error) -> Self {
        HarnessError::configuration(format!("Invalid pattern: {}", err))
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::internal(format!("JSON error: {}", err))
    }
}

/// Result type alias for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HarnessError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = HarnessError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(HarnessError::timeout("acquire", 30).is_retryable());
        assert!(HarnessError::connection("err", "sugg").is_retryable());
        assert!(HarnessError::pool_exhausted("main", 3, 100).is_retryable());
        assert!(!HarnessError::transaction_inactive("tx_1").is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(HarnessError::pool_initialization("main", "refused", 3).is_fatal());
        assert!(HarnessError::circular_dependency("a", vec!["a".into(), "b".into()]).is_fatal());
        assert!(!HarnessError::no_seeded_data("users").is_fatal());
    }

    #[test]
    fn test_circular_dependency_display_includes_path() {
        let err = HarnessError::circular_dependency(
            "a",
            vec!["a".to_string(), "b".to_string(), "a".to_string()],
        );
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_verification_failed_lists_residue() {
        let err = HarnessError::cleanup_verification_failed(vec![
            "users: 2 rows remain".to_string(),
            "posts: 1 rows remain".to_string(),
        ]);
        let text = err.to_string();
        assert!(text.contains("users: 2 rows remain"));
        assert!(text.contains("posts: 1 rows remain"));
    }

    #[test]
    fn test_regex_error_is_configuration() {
        let err: HarnessError = regex::Regex::new("(").unwrap_err().into();
        assert!(matches!(err, HarnessError::Configuration { .. }));
    }
}
