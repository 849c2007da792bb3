/// Unified error type for the connector
///
/// Covers cluster construction, statement execution, value conversion and the
/// aggregate failure raised by a write that had failed statements.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Cluster handle could not be built (no contact point reachable)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Topology has no host marked up
    #[error("Cannot connect to Cassandra: no live hosts found")]
    NoLiveHosts,

    /// Session could not be opened or was unusable
    #[error("Session error: {0}")]
    Session(String),

    /// Statement preparation failed
    #[error("Prepare error: {0}")]
    Prepare(String),

    /// A single statement or batch failed at the driver layer
    #[error("Execution error: {0}")]
    Execution(String),

    /// A value could not be converted or serialized for its column
    #[error("Cannot convert value of column '{column}': {details}")]
    Conversion { column: String, details: String },

    /// Selected columns do not fit the target table
    #[error("Schema error: {0}")]
    Schema(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Some statements of a write failed after every statement was attempted
    #[error("Failed to write {failed} of {attempted} statement(s) to \"{keyspace}\".\"{table}\"")]
    WriteFailed {
        keyspace: String,
        table: String,
        failed: u64,
        attempted: u64,
    },

    /// Internal invariant broken (closed semaphore, poisoned state)
    #[error("Internal error: {0}")]
    Internal(String),

    #[cfg(feature = "scylla")]
    #[error("Cassandra error: {0}")]
    NewSession(#[from] scylla::errors::NewSessionError),

    #[cfg(feature = "scylla")]
    #[error("Execution error: {0}")]
    ScyllaExecution(#[from] scylla::errors::ExecutionError),

    #[cfg(feature = "scylla")]
    #[error("Prepare error: {0}")]
    ScyllaPrepare(#[from] scylla::errors::PrepareError),
}

impl ConnectorError {
    pub fn conversion(column: impl Into<String>, details: impl Into<String>) -> Self {
        ConnectorError::Conversion {
            column: column.into(),
            details: details.into(),
        }
    }

    /// True for the aggregate failure raised after a drained write
    pub fn is_write_failure(&self) -> bool {
        matches!(self, ConnectorError::WriteFailed { .. })
    }
}

#[cfg(feature = "config")]
impl From<core_config::ConfigError> for ConnectorError {
    fn from(err: core_config::ConfigError) -> Self {
        ConnectorError::ConfigError(err.to_string())
    }
}

/// Result type alias for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_failed_message_names_table_and_count() {
        let err = ConnectorError::WriteFailed {
            keyspace: "ks".to_string(),
            table: "events".to_string(),
            failed: 2,
            attempted: 4,
        };
        let message = err.to_string();
        assert!(message.contains("2 of 4"));
        assert!(message.contains("\"ks\".\"events\""));
        assert!(err.is_write_failure());
    }

    #[test]
    fn test_conversion_helper() {
        let err = ConnectorError::conversion("age", "not a number");
        assert_eq!(
            err.to_string(),
            "Cannot convert value of column 'age': not a number"
        );
        assert!(!err.is_write_failure());
    }
}
