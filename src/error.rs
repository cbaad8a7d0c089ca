//! Error types for SMS Relay.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures while refreshing forwarding rules from the configuration service.
#[derive(Debug, thiserror::Error)]
pub enum RuleStoreError {
    /// Network-level failure. Retried by the next refresh tick, never immediately.
    #[error("Rule fetch failed: {0}")]
    TransientNetwork(String),

    /// The service answered with a non-success status.
    #[error("Rule service returned HTTP {status}")]
    Http { status: u16 },

    /// The payload could not be understood as a rule list.
    #[error("Malformed rule payload: {0}")]
    ConfigParse(String),
}

/// Failures submitting to the SMS or email transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{channel} submission failed: {reason}")]
    Submission { channel: String, reason: String },

    #[error("No {channel} destination configured for rule {rule_id}")]
    MissingDestination { channel: String, rule_id: String },

    #[error("{channel} transport unavailable: {reason}")]
    Unavailable { channel: String, reason: String },
}

/// Failures posting audit records to the reporting service.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Report request failed: {0}")]
    TransientNetwork(String),

    #[error("Report rejected with HTTP {status}")]
    Rejected { status: u16 },
}

/// Failures aborting a reconciliation tick.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Failed to read message history: {0}")]
    HistoryRead(String),

    #[error("Failed to persist message cache: {0}")]
    CacheWrite(String),
}
