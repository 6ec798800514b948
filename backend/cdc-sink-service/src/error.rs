use thiserror::Error;

pub type Result<T> = std::result::Result<T, SinkError>;

#[derive(Debug, Error)]
pub enum SinkError {
    /// Payload could not be read as a Debezium change envelope, or lacks the
    /// columns a mutation needs.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Mutation kind does not match the before/after presence of the payload.
    #[error("Classification fault: {0}")]
    Classification(String),

    /// Destination rejected a statement or insert.
    #[error("Apply error: {message} (statement: {statement})")]
    Apply { statement: String, message: String },

    /// Transient broker error; the consumer backs off and keeps polling.
    #[error("Kafka error: {0}")]
    Kafka(String),

    /// The subscription is gone and cannot be resumed.
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("ClickHouse error: {0}")]
    ClickHouse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SinkError {
    pub fn apply(statement: impl Into<String>, message: impl ToString) -> Self {
        SinkError::Apply {
            statement: statement.into(),
            message: message.to_string(),
        }
    }

    /// Label used for the `cdc_event_faults_total` metric.
    pub fn category(&self) -> &'static str {
        match self {
            SinkError::Decode(_) => "decode",
            SinkError::Classification(_) => "classification",
            SinkError::Apply { .. } | SinkError::ClickHouse(_) => "apply",
            SinkError::Kafka(_) | SinkError::TransportClosed(_) => "transport",
            SinkError::Config(_) => "config",
            SinkError::Internal(_) => "internal",
        }
    }

    /// Only a lost subscription ends the consumer loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::TransportClosed(_))
    }
}

impl From<envy::Error> for SinkError {
    fn from(err: envy::Error) -> Self {
        SinkError::Config(err.to_string())
    }
}
