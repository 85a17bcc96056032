//! Error types for the charge point core

use thiserror::Error;

use crate::transaction::ConnectorId;

/// Rejections at the session API boundary
///
/// None of these change any state: the call is refused before a transaction,
/// store entry or operation is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("idTag missing or longer than {max} characters")]
    InvalidIdTag { max: usize },

    #[error("Unknown connector {0}")]
    UnknownConnector(ConnectorId),

    #[error("Connector 0 represents the whole charge point and cannot host a session")]
    NotAPhysicalConnector,

    #[error("Connector {0} already has an active session")]
    SessionActive(ConnectorId),

    #[error("StartTransaction already requested on connector {0}")]
    StartAlreadyRequested(ConnectorId),

    #[error("No session on connector {0}")]
    NoSession(ConnectorId),

    #[error("Transaction store full on connector {0}")]
    QueueFull(ConnectorId),

    #[error("Transaction on connector {0} is silent and never reported")]
    SilentTransaction(ConnectorId),

    #[error("Operation engine refused the request: {0}")]
    Engine(#[from] EngineError),
}

/// Errors registering an operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Correlation id {0} is already in flight")]
    DuplicateCorrelationId(String),

    #[error("In-flight queue full ({0} operations)")]
    QueueFull(usize),
}

/// Persistence backend failures
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Configuration access failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("Configuration key {0} is read-only")]
    ReadOnly(String),

    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}
