use thiserror::Error;

use crate::bus::EntityId;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Malformed {kind} message from {sender}: {reason}")]
    MalformedMessage {
        sender: EntityId,
        kind: String,
        reason: String,
    },

    #[error("Directory lookup failed: {0}")]
    DiscoveryFailure(String),

    #[error("No entity registered on the bus as {0}")]
    UnknownRecipient(EntityId),

    #[error("Entity already registered: {0}")]
    DuplicateEntity(EntityId),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
