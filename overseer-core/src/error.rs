//! Failure taxonomy shared by the domain model and the engine
//!
//! Routing rejections (`Validation`, `Expired`, `Loop`, `Unreachable`) each
//! leave exactly one terminal record behind in the router. A classification
//! miss is not an error: it degrades to an UNKNOWN blocker.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid input: {message}")]
    Validation { message: String },

    #[error("Message {message_id} expired before delivery")]
    Expired { message_id: String },

    #[error("Routing loop: message {message_id} exceeded hop ceiling {ceiling}")]
    Loop { message_id: String, ceiling: u32 },

    #[error("Recipient unreachable: {recipient} - {reason}")]
    Unreachable { recipient: String, reason: String },

    #[error("{operation} gave no answer within {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Resolution exhausted for blocker {blocker_id}")]
    Exhausted { blocker_id: String },

    #[error("{entity_type} {id} is not known")]
    NotFound { entity_type: String, id: String },

    #[error("Illegal transition: {message}")]
    StateTransition { message: String },

    #[error("Bad configuration: {message}")]
    Configuration { message: String },

    #[error("Malformed JSON: {0}")]
    Serialization(String),

    #[error("Unexpected failure: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error::Configuration {
            message: format!("invalid pattern: {}", err),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl Error {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn expired<S: ToString>(message_id: S) -> Self {
        Self::Expired {
            message_id: message_id.to_string(),
        }
    }

    pub fn routing_loop<S: ToString>(message_id: S, ceiling: u32) -> Self {
        Self::Loop {
            message_id: message_id.to_string(),
            ceiling,
        }
    }

    pub fn unreachable<S1: ToString, S2: Into<String>>(recipient: S1, reason: S2) -> Self {
        Self::Unreachable {
            recipient: recipient.to_string(),
            reason: reason.into(),
        }
    }

    /// A collaborator wait that ran past its bound
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn exhausted<S: ToString>(blocker_id: S) -> Self {
        Self::Exhausted {
            blocker_id: blocker_id.to_string(),
        }
    }

    pub fn not_found<S1: Into<String>, S2: ToString>(entity_type: S1, id: S2) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }

    pub fn state_transition<S: Into<String>>(message: S) -> Self {
        Self::StateTransition {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Errors the router settles locally by dead-lettering the message
    pub fn is_dead_letter(&self) -> bool {
        matches!(
            self,
            Error::Validation { .. } | Error::Loop { .. } | Error::Unreachable { .. }
        )
    }

    /// A later attempt may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Unreachable { .. })
    }

    /// Stable lowercase name, used as a log field
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::Expired { .. } => "expired",
            Error::Loop { .. } => "loop",
            Error::Unreachable { .. } => "unreachable",
            Error::Timeout { .. } => "timeout",
            Error::Exhausted { .. } => "exhausted",
            Error::NotFound { .. } => "not_found",
            Error::StateTransition { .. } => "state_transition",
            Error::Configuration { .. } => "configuration",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
