//! Errors raised by the engine services

use thiserror::Error;

/// Engine error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Core domain error: {0}")]
    Core(#[from] overseer_core::Error),

    #[error("Could not load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("State encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Collaborator failure: {0}")]
    Collaborator(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found<S1: Into<String>, S2: ToString>(entity: S1, id: S2) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// The wrapped domain error, if this is one
    pub fn as_core(&self) -> Option<&overseer_core::Error> {
        match self {
            Error::Core(err) => Some(err),
            _ => None,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Error::Core(err) => err.category(),
            Error::Config(_) => "configuration",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::NotFound { .. } => "not_found",
            Error::Collaborator(_) => "collaborator",
        }
    }
}

/// Convenience result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
