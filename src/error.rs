//! Error kinds surfaced by the store, the matching engine, and the
//! DAO/need operations.
//!
//! Capability implementations (embedding, rationale, similarity search)
//! return `anyhow::Result`; callers wrap those failures into
//! [`PollenError::ExternalService`] so the HTTP layer can pick a status
//! code without inspecting message text.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PollenError>;

#[derive(Debug, Error)]
pub enum PollenError {
    /// A required field is missing or malformed.
    #[error("{0}")]
    Validation(String),

    /// A referenced entity id or address does not exist.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// An embedding, rationale, or similarity-search call failed.
    #[error("{service} failed: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    /// A store read or write failed.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl PollenError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn external(service: &'static str, err: impl std::fmt::Display) -> Self {
        Self::ExternalService {
            service,
            message: err.to_string(),
        }
    }

    /// HTTP status code for this error kind.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound { .. } => 404,
            Self::ExternalService { .. } | Self::Persistence(_) => 500,
        }
    }
}

impl From<sqlx::Error> for PollenError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return Self::Validation(format!("duplicate record: {}", db_err.message()));
            }
        }
        Self::Persistence(err.to_string())
    }
}
