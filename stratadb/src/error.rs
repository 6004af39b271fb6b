use crate::validation::ValidationIssue;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Malformed input from the caller: bad paging, bad cursor, unsupported
    /// sync event type, mutation through a read-only session.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The resolved authorization keys exclude the target entity.
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    /// Unique-index collision, concurrent schema version collision, or an
    /// advisory lock that is already held. `name` identifies the offending
    /// index or lock so the caller can react distinctly.
    #[error("Conflict on '{name}': {message}")]
    Conflict { name: String, message: String },

    /// Content failed save or publish validation. Carries the full list of
    /// path-addressed issues so a caller can fix everything in one pass.
    #[error("Validation failed")]
    Validation(Vec<ValidationIssue>),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Generic(String),
}

impl RepositoryError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        RepositoryError::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        RepositoryError::NotFound(message.into())
    }

    pub fn not_authorized(message: impl Into<String>) -> Self {
        RepositoryError::NotAuthorized(message.into())
    }

    pub fn conflict(name: impl Into<String>, message: impl Into<String>) -> Self {
        RepositoryError::Conflict {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        RepositoryError::Generic(message.into())
    }

    /// Validation issues, when this error carries them.
    pub fn issues(&self) -> Option<&[ValidationIssue]> {
        match self {
            RepositoryError::Validation(issues) => Some(issues),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;
