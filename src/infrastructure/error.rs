use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl InfraError {
    /// Collaborator failures the user may retry; validation and state errors are caller bugs.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Sqlite(_) | Self::Io(_))
    }
}
