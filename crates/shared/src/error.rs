//! Error types for ClubPass

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClubError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for ClubError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ClubError::NotFound("row not found".to_string()),
            other => ClubError::Database(other.to_string()),
        }
    }
}
