//! Error taxonomy shared by the engine and its stores.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")] Sled(#[from] sled::Error),
    #[error("codec error: {0}")] Codec(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ServingError {
    /// Malformed ensemble or experiment configuration. Nothing was written.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    /// Illegal experiment status transition.
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl ServingError {
    pub fn validation(msg: impl Into<String>) -> Self { Self::Validation(msg.into()) }
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self { Self::NotFound { kind, id: id.into() } }
    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound { .. }) }
}

pub type ServingResult<T> = Result<T, ServingError>;
