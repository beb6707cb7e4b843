//! Error types for the AquaPin engine.
//!
//! Offline and failed fetches are not errors here: the fetcher and the sync
//! engine turn them into return values. What remains is backend failure of
//! the durable store and caller misuse.

use thiserror::Error;

/// All possible errors from the AquaPin engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The durable store backend failed to read or write.
    #[error("store error: {0}")]
    Store(String),

    /// A value could not be serialized before being written.
    #[error("serialization error for key '{key}': {message}")]
    Serialization { key: String, message: String },

    /// A payload was not the JSON object the operation requires.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl Error {
    /// Wrap any backend error as a store failure.
    pub fn store(err: impl std::fmt::Display) -> Self {
        Error::Store(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
