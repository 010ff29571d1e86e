//! Error types shared across the engine.
//!
//! Benign per-tick outcomes (lock contention, retrain not due, missing
//! model) are modelled as outcome enums on the operations themselves;
//! only genuine failures surface here.

use thiserror::Error;

/// Errors produced by the detection engine and its stores.
#[derive(Debug, Error)]
pub enum MlError {
    /// A storage query failed partway through; the cursor has been
    /// finalised and the current tick proceeds without the data.
    #[error("storage query failed: {0}")]
    Storage(String),

    /// The event store rejected an operation.
    #[error("event store: {0}")]
    Store(#[from] rusqlite::Error),

    /// Startup-time configuration error. Fatal.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MlError>;
