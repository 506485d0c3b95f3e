//! Error type for the recording core.
//!
//! Provider and LLM clients report failures through `anyhow` with context;
//! this enum covers the errors the pipeline needs to tell apart.

use job_types::UnknownCategory;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// The persistent store could not be read or written. The batch may have
    /// been partially applied and is safe to resubmit in full.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The classifier answered with a category outside the enumeration
    #[error(transparent)]
    UnknownCategory(#[from] UnknownCategory),

    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TrackerError {
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        TrackerError::StoreUnavailable(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        TrackerError::Config(message.into())
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, TrackerError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;
