//! Job application tracker.
//!
//! Polls email accounts, classifies each message with an LLM and appends the
//! job-related ones to a spreadsheet, at most once per email.

pub mod classifier;
pub mod config;
pub mod error;
pub mod fetchers;
pub mod pipeline;
pub mod recorder;
pub mod scheduler;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, TrackerError};
