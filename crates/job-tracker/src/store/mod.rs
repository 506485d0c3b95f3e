//! Persistent tabular stores for job application records.
//!
//! The recorder only needs two operations from a store: read every known
//! email id once, and append a single row. Stores never rewrite or delete
//! existing rows.

use crate::error::Result;
use async_trait::async_trait;
use job_types::JobApplicationRecord;
use std::collections::HashSet;

mod jsonl;
mod memory;
mod sheets;

pub use jsonl::JsonLinesStore;
pub use memory::MemoryStore;
pub use sheets::SheetsStore;

/// Append-only store keyed by `source_email_id`.
///
/// Every failure to reach or write the backing storage is reported as
/// [`crate::error::TrackerError::StoreUnavailable`].
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Every `source_email_id` currently stored.
    async fn list_known_ids(&self) -> Result<HashSet<String>>;

    /// Append one row.
    async fn append_row(&self, record: &JobApplicationRecord) -> Result<()>;

    /// Make the store ready for a run (header row, parent directory, ...).
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Short description used in log lines
    fn describe(&self) -> String;
}

#[async_trait]
impl<S: ApplicationStore + ?Sized> ApplicationStore for Box<S> {
    async fn list_known_ids(&self) -> Result<HashSet<String>> {
        (**self).list_known_ids().await
    }

    async fn append_row(&self, record: &JobApplicationRecord) -> Result<()> {
        (**self).append_row(record).await
    }

    async fn prepare(&self) -> Result<()> {
        (**self).prepare().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
