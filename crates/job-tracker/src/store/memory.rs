use super::ApplicationStore;
use crate::error::{Result, TrackerError};
use async_trait::async_trait;
use job_types::JobApplicationRecord;
use std::collections::HashSet;
use std::sync::Mutex;

/// In-process store used for dry runs and as a stand-in during tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<JobApplicationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from rows that are already "in the sheet".
    pub fn with_rows(rows: Vec<JobApplicationRecord>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    /// Snapshot of all appended rows in insertion order
    pub fn rows(&self) -> Vec<JobApplicationRecord> {
        self.rows
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ApplicationStore for MemoryStore {
    async fn list_known_ids(&self) -> Result<HashSet<String>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| TrackerError::store_unavailable("memory store lock poisoned"))?;
        Ok(rows.iter().map(|r| r.source_email_id.clone()).collect())
    }

    async fn append_row(&self, record: &JobApplicationRecord) -> Result<()> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| TrackerError::store_unavailable("memory store lock poisoned"))?;
        rows.push(record.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "in-memory store".to_string()
    }
}
