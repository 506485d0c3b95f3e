//! Deduplicating append-only recorder.
//!
//! Each `source_email_id` reaches the store at most once. The known-id set is
//! read once per batch and grown as rows are appended, so duplicates already
//! in the store and duplicates within the batch are both skipped. A failed
//! write leaves earlier rows in place; resubmitting the whole batch only
//! appends what is still missing.

use crate::error::Result;
use crate::store::ApplicationStore;
use job_types::JobApplicationRecord;

/// Counts from one `record` call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordStats {
    pub appended: usize,
    pub duplicates: usize,
    pub not_job_related: usize,
}

pub struct Recorder<S> {
    store: S,
}

impl<S: ApplicationStore> Recorder<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Append every record whose id is not yet stored, returning how many
    /// rows were written.
    pub async fn record(&self, batch: &[JobApplicationRecord]) -> Result<usize> {
        Ok(self.record_with_stats(batch).await?.appended)
    }

    pub async fn record_with_stats(&self, batch: &[JobApplicationRecord]) -> Result<RecordStats> {
        let mut stats = RecordStats::default();
        if batch.is_empty() {
            return Ok(stats);
        }

        let mut known = self.store.list_known_ids().await?;
        tracing::debug!(
            "Recording batch of {} against {} known ids in {}",
            batch.len(),
            known.len(),
            self.store.describe()
        );

        for record in batch {
            if !record.category.is_job_related() {
                tracing::debug!("  Skipped (not job related): {}", record.source_email_id);
                stats.not_job_related += 1;
                continue;
            }

            if known.contains(&record.source_email_id) {
                tracing::trace!("  Skipped (duplicate): {}", record.source_email_id);
                stats.duplicates += 1;
                continue;
            }

            self.store.append_row(record).await?;
            known.insert(record.source_email_id.clone());
            stats.appended += 1;

            tracing::debug!(
                "  Stored: {} - {} / {} ({})",
                record.source_email_id,
                record.company,
                record.position,
                record.category
            );
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrackerError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use job_types::ApplicationCategory;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(id: &str) -> JobApplicationRecord {
        JobApplicationRecord {
            source_email_id: id.to_string(),
            account_name: "Personal Gmail".to_string(),
            observed_at: Utc::now(),
            company: "Acme".to_string(),
            position: "Backend Engineer".to_string(),
            category: ApplicationCategory::Update,
            detail: format!("email {}", id),
            interview_at: None,
        }
    }

    fn batch(ids: &[&str]) -> Vec<JobApplicationRecord> {
        ids.iter().map(|id| record(id)).collect()
    }

    fn stored_ids(store: &MemoryStore) -> Vec<String> {
        store.rows().into_iter().map(|r| r.source_email_id).collect()
    }

    /// Memory store whose appends start failing after `fail_after` successes
    struct FlakyStore {
        inner: MemoryStore,
        fail_after: AtomicUsize,
        reads: AtomicUsize,
    }

    impl FlakyStore {
        fn new(fail_after: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_after: AtomicUsize::new(fail_after),
                reads: AtomicUsize::new(0),
            }
        }

        fn heal(&self) {
            self.fail_after.store(usize::MAX, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ApplicationStore for FlakyStore {
        async fn list_known_ids(&self) -> Result<HashSet<String>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.list_known_ids().await
        }

        async fn append_row(&self, record: &JobApplicationRecord) -> Result<()> {
            if self.inner.len() >= self.fail_after.load(Ordering::SeqCst) {
                return Err(TrackerError::store_unavailable("sheet quota exceeded"));
            }
            self.inner.append_row(record).await
        }

        fn describe(&self) -> String {
            "flaky store".to_string()
        }
    }

    #[tokio::test]
    async fn existing_and_in_batch_duplicates_are_skipped() {
        let store = MemoryStore::with_rows(batch(&["A", "B"]));
        let recorder = Recorder::new(store);

        let appended = recorder.record(&batch(&["A", "C", "C", "D"])).await.unwrap();

        assert_eq!(appended, 2);
        assert_eq!(stored_ids(recorder.store()), vec!["A", "B", "C", "D"]);
    }

    #[tokio::test]
    async fn empty_store_accepts_distinct_batch() {
        let recorder = Recorder::new(MemoryStore::new());

        let appended = recorder.record(&batch(&["X", "Y", "Z"])).await.unwrap();

        assert_eq!(appended, 3);
        let known = recorder.store().list_known_ids().await.unwrap();
        assert_eq!(
            known,
            HashSet::from(["X".to_string(), "Y".to_string(), "Z".to_string()])
        );
    }

    #[tokio::test]
    async fn resubmitting_a_batch_appends_nothing() {
        let recorder = Recorder::new(MemoryStore::new());
        let incoming = batch(&["m1", "m2", "m3"]);

        assert_eq!(recorder.record(&incoming).await.unwrap(), 3);
        assert_eq!(recorder.record(&incoming).await.unwrap(), 0);
        assert_eq!(recorder.store().len(), 3);
    }

    #[tokio::test]
    async fn only_first_occurrence_of_an_id_is_kept() {
        let recorder = Recorder::new(MemoryStore::new());
        let mut incoming = batch(&["dup", "other", "dup"]);
        incoming[2].detail = "second copy".to_string();

        let stats = recorder.record_with_stats(&incoming).await.unwrap();

        assert_eq!(stats.appended, 2);
        assert_eq!(stats.duplicates, 1);
        let rows = recorder.store().rows();
        assert_eq!(rows[0].detail, "email dup");
    }

    #[tokio::test]
    async fn failed_append_keeps_earlier_rows_and_retry_converges() {
        let recorder = Recorder::new(FlakyStore::new(2));
        let incoming = batch(&["a", "b", "c", "d"]);

        let err = recorder.record(&incoming).await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert_eq!(stored_ids(&recorder.store().inner), vec!["a", "b"]);

        recorder.store().heal();
        let appended = recorder.record(&incoming).await.unwrap();

        assert_eq!(appended, 2);
        assert_eq!(stored_ids(&recorder.store().inner), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn known_ids_are_read_once_per_batch() {
        let recorder = Recorder::new(FlakyStore::new(usize::MAX));

        recorder.record(&batch(&["1", "2", "3", "4"])).await.unwrap();

        assert_eq!(recorder.store().reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_job_related_records_never_reach_the_store() {
        let recorder = Recorder::new(MemoryStore::new());
        let mut incoming = batch(&["job", "newsletter"]);
        incoming[1].category = ApplicationCategory::NotJobRelated;

        let stats = recorder.record_with_stats(&incoming).await.unwrap();

        assert_eq!(stats.appended, 1);
        assert_eq!(stats.not_job_related, 1);
        assert_eq!(stored_ids(recorder.store()), vec!["job"]);
    }

    #[tokio::test]
    async fn empty_batch_does_not_touch_the_store() {
        let recorder = Recorder::new(FlakyStore::new(0));
        assert_eq!(recorder.record(&[]).await.unwrap(), 0);
        assert_eq!(recorder.store().reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreadable_store_fails_before_any_write() {
        struct DownStore;

        #[async_trait]
        impl ApplicationStore for DownStore {
            async fn list_known_ids(&self) -> Result<HashSet<String>> {
                Err(TrackerError::store_unavailable("connection refused"))
            }

            async fn append_row(&self, _record: &JobApplicationRecord) -> Result<()> {
                panic!("append must not be attempted");
            }

            fn describe(&self) -> String {
                "down".to_string()
            }
        }

        let recorder = Recorder::new(DownStore);
        let err = recorder.record(&batch(&["a"])).await.unwrap_err();
        assert!(matches!(err, TrackerError::StoreUnavailable(_)));
    }
}
