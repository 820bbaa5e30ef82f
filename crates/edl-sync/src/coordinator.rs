//! Resumable, cursor-driven pulls over the source table.

use std::sync::Arc;

use edl_adapters::{pull_records, DirectoryLookup, LookupError};
use edl_core::{CandidatePool, SourceRecord};
use edl_storage::{SourceQuery, SourceScope, SourceTable, SourceTableError};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PullError {
    #[error(transparent)]
    Source(#[from] SourceTableError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

pub type Pulled = Vec<(SourceRecord, CandidatePool)>;

/// Reads windows of the source table and looks every record up.
///
/// The cursor only moves after a batch has been read and looked up in full;
/// a failed batch can be retried from the same offset.
pub struct PullCoordinator {
    source: Arc<dyn SourceTable>,
    lookup: Arc<dyn DirectoryLookup>,
    scope: SourceScope,
    cursor: u64,
    concurrency: usize,
}

impl PullCoordinator {
    pub fn new(
        source: Arc<dyn SourceTable>,
        lookup: Arc<dyn DirectoryLookup>,
        scope: SourceScope,
        start: u64,
    ) -> Self {
        Self {
            source,
            lookup,
            scope,
            cursor: start,
            concurrency: 1,
        }
    }

    /// Lookups in flight at once. Results keep query order either way.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn scope(&self) -> SourceScope {
        self.scope
    }

    pub fn seek(&mut self, offset: u64) {
        self.cursor = offset;
    }

    /// Pull the window `[cursor, cursor + n)` and advance the cursor by `n`,
    /// even when the window comes back short or empty.
    pub async fn read_next_n(&mut self, n: u64) -> Result<Pulled, PullError> {
        let pulled = self
            .pull(SourceQuery {
                offset: self.cursor,
                limit: Some(n),
                scope: self.scope,
            })
            .await?;
        self.cursor = self.cursor.saturating_add(n);
        debug!(cursor = self.cursor, "cursor advanced");
        Ok(pulled)
    }

    /// Pull everything from the cursor to the end of the table, then rewind to 0.
    pub async fn read_all(&mut self) -> Result<Pulled, PullError> {
        let pulled = self
            .pull(SourceQuery {
                offset: self.cursor,
                limit: None,
                scope: self.scope,
            })
            .await?;
        self.cursor = 0;
        Ok(pulled)
    }

    async fn pull(&self, query: SourceQuery) -> Result<Pulled, PullError> {
        let records = self.source.read(query).await?;
        info!(
            offset = query.offset,
            limit = ?query.limit,
            scope = ?query.scope,
            records = records.len(),
            "read source window"
        );
        Ok(pull_records(self.lookup.as_ref(), records, self.concurrency).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use edl_adapters::{LookupObserver, TracingObserver};
    use edl_core::CandidateExtract;
    use edl_storage::FixtureSourceTable;

    /// One candidate per record, named after the record id.
    #[derive(Default)]
    struct EchoLookup {
        calls: AtomicUsize,
        fail_on: Option<&'static str>,
        observer: TracingObserver,
    }

    #[async_trait]
    impl DirectoryLookup for EchoLookup {
        async fn lookup(&self, record: &SourceRecord) -> Result<CandidatePool, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(record.id.as_str()) {
                return Err(LookupError::UnexpectedPayload {
                    record_id: record.id.clone(),
                    message: "unexpected".to_string(),
                    payload: "{}".to_string(),
                });
            }
            Ok(vec![CandidateExtract {
                directory_id: format!("biz-{}", record.id),
                ..Default::default()
            }])
        }

        fn observer(&self) -> &dyn LookupObserver {
            &self.observer
        }
    }

    struct BrokenTable;

    #[async_trait]
    impl SourceTable for BrokenTable {
        async fn read(&self, _query: SourceQuery) -> Result<Vec<SourceRecord>, SourceTableError> {
            Err(SourceTableError::Fixture("connection reset".to_string()))
        }
    }

    fn table(count: usize) -> Arc<FixtureSourceTable> {
        Arc::new(FixtureSourceTable::new(
            (0..count)
                .map(|i| SourceRecord::new(format!("{i:03}"), Some("Name"), Some("1 Main St"), None, None))
                .collect(),
        ))
    }

    fn ids(pulled: &Pulled) -> Vec<&str> {
        pulled.iter().map(|(record, _)| record.id.as_str()).collect()
    }

    #[tokio::test]
    async fn consecutive_batches_are_contiguous_and_disjoint() {
        let mut coordinator =
            PullCoordinator::new(table(10), Arc::new(EchoLookup::default()), SourceScope::All, 0);

        let first = coordinator.read_next_n(3).await.unwrap();
        let second = coordinator.read_next_n(3).await.unwrap();

        assert_eq!(ids(&first), vec!["000", "001", "002"]);
        assert_eq!(ids(&second), vec!["003", "004", "005"]);
        assert_eq!(coordinator.cursor(), 6);
        assert_eq!(second[0].1[0].directory_id, "biz-003");
    }

    #[tokio::test]
    async fn end_of_data_is_an_empty_batch() {
        let mut coordinator =
            PullCoordinator::new(table(4), Arc::new(EchoLookup::default()), SourceScope::All, 2);

        assert_eq!(coordinator.read_next_n(5).await.unwrap().len(), 2);
        assert!(coordinator.read_next_n(5).await.unwrap().is_empty());
        assert_eq!(coordinator.cursor(), 12);
    }

    #[tokio::test]
    async fn read_all_returns_the_rest_and_rewinds() {
        let mut coordinator =
            PullCoordinator::new(table(5), Arc::new(EchoLookup::default()), SourceScope::All, 0);
        coordinator.read_next_n(2).await.unwrap();

        let rest = coordinator.read_all().await.unwrap();
        assert_eq!(ids(&rest), vec!["002", "003", "004"]);
        assert_eq!(coordinator.cursor(), 0);
    }

    #[tokio::test]
    async fn seek_moves_the_cursor() {
        let mut coordinator =
            PullCoordinator::new(table(5), Arc::new(EchoLookup::default()), SourceScope::All, 0);
        coordinator.seek(4);
        let batch = coordinator.read_next_n(2).await.unwrap();
        assert_eq!(ids(&batch), vec!["004"]);
        assert_eq!(coordinator.cursor(), 6);
    }

    #[tokio::test]
    async fn unmatched_scope_skips_matched_ids_without_shifting_the_window() {
        let source = table(6);
        source.mark_matched(["001", "002"]).await;
        let mut coordinator =
            PullCoordinator::new(source, Arc::new(EchoLookup::default()), SourceScope::Unmatched, 0);

        let first = coordinator.read_next_n(3).await.unwrap();
        let second = coordinator.read_next_n(3).await.unwrap();
        assert_eq!(ids(&first), vec!["000"]);
        assert_eq!(ids(&second), vec!["003", "004", "005"]);
    }

    #[tokio::test]
    async fn cursor_saturates_at_the_top_of_the_range() {
        let mut coordinator =
            PullCoordinator::new(table(3), Arc::new(EchoLookup::default()), SourceScope::All, 0);
        coordinator.seek(u64::MAX - 1);

        assert!(coordinator.read_next_n(5).await.unwrap().is_empty());
        assert_eq!(coordinator.cursor(), u64::MAX);
    }

    #[tokio::test]
    async fn batch_query_failure_propagates_and_keeps_the_cursor() {
        let lookup = Arc::new(EchoLookup::default());
        let mut coordinator =
            PullCoordinator::new(Arc::new(BrokenTable), lookup.clone(), SourceScope::All, 7);

        let err = coordinator.read_next_n(3).await.unwrap_err();
        assert!(matches!(err, PullError::Source(_)));
        assert_eq!(coordinator.cursor(), 7);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fatal_lookup_error_propagates_and_keeps_the_cursor() {
        let lookup = Arc::new(EchoLookup {
            fail_on: Some("001"),
            ..Default::default()
        });
        let mut coordinator = PullCoordinator::new(table(4), lookup, SourceScope::All, 0);

        let err = coordinator.read_next_n(3).await.unwrap_err();
        assert!(matches!(err, PullError::Lookup(LookupError::UnexpectedPayload { .. })));
        assert_eq!(coordinator.cursor(), 0);
    }

    #[tokio::test]
    async fn concurrent_lookups_keep_query_order() {
        let mut coordinator =
            PullCoordinator::new(table(8), Arc::new(EchoLookup::default()), SourceScope::All, 0)
                .with_concurrency(4);
        let batch = coordinator.read_all().await.unwrap();
        assert_eq!(
            ids(&batch),
            vec!["000", "001", "002", "003", "004", "005", "006", "007"]
        );
    }
}
