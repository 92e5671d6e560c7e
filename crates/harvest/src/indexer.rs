//! The indexer job: drains records queued by enqueue-mode harvesting,
//! re-derives them and refreshes their identifiers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bibsync_core::{Error, RawRecord};
use bibsync_runner::{Job, JobOutput};
use bibsync_storage::Database;

use crate::error::HarvestError;
use crate::harvester::DEFAULT_BATCH_SIZE;
use crate::store::{RecordStore, StoredRecord};
use crate::transform::Transform;

/// Counters for one indexing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub indexed: usize,
    pub skipped: usize,
}

pub struct RecordIndexer {
    source_id: String,
    name: String,
    db: Database,
    transform: Arc<dyn Transform>,
    batch_size: usize,
}

impl RecordIndexer {
    pub fn new(source_id: impl Into<String>, db: Database, transform: Arc<dyn Transform>) -> Self {
        let source_id = source_id.into();
        Self {
            name: format!("oai_indexer:{}", source_id),
            source_id,
            db,
            transform,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Index queued records until the queue is empty. Each batch commits on
    /// its own; cancellation is checked between batches.
    pub async fn index(&self, cancel: &CancellationToken, out: &mut JobOutput) -> Result<IndexStats, HarvestError> {
        let mut stats = IndexStats::default();
        loop {
            if cancel.is_cancelled() {
                return Err(HarvestError::Canceled);
            }
            let records = RecordStore::queued(self.db.pool(), &self.source_id, self.batch_size).await?;
            if records.is_empty() {
                break;
            }

            let mut tx = self.db.begin().await?;
            for rec in &records {
                match self.transform.transform(&staged(rec)) {
                    Ok(derived) if !derived.is_archived() => {
                        RecordStore::reindex(&mut tx, &self.source_id, &derived).await?;
                        stats.indexed += 1;
                    }
                    Ok(_) => RecordStore::dequeue(&mut tx, &self.source_id, &rec.id).await?,
                    Err(e) => {
                        // Dequeued anyway; the staged payload stays for inspection.
                        warn!(source = %self.source_id, error = %e, "skipping record");
                        out.line(&e);
                        RecordStore::dequeue(&mut tx, &self.source_id, &rec.id).await?;
                        stats.skipped += 1;
                    }
                }
            }
            tx.commit().await?;
            out.push_str(".");
        }

        out.line(format!("Indexed {} records, {} skipped.", stats.indexed, stats.skipped));
        info!(
            job = %self.name,
            source = %self.source_id,
            indexed = stats.indexed,
            skipped = stats.skipped,
            "indexing finished"
        );
        Ok(stats)
    }
}

/// The record as the transform should see it: staged payload first.
fn staged(rec: &StoredRecord) -> RawRecord {
    RawRecord {
        identifier: rec.id.clone(),
        datestamp: rec.updated_at.to_rfc3339(),
        deleted: false,
        metadata: rec.new_payload.clone().unwrap_or_else(|| rec.payload.clone()),
    }
}

#[async_trait]
impl Job for RecordIndexer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: CancellationToken, out: &mut JobOutput) -> Result<(), Error> {
        self.index(&cancel, out).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bibsync_core::{DerivedRecord, EntityKind, ExternalId, Ingestion};
    use bibsync_runner::{JobStatus, Runner};
    use chrono::Utc;

    use crate::sources::SourceSpec;
    use crate::store::{CursorStore, UpsertMode};
    use crate::transform::TransformError;

    /// Label and `local` identifier from the metadata text.
    fn derived(id: &str, metadata: &str) -> DerivedRecord {
        DerivedRecord {
            id: id.to_string(),
            kind: EntityKind::Publication,
            label: metadata.to_string(),
            payload: metadata.to_string(),
            archived_at: None,
            identifiers: vec![ExternalId::new("local", metadata)],
            ingestion: Ingestion::default(),
        }
    }

    fn by_metadata(raw: &RawRecord) -> Result<DerivedRecord, TransformError> {
        if raw.metadata == "BROKEN" {
            return Err(TransformError::Malformed { id: raw.identifier.clone(), reason: "unreadable".into() });
        }
        Ok(derived(&raw.identifier, &raw.metadata))
    }

    async fn persist(db: &Database, metadata: &str, mode: UpsertMode) {
        let mut tx = db.begin().await.unwrap();
        RecordStore::persist_batch(&mut tx, "src", &[derived("r1", metadata)], &[], mode, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    async fn identifiers(db: &Database) -> Vec<String> {
        sqlx::query_scalar("SELECT value FROM record_identifier WHERE source_id = 'src' ORDER BY value")
            .fetch_all(db.pool())
            .await
            .unwrap()
    }

    async fn setup() -> Database {
        let db = Database::open_in_memory().await.unwrap();
        CursorStore::bootstrap(db.pool(), &SourceSpec::new("src", "https://example.org/oai"))
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn indexing_promotes_staged_payload_and_refreshes_identifiers() {
        let db = setup().await;
        persist(&db, "v1", UpsertMode::Enqueue).await;
        persist(&db, "v2", UpsertMode::Enqueue).await;
        assert_eq!(identifiers(&db).await, vec!["v1", "v2"]);
        assert_eq!(RecordStore::queued(db.pool(), "src", 10).await.unwrap().len(), 1);

        let indexer = RecordIndexer::new("src", db.clone(), Arc::new(by_metadata));
        let mut out = JobOutput::new();
        let stats = indexer.index(&CancellationToken::new(), &mut out).await.unwrap();
        assert_eq!(stats, IndexStats { indexed: 1, skipped: 0 });
        assert!(out.as_str().contains("Indexed 1 records, 0 skipped."));

        let rec = RecordStore::get(db.pool(), "src", "r1").await.unwrap().unwrap();
        assert!(rec.queued_at.is_none());
        assert!(rec.new_payload.is_none());
        assert_eq!(rec.payload, "v2");
        assert_eq!(identifiers(&db).await, vec!["v2"]);
        assert!(RecordStore::queued(db.pool(), "src", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overwrite_records_are_not_queued() {
        let db = setup().await;
        persist(&db, "v1", UpsertMode::Overwrite).await;
        let indexer = RecordIndexer::new("src", db.clone(), Arc::new(by_metadata));
        let stats = indexer.index(&CancellationToken::new(), &mut JobOutput::new()).await.unwrap();
        assert_eq!(stats, IndexStats::default());
    }

    #[tokio::test]
    async fn broken_records_are_dequeued_and_reported() {
        let db = setup().await;
        persist(&db, "v1", UpsertMode::Enqueue).await;
        persist(&db, "BROKEN", UpsertMode::Enqueue).await;

        let indexer = RecordIndexer::new("src", db.clone(), Arc::new(by_metadata)).with_batch_size(1);
        let mut out = JobOutput::new();
        let stats = indexer.index(&CancellationToken::new(), &mut out).await.unwrap();
        assert_eq!(stats, IndexStats { indexed: 0, skipped: 1 });
        assert!(out.as_str().contains("record r1: malformed metadata: unreadable"));

        let rec = RecordStore::get(db.pool(), "src", "r1").await.unwrap().unwrap();
        assert!(rec.queued_at.is_none());
        assert_eq!(rec.new_payload.as_deref(), Some("BROKEN"));
    }

    #[tokio::test]
    async fn cancelled_before_start_leaves_queue() {
        let db = setup().await;
        persist(&db, "v1", UpsertMode::Enqueue).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let indexer = RecordIndexer::new("src", db.clone(), Arc::new(by_metadata));
        let err = indexer.index(&cancel, &mut JobOutput::new()).await.unwrap_err();
        assert!(matches!(err, HarvestError::Canceled));
        assert_eq!(RecordStore::queued(db.pool(), "src", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn runs_as_a_job() {
        let db = setup().await;
        persist(&db, "v1", UpsertMode::Enqueue).await;

        let runner = Runner::new(db.clone());
        runner
            .register(Arc::new(RecordIndexer::new("src", db.clone(), Arc::new(by_metadata))))
            .unwrap();
        let handle = runner.run_job("oai_indexer:src").await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), JobStatus::Ok);
        assert!(RecordStore::queued(db.pool(), "src", 10).await.unwrap().is_empty());
    }
}
