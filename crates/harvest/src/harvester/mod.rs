//! The harvester job: pages through a record source and persists the
//! derived records in batches, keeping the source cursor in step.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bibsync_core::{DerivedRecord, Error};
use bibsync_runner::{Job, JobOutput};
use bibsync_storage::Database;

use crate::error::HarvestError;
use crate::source::{ListRequest, Page, RecordSource};
use crate::sources::SourceSpec;
use crate::store::{CursorStore, RecordStore, SourceCursor, UpsertMode};
use crate::transform::Transform;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Counters for one harvest pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HarvestStats {
    pub pages: usize,
    pub upserted: usize,
    pub archived: usize,
    pub skipped: usize,
}

/// Pending writes, flushed as one transaction.
#[derive(Debug, Default)]
struct Batch {
    upserts: Vec<DerivedRecord>,
    archives: Vec<DerivedRecord>,
}

impl Batch {
    fn push(&mut self, rec: DerivedRecord) {
        if rec.is_archived() {
            self.archives.push(rec);
        } else {
            self.upserts.push(rec);
        }
    }

    fn len(&self) -> usize {
        self.upserts.len() + self.archives.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Harvester {
    spec: SourceSpec,
    name: String,
    db: Database,
    source: Arc<dyn RecordSource>,
    transform: Arc<dyn Transform>,
}

impl Harvester {
    pub fn new(
        spec: SourceSpec,
        db: Database,
        source: Arc<dyn RecordSource>,
        transform: Arc<dyn Transform>,
    ) -> Self {
        Self {
            name: spec.job_name(),
            spec,
            db,
            source,
            transform,
        }
    }

    pub fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    fn batch_size(&self) -> usize {
        self.spec.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1)
    }

    fn upsert_mode(&self) -> UpsertMode {
        if self.spec.enqueue {
            UpsertMode::Enqueue
        } else {
            UpsertMode::Overwrite
        }
    }

    /// The first request of a pass, from the stored cursor.
    fn initial_request(&self, cursor: &SourceCursor) -> ListRequest {
        if !cursor.token.is_empty() {
            return ListRequest::Resume {
                token: cursor.token.clone(),
            };
        }
        let from: Option<NaiveDate> = cursor
            .in_sync_at
            .map(|t| t.date_naive())
            .or(self.spec.start_at);
        ListRequest::Initial {
            prefix: self.spec.prefix.clone(),
            set: self.spec.set.clone(),
            from,
        }
    }

    /// Run one full pass: until the source returns an empty token.
    pub async fn harvest(
        &self,
        cancel: &CancellationToken,
        out: &mut JobOutput,
    ) -> Result<HarvestStats, HarvestError> {
        let cursor = CursorStore::bootstrap(self.db.pool(), &self.spec).await?;
        let mut request = self.initial_request(&cursor);
        match &request {
            ListRequest::Resume { token } => out.line(format!(
                "Starting harvesting from {} using resumptionToken={}",
                self.spec.endpoint, token
            )),
            ListRequest::Initial { from, .. } => out.line(format!(
                "Starting harvesting from {} requesting records updated since {}",
                self.spec.endpoint,
                from.map(|d| d.to_string()).unwrap_or_else(|| "the beginning".to_string())
            )),
        }
        info!(job = %self.name, source = %self.spec.id, request = ?request, "harvest started");

        let mut stats = HarvestStats::default();
        loop {
            if cancel.is_cancelled() {
                return Err(HarvestError::Canceled);
            }
            let page = tokio::select! {
                _ = cancel.cancelled() => return Err(HarvestError::Canceled),
                page = self.source.list_records(&request) => page?,
            };
            stats.pages += 1;
            debug!(source = %self.spec.id, records = page.records.len(), token = %page.token, "page fetched");

            self.apply_page(&page, cancel, out, &mut stats).await?;

            if page.is_last() {
                break;
            }
            request = ListRequest::Resume { token: page.token };
        }

        out.line(format!(
            "Done: {} new/updated records, {} archived, {} skipped.",
            stats.upserted, stats.archived, stats.skipped
        ));
        info!(
            job = %self.name,
            source = %self.spec.id,
            pages = stats.pages,
            upserted = stats.upserted,
            archived = stats.archived,
            skipped = stats.skipped,
            "harvest finished"
        );
        Ok(stats)
    }

    /// Transform and persist one page, then advance the cursor to the
    /// page's token together with the page's last batch.
    pub(crate) async fn apply_page(
        &self,
        page: &Page,
        cancel: &CancellationToken,
        out: &mut JobOutput,
        stats: &mut HarvestStats,
    ) -> Result<(), HarvestError> {
        let batch_size = self.batch_size();
        let mut batch = Batch::default();

        for raw in &page.records {
            match self.transform.transform(raw) {
                Ok(rec) => batch.push(rec),
                Err(e) => {
                    warn!(source = %self.spec.id, error = %e, "skipping record");
                    out.line(&e);
                    stats.skipped += 1;
                    continue;
                }
            }
            if batch.len() >= batch_size {
                let archived = self.persist(&batch, None).await?;
                count(&batch, archived, stats);
                out.push_str(".");
                batch = Batch::default();
                if cancel.is_cancelled() {
                    return Err(HarvestError::Canceled);
                }
            }
        }

        let archived = self.persist(&batch, Some(&page.token)).await?;
        count(&batch, archived, stats);
        if !batch.is_empty() {
            out.push_str(".");
        }
        Ok(())
    }

    /// Write `batch` (and the cursor, if given) in one transaction. Returns
    /// the number of records actually archived.
    async fn persist(&self, batch: &Batch, cursor_token: Option<&str>) -> Result<u64, HarvestError> {
        if batch.is_empty() && cursor_token.is_none() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let archived = RecordStore::persist_batch(
            &mut tx,
            &self.spec.id,
            &batch.upserts,
            &batch.archives,
            self.upsert_mode(),
            now,
        )
        .await?;
        if let Some(token) = cursor_token {
            CursorStore::update(&mut tx, &self.spec.id, token, now).await?;
        }
        tx.commit().await?;
        Ok(archived)
    }

    /// Fetch individual records by identifier and persist them. The cursor
    /// is left untouched.
    pub async fn update_records(&self, ids: &[String], out: &mut JobOutput) -> Result<HarvestStats, HarvestError> {
        CursorStore::bootstrap(self.db.pool(), &self.spec).await?;
        let mut batch = Batch::default();
        for id in ids {
            let raw = self
                .source
                .get_record(id, &self.spec.prefix)
                .await?
                .ok_or_else(|| Error::not_found(format!("record '{}' at {}", id, self.spec.endpoint)))?;
            let rec = self.transform.transform(&raw).map_err(|e| Error::InvalidArgument(e.to_string()))?;
            batch.push(rec);
        }
        let archived = self.persist(&batch, None).await?;

        let mut stats = HarvestStats::default();
        count(&batch, archived, &mut stats);
        out.line(format!("Updated {} records, {} archived.", stats.upserted, stats.archived));
        Ok(stats)
    }
}

/// Tombstones for records never stored do not count as archived.
fn count(batch: &Batch, archived: u64, stats: &mut HarvestStats) {
    stats.upserted += batch.upserts.len();
    stats.archived += archived as usize;
}

#[async_trait]
impl Job for Harvester {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: CancellationToken, out: &mut JobOutput) -> Result<(), Error> {
        self.harvest(&cancel, out).await?;
        Ok(())
    }
}
