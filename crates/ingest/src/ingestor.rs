//! The ingestion merger: dedups candidate entities against the stored graph
//! and persists what survives in one transaction.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::SqliteConnection;
use tracing::{debug, info};

use bibsync_core::{
    CandidateEntity, DerivedRecord, Error, ExternalId, Ingestion, LinkTarget, RawRecord,
};
use bibsync_harvest::{RecordStore, Transform};
use bibsync_storage::Database;

use crate::store::EntityStore;

/// What one `ingest` call wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Entities inserted or refreshed.
    pub inserted: usize,
    /// Candidates dropped in favour of an existing entity.
    pub merged: usize,
    pub links: usize,
    /// Links stored without a target, waiting for the janitor.
    pub pending_links: usize,
    pub reviews: usize,
}

#[derive(Clone)]
pub struct Ingestor {
    db: Database,
}

impl Ingestor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Merge `ingestion` into the entity graph.
    ///
    /// Non-primary candidates whose identifiers match a stored entity (or an
    /// earlier candidate of the same batch) are dropped and every reference
    /// to them is rewritten. Links whose target cannot be found are stored
    /// with a `resolve` payload. Nothing is persisted if any step fails.
    pub async fn ingest(&self, ingestion: Ingestion) -> Result<IngestReport, Error> {
        let now = Utc::now();
        let report = self
            .db
            .transaction(move |tx| Box::pin(async move { merge(&mut **tx, ingestion, now).await }))
            .await?;
        info!(
            inserted = report.inserted,
            merged = report.merged,
            links = report.links,
            pending_links = report.pending_links,
            reviews = report.reviews,
            "ingestion persisted"
        );
        Ok(report)
    }

    /// Derive an ingestion from a locally harvested record carrying
    /// `(scheme, value)`, without persisting anything.
    pub async fn preview_identifier(
        &self,
        id: &ExternalId,
        transform: &dyn Transform,
    ) -> Result<DerivedRecord, Error> {
        let rec = RecordStore::find_by_identifier(self.db.pool(), &id.scheme, &id.value)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("harvested record with identifier {}", id)))?;

        let raw = RawRecord {
            identifier: rec.id,
            datestamp: rec.updated_at.to_rfc3339(),
            deleted: false,
            metadata: rec.payload,
        };
        let derived = transform
            .transform(&raw)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        if derived.is_archived() || derived.ingestion.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "record {} has nothing to ingest",
                raw.identifier
            )));
        }
        Ok(derived)
    }

    /// Ingest the harvested record carrying `(scheme, value)`. Fails with
    /// `Conflict` when an entity already holds that identifier.
    pub async fn ingest_identifier(
        &self,
        scheme: &str,
        value: &str,
        transform: &dyn Transform,
    ) -> Result<IngestReport, Error> {
        let id = ExternalId::new(scheme, value);
        if EntityStore::has_identifier(self.db.pool(), &id).await? {
            return Err(Error::Conflict(format!("an entity with identifier {} already exists", id)));
        }
        let derived = self.preview_identifier(&id, transform).await?;
        debug!(identifier = %id, record = %derived.id, "ingesting harvested record");
        self.ingest(derived.ingestion).await
    }
}

/// The resolution pass plus all writes, on one connection.
async fn merge(
    conn: &mut SqliteConnection,
    ingestion: Ingestion,
    now: DateTime<Utc>,
) -> Result<IngestReport, Error> {
    let Ingestion {
        entities,
        links,
        side_records,
    } = ingestion;
    let mut report = IngestReport::default();

    let mut rewrites: HashMap<String, String> = HashMap::new();
    let mut batch_idents: HashMap<ExternalId, String> = HashMap::new();
    let mut survivors: Vec<CandidateEntity> = Vec::new();

    for cand in entities {
        if !cand.primary {
            if let Some(existing) = find_existing(conn, &cand, &batch_idents).await? {
                debug!(candidate = %cand.id, entity = %existing, "candidate merged");
                rewrites.insert(cand.id, existing);
                report.merged += 1;
                continue;
            }
        }
        for ident in &cand.identifiers {
            batch_idents
                .entry(ident.clone())
                .or_insert_with(|| cand.id.clone());
        }
        survivors.push(cand);
    }

    let survivor_ids: HashSet<String> = survivors.iter().map(|c| c.id.clone()).collect();
    for cand in &survivors {
        EntityStore::upsert(conn, cand, now).await?;
        report.inserted += 1;
    }

    for link in links {
        let from = resolve_source(conn, &link.from, &rewrites, &survivor_ids).await?;
        let (to, resolve) = match &link.to {
            LinkTarget::Entity(id) => {
                if let Some(existing) = rewrites.get(id) {
                    (Some(existing.clone()), None)
                } else if survivor_ids.contains(id) || EntityStore::exists(conn, id).await? {
                    (Some(id.clone()), None)
                } else {
                    (None, Some(json!({ "id": id })))
                }
            }
            LinkTarget::Identifier(ext) => match batch_idents.get(ext) {
                Some(id) => (Some(id.clone()), None),
                None => match EntityStore::lookup_identifier(conn, ext).await? {
                    Some(id) => (Some(id), None),
                    None => (None, Some(json!({ "scheme": ext.scheme, "value": ext.value }))),
                },
            },
        };

        let mut payload = link.payload;
        let queued_at = match resolve {
            Some(resolve) => {
                attach_resolve(&mut payload, resolve);
                Some(now)
            }
            None => None,
        };
        if EntityStore::insert_link(conn, &from, to.as_deref(), &link.kind, &payload, queued_at).await? {
            report.links += 1;
            if to.is_none() {
                report.pending_links += 1;
            }
        }
    }

    for side in side_records {
        let from = resolve_source(conn, &side.from, &rewrites, &survivor_ids).await?;
        if EntityStore::insert_review(conn, &from, &side.kind, &side.payload, now).await? {
            report.reviews += 1;
        }
    }

    Ok(report)
}

async fn find_existing(
    conn: &mut SqliteConnection,
    cand: &CandidateEntity,
    batch_idents: &HashMap<ExternalId, String>,
) -> Result<Option<String>, Error> {
    for ident in &cand.identifiers {
        if let Some(id) = batch_idents.get(ident) {
            return Ok(Some(id.clone()));
        }
        if let Some(id) = EntityStore::lookup_identifier(conn, ident).await? {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// The stored id a link or side record hangs off.
async fn resolve_source(
    conn: &mut SqliteConnection,
    id: &str,
    rewrites: &HashMap<String, String>,
    survivors: &HashSet<String>,
) -> Result<String, Error> {
    if let Some(existing) = rewrites.get(id) {
        return Ok(existing.clone());
    }
    if survivors.contains(id) || EntityStore::exists(conn, id).await? {
        return Ok(id.to_string());
    }
    Err(Error::InvalidArgument(format!("link from unknown entity '{}'", id)))
}

fn attach_resolve(payload: &mut serde_json::Value, resolve: serde_json::Value) {
    if payload.is_null() {
        *payload = json!({});
    }
    if !payload.is_object() {
        let value = payload.take();
        *payload = json!({ "value": value });
    }
    if let Some(map) = payload.as_object_mut() {
        map.insert("resolve".to_string(), resolve);
    }
}
