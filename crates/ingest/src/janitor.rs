//! Periodic healing of pending links.
//!
//! A link stored before its target existed carries `payload.resolve`. Each
//! heal query below selects such links whose target can now be found into a
//! `candidates` CTE, then updates them from it. The queries are idempotent.

use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use bibsync_core::Error;
use bibsync_runner::{Job, JobOutput};
use bibsync_storage::Database;

pub const JANITOR_JOB: &str = "db_janitor";

struct HealQuery {
    description: &'static str,
    /// `WITH candidates AS (SELECT id, to_id ...)`
    candidates: &'static str,
    update: &'static str,
}

const RESOLVE_UPDATE: &str = "
    UPDATE link
       SET to_id = (SELECT c.to_id FROM candidates c WHERE c.id = link.id),
           payload = json_remove(payload, '$.resolve'),
           queued_at = NULL
     WHERE id IN (SELECT id FROM candidates)";

const HEAL_QUERIES: &[HealQuery] = &[
    HealQuery {
        description: "resolve pending links whose target id now exists",
        candidates: "
            WITH candidates AS (
                SELECT l.id, e.id AS to_id
                FROM link l JOIN entity e ON e.id = json_extract(l.payload, '$.resolve.id')
                WHERE l.to_id IS NULL
            )",
        update: RESOLVE_UPDATE,
    },
    HealQuery {
        description: "resolve pending links whose target identifier is now known",
        candidates: "
            WITH candidates AS (
                SELECT l.id, MIN(ei.entity_id) AS to_id
                FROM link l JOIN entity_identifier ei
                  ON ei.scheme = json_extract(l.payload, '$.resolve.scheme')
                 AND ei.value = json_extract(l.payload, '$.resolve.value')
                WHERE l.to_id IS NULL
                GROUP BY l.id
            )",
        update: RESOLVE_UPDATE,
    },
];

/// Counters for one janitor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealStats {
    pub candidates: u64,
    pub resolved: u64,
}

pub struct LinkJanitor {
    db: Database,
}

impl LinkJanitor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn heal(&self, cancel: &CancellationToken, out: &mut JobOutput) -> Result<HealStats, Error> {
        let mut stats = HealStats::default();
        for (i, q) in HEAL_QUERIES.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            out.line(format_args!("{}\t{}", i + 1, q.description));

            let n: i64 = sqlx::query_scalar(&format!("{} SELECT COUNT(*) FROM candidates", q.candidates))
                .fetch_one(self.db.pool())
                .await?;
            out.line(format_args!("\tnumber of candidates: {}", n));
            stats.candidates += n as u64;
            if n == 0 {
                continue;
            }

            let started = Instant::now();
            let sql = format!("{} {}", q.candidates, q.update);
            let resolved = self
                .db
                .transaction(|tx| {
                    Box::pin(async move {
                        let result = sqlx::query(&sql).execute(&mut **tx).await?;
                        Ok::<_, Error>(result.rows_affected())
                    })
                })
                .await?;
            stats.resolved += resolved;
            out.line(format_args!("\tOK, {} links updated in {:?}", resolved, started.elapsed()));
        }

        info!(
            job = JANITOR_JOB,
            candidates = stats.candidates,
            resolved = stats.resolved,
            "janitor pass finished"
        );
        Ok(stats)
    }
}

#[async_trait]
impl Job for LinkJanitor {
    fn name(&self) -> &str {
        JANITOR_JOB
    }

    async fn run(&self, cancel: CancellationToken, out: &mut JobOutput) -> Result<(), Error> {
        self.heal(&cancel, out).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bibsync_core::{CandidateEntity, CandidateLink, EntityData, ExternalId, Ingestion, LinkTarget, Named, Publication};
    use bibsync_runner::{JobStatus, Runner};
    use serde_json::json;

    use crate::{EntityStore, Ingestor};

    fn publication(id: &str) -> CandidateEntity {
        CandidateEntity::new(
            id,
            EntityData::Publication(Publication {
                title: id.to_uppercase(),
                ..Publication::default()
            }),
        )
        .primary()
    }

    /// A part referencing a series by ISSN and a sequel by id, both unknown yet.
    async fn forward_references(ig: &Ingestor) {
        ig.ingest(Ingestion {
            entities: vec![publication("part")],
            links: vec![
                CandidateLink::new("part", LinkTarget::Identifier(ExternalId::new("issn", "11112222")), "is_part_of"),
                CandidateLink::new("part", LinkTarget::Entity("sequel".into()), "followed_by"),
            ],
            ..Ingestion::default()
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn heals_forward_references_once_targets_exist() {
        let db = Database::open_in_memory().await.unwrap();
        let ig = Ingestor::new(db.clone());
        let janitor = LinkJanitor::new(db.clone());
        forward_references(&ig).await;

        // Nothing to resolve yet.
        let mut out = JobOutput::new();
        let stats = janitor.heal(&CancellationToken::new(), &mut out).await.unwrap();
        assert_eq!(stats, HealStats::default());
        assert_eq!(out.as_str().matches("number of candidates: 0").count(), 2);

        let series = CandidateEntity::new("series", EntityData::Series(Named { name: "Nordic".into() }))
            .primary()
            .with_identifier("issn", "11112222");
        ig.ingest(Ingestion {
            entities: vec![series, publication("sequel")],
            ..Ingestion::default()
        })
        .await
        .unwrap();

        let mut out = JobOutput::new();
        let stats = janitor.heal(&CancellationToken::new(), &mut out).await.unwrap();
        assert_eq!(stats, HealStats { candidates: 2, resolved: 2 });
        assert!(out.as_str().contains("1\tresolve pending links whose target id now exists"));

        let links = EntityStore::links_from(db.pool(), "part").await.unwrap();
        let targets: Vec<_> = links.iter().map(|l| l.to_id.as_deref()).collect();
        assert_eq!(targets, vec![Some("series"), Some("sequel")]);
        for link in &links {
            assert!(link.queued_at.is_none());
            assert_eq!(link.payload_json().unwrap(), json!({}));
        }

        // Second pass finds nothing.
        let again = janitor.heal(&CancellationToken::new(), &mut JobOutput::new()).await.unwrap();
        assert_eq!(again.resolved, 0);
        assert_eq!(EntityStore::pending_links(db.pool()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_pass_changes_nothing() {
        let db = Database::open_in_memory().await.unwrap();
        let ig = Ingestor::new(db.clone());
        forward_references(&ig).await;
        ig.ingest(Ingestion { entities: vec![publication("sequel")], ..Ingestion::default() })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = LinkJanitor::new(db.clone()).heal(&cancel, &mut JobOutput::new()).await.unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(EntityStore::pending_links(db.pool()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn runs_as_db_janitor_job() {
        let db = Database::open_in_memory().await.unwrap();
        let runner = Runner::new(db.clone());
        runner.register(Arc::new(LinkJanitor::new(db.clone()))).unwrap();

        let handle = runner.run_job("db_janitor").await.unwrap();
        let id = handle.id;
        assert_eq!(handle.wait().await.unwrap(), JobStatus::Ok);
        let run = runner.get_job_run(id).await.unwrap();
        assert!(run.output.starts_with("1\tresolve pending links"));
    }
}
