//! Persistence for source cursors and harvested records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use bibsync_core::DerivedRecord;

use crate::sources::SourceSpec;

// ── Cursor ───────────────────────────────────────────────────────────

/// Sync state of one source. An empty `token` means the last pass completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct SourceCursor {
    pub id: String,
    pub token: String,
    pub in_sync_at: Option<DateTime<Utc>>,
}

pub struct CursorStore;

impl CursorStore {
    /// Insert the source row if missing (refreshing its descriptive columns)
    /// and return the stored cursor.
    pub async fn bootstrap(pool: &SqlitePool, spec: &SourceSpec) -> Result<SourceCursor, sqlx::Error> {
        sqlx::query_as::<_, SourceCursor>(
            "INSERT INTO source (id, url, dataset, prefix)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE
                SET url = excluded.url, dataset = excluded.dataset, prefix = excluded.prefix
             RETURNING id, token, in_sync_at",
        )
        .bind(&spec.id)
        .bind(&spec.endpoint)
        .bind(spec.set.as_deref().unwrap_or(""))
        .bind(&spec.prefix)
        .fetch_one(pool)
        .await
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<SourceCursor>, sqlx::Error> {
        sqlx::query_as::<_, SourceCursor>("SELECT id, token, in_sync_at FROM source WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Store the token returned with the last persisted page. An empty token
    /// stamps `in_sync_at`; a non-empty one clears it.
    pub async fn update(
        conn: &mut SqliteConnection,
        id: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let in_sync_at = token.is_empty().then_some(now);
        sqlx::query("UPDATE source SET token = ?, in_sync_at = ? WHERE id = ?")
            .bind(token)
            .bind(in_sync_at)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }
}

// ── Records ──────────────────────────────────────────────────────────

/// How an upsert treats a row that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpsertMode {
    /// Replace `payload` in place.
    #[default]
    Overwrite,
    /// Keep `payload`; stage the new one in `new_payload` and set `queued_at`.
    Enqueue,
}

const UPSERT_OVERWRITE: &str = "
    INSERT INTO record (source_id, id, type, label, payload, created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (source_id, id) DO UPDATE
        SET type = excluded.type,
            label = excluded.label,
            payload = excluded.payload,
            updated_at = excluded.updated_at,
            archived_at = NULL";

const UPSERT_ENQUEUE: &str = "
    INSERT INTO record (source_id, id, type, label, payload, created_at, updated_at, queued_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (source_id, id) DO UPDATE
        SET type = excluded.type,
            label = excluded.label,
            new_payload = excluded.payload,
            updated_at = excluded.updated_at,
            archived_at = NULL,
            queued_at = excluded.queued_at";

/// A stored harvested record.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StoredRecord {
    pub source_id: String,
    pub id: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub label: String,
    pub payload: String,
    pub new_payload: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
}

const RECORD_COLUMNS: &str = "source_id, id, type, label, payload, new_payload, created_at, updated_at, archived_at, queued_at";

pub struct RecordStore;

impl RecordStore {
    /// Write upserts, archives and identifier mappings and return the number
    /// of rows archived. Run inside a transaction so the batch lands
    /// atomically.
    pub async fn persist_batch(
        conn: &mut SqliteConnection,
        source_id: &str,
        upserts: &[DerivedRecord],
        archives: &[DerivedRecord],
        mode: UpsertMode,
        now: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        for rec in upserts {
            let query = match mode {
                UpsertMode::Overwrite => sqlx::query(UPSERT_OVERWRITE),
                UpsertMode::Enqueue => sqlx::query(UPSERT_ENQUEUE),
            };
            let query = query
                .bind(source_id)
                .bind(&rec.id)
                .bind(rec.kind.as_str())
                .bind(&rec.label)
                .bind(&rec.payload)
                .bind(now)
                .bind(now);
            let query = match mode {
                UpsertMode::Overwrite => query,
                UpsertMode::Enqueue => query.bind(now),
            };
            query.execute(&mut *conn).await?;
        }

        // Archives always run after every upsert of the batch, so a record
        // both re-added and deleted within one batch ends archived.
        // Unknown ids match nothing, so tombstones for unseen records are no-ops.
        let mut archived = 0;
        for rec in archives {
            archived += sqlx::query(
                "UPDATE record SET archived_at = ?, updated_at = ?, queued_at = ?
                 WHERE source_id = ? AND id = ?",
            )
            .bind(rec.archived_at.unwrap_or(now))
            .bind(now)
            .bind(now)
            .bind(source_id)
            .bind(&rec.id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        }

        for rec in upserts {
            for ident in &rec.identifiers {
                sqlx::query(
                    "INSERT OR IGNORE INTO record_identifier (source_id, record_id, scheme, value)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(source_id)
                .bind(&rec.id)
                .bind(&ident.scheme)
                .bind(&ident.value)
                .execute(&mut *conn)
                .await?;
            }
        }
        Ok(archived)
    }

    pub async fn get(pool: &SqlitePool, source_id: &str, id: &str) -> Result<Option<StoredRecord>, sqlx::Error> {
        sqlx::query_as::<_, StoredRecord>(&format!(
            "SELECT {} FROM record WHERE source_id = ? AND id = ?",
            RECORD_COLUMNS
        ))
        .bind(source_id)
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Live records carrying an external identifier, newest first.
    pub async fn find_by_identifier(
        pool: &SqlitePool,
        scheme: &str,
        value: &str,
    ) -> Result<Vec<StoredRecord>, sqlx::Error> {
        sqlx::query_as::<_, StoredRecord>(
            "SELECT r.source_id, r.id, r.type, r.label, r.payload, r.new_payload,
                    r.created_at, r.updated_at, r.archived_at, r.queued_at
             FROM record r
             JOIN record_identifier ri ON ri.source_id = r.source_id AND ri.record_id = r.id
             WHERE ri.scheme = ? AND ri.value = ? AND r.archived_at IS NULL
             ORDER BY r.updated_at DESC",
        )
        .bind(scheme)
        .bind(value)
        .fetch_all(pool)
        .await
    }

    /// Live records of a source waiting for re-indexing, oldest queued first.
    pub async fn queued(pool: &SqlitePool, source_id: &str, limit: usize) -> Result<Vec<StoredRecord>, sqlx::Error> {
        sqlx::query_as::<_, StoredRecord>(&format!(
            "SELECT {} FROM record
             WHERE source_id = ? AND archived_at IS NULL AND queued_at IS NOT NULL
             ORDER BY queued_at, id
             LIMIT ?",
            RECORD_COLUMNS
        ))
        .bind(source_id)
        .bind(limit as i64)
        .fetch_all(pool)
        .await
    }

    /// Promote a staged `new_payload`, take type and label from `rec`,
    /// replace the record's identifiers with `rec.identifiers` and take the
    /// record off the queue.
    pub async fn reindex(conn: &mut SqliteConnection, source_id: &str, rec: &DerivedRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE record
                SET type = ?, label = ?, payload = COALESCE(new_payload, payload),
                    new_payload = NULL, queued_at = NULL
              WHERE source_id = ? AND id = ?",
        )
        .bind(rec.kind.as_str())
        .bind(&rec.label)
        .bind(source_id)
        .bind(&rec.id)
        .execute(&mut *conn)
        .await?;

        sqlx::query("DELETE FROM record_identifier WHERE source_id = ? AND record_id = ?")
            .bind(source_id)
            .bind(&rec.id)
            .execute(&mut *conn)
            .await?;
        for ident in &rec.identifiers {
            sqlx::query(
                "INSERT OR IGNORE INTO record_identifier (source_id, record_id, scheme, value)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(source_id)
            .bind(&rec.id)
            .bind(&ident.scheme)
            .bind(&ident.value)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Take a record off the queue without touching its data.
    pub async fn dequeue(conn: &mut SqliteConnection, source_id: &str, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE record SET queued_at = NULL WHERE source_id = ? AND id = ?")
            .bind(source_id)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// `(live, archived)` record counts for a source.
    pub async fn counts(pool: &SqlitePool, source_id: &str) -> Result<(i64, i64), sqlx::Error> {
        sqlx::query_as::<_, (i64, i64)>(
            "SELECT COALESCE(SUM(archived_at IS NULL), 0), COALESCE(SUM(archived_at IS NOT NULL), 0)
             FROM record WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_one(pool)
        .await
    }
}
