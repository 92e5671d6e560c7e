//! Persistence for the entity graph: `entity`, `entity_identifier`, `link`
//! and `review`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use bibsync_core::{CandidateEntity, EntityData, EntityKind, Error, ExternalId};

/// A persisted entity row.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StoredEntity {
    pub id: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub label: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl StoredEntity {
    pub fn data(&self) -> Result<EntityData, Error> {
        let kind: EntityKind = self.kind.parse()?;
        EntityData::decode(kind, &self.payload)
    }
}

/// A persisted link row. `to_id` is `None` while the target is pending.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct StoredLink {
    pub id: i64,
    pub from_id: String,
    pub to_id: Option<String>,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub payload: String,
    pub queued_at: Option<DateTime<Utc>>,
}

impl StoredLink {
    pub fn payload_json(&self) -> Result<serde_json::Value, Error> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

pub struct EntityStore;

impl EntityStore {
    /// The entity holding `(scheme, value)`, live entities first.
    pub async fn lookup_identifier(
        conn: &mut SqliteConnection,
        id: &ExternalId,
    ) -> Result<Option<String>, Error> {
        let found = sqlx::query_scalar(
            "SELECT ei.entity_id
             FROM entity_identifier ei JOIN entity e ON e.id = ei.entity_id
             WHERE ei.scheme = ? AND ei.value = ?
             ORDER BY e.archived_at IS NOT NULL, e.created_at
             LIMIT 1",
        )
        .bind(&id.scheme)
        .bind(&id.value)
        .fetch_optional(conn)
        .await?;
        Ok(found)
    }

    pub async fn exists(conn: &mut SqliteConnection, id: &str) -> Result<bool, Error> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM entity WHERE id = ?")
            .bind(id)
            .fetch_optional(conn)
            .await?;
        Ok(found.is_some())
    }

    /// Insert or refresh an entity and its identifiers. A refreshed entity
    /// is un-archived.
    pub async fn upsert(
        conn: &mut SqliteConnection,
        entity: &CandidateEntity,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let payload = serde_json::to_string(&entity.data)?;
        sqlx::query(
            "INSERT INTO entity (id, type, label, payload, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE
                SET type = excluded.type,
                    label = excluded.label,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at,
                    archived_at = NULL",
        )
        .bind(&entity.id)
        .bind(entity.kind().as_str())
        .bind(&entity.label)
        .bind(payload)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        for ident in &entity.identifiers {
            sqlx::query(
                "INSERT OR IGNORE INTO entity_identifier (entity_id, scheme, value) VALUES (?, ?, ?)",
            )
            .bind(&entity.id)
            .bind(&ident.scheme)
            .bind(&ident.value)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Insert a link unless an identical one exists. Returns whether a row
    /// was written.
    pub async fn insert_link(
        conn: &mut SqliteConnection,
        from_id: &str,
        to_id: Option<&str>,
        kind: &str,
        payload: &serde_json::Value,
        queued_at: Option<DateTime<Utc>>,
    ) -> Result<bool, Error> {
        let payload = serde_json::to_string(payload)?;
        let dup: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM link WHERE from_id = ? AND to_id IS ? AND type = ? AND payload = ? LIMIT 1",
        )
        .bind(from_id)
        .bind(to_id)
        .bind(kind)
        .bind(&payload)
        .fetch_optional(&mut *conn)
        .await?;
        if dup.is_some() {
            return Ok(false);
        }

        sqlx::query("INSERT INTO link (from_id, to_id, type, payload, queued_at) VALUES (?, ?, ?, ?, ?)")
            .bind(from_id)
            .bind(to_id)
            .bind(kind)
            .bind(payload)
            .bind(queued_at)
            .execute(&mut *conn)
            .await?;
        Ok(true)
    }

    /// Queue a side record for review unless an identical one exists.
    pub async fn insert_review(
        conn: &mut SqliteConnection,
        from_id: &str,
        kind: &str,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let payload = serde_json::to_string(payload)?;
        let result = sqlx::query(
            "INSERT INTO review (from_id, type, payload, queued_at)
             SELECT ?, ?, ?, ?
             WHERE NOT EXISTS (SELECT 1 FROM review WHERE from_id = ? AND type = ? AND payload = ?)",
        )
        .bind(from_id)
        .bind(kind)
        .bind(&payload)
        .bind(now)
        .bind(from_id)
        .bind(kind)
        .bind(&payload)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<StoredEntity>, Error> {
        let row = sqlx::query_as::<_, StoredEntity>(
            "SELECT id, type, label, payload, created_at, updated_at, archived_at FROM entity WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn has_identifier(pool: &SqlitePool, id: &ExternalId) -> Result<bool, Error> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM entity_identifier WHERE scheme = ? AND value = ? LIMIT 1")
                .bind(&id.scheme)
                .bind(&id.value)
                .fetch_optional(pool)
                .await?;
        Ok(found.is_some())
    }

    pub async fn links_from(pool: &SqlitePool, from_id: &str) -> Result<Vec<StoredLink>, Error> {
        let rows = sqlx::query_as::<_, StoredLink>(
            "SELECT id, from_id, to_id, type, payload, queued_at FROM link WHERE from_id = ? ORDER BY id",
        )
        .bind(from_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn count(pool: &SqlitePool) -> Result<i64, Error> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM entity").fetch_one(pool).await?)
    }

    pub async fn pending_links(pool: &SqlitePool) -> Result<i64, Error> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM link WHERE to_id IS NULL")
            .fetch_one(pool)
            .await?)
    }
}
