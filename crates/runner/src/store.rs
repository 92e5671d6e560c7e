//! Persistence for `job_run` and `job_schedule`.
//!
//! Both stores are stateless unit structs whose methods take the pool.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use bibsync_core::Error;

use crate::model::{JobRun, JobStatus, Schedule};

const JOB_RUN_COLUMNS: &str = "id, name, start_at, stop_at, status, output";

// ── Job runs ─────────────────────────────────────────────────────────

pub struct JobRunStore;

impl JobRunStore {
    /// Insert a row in `running` state and return its id.
    pub async fn insert_running(
        pool: &SqlitePool,
        name: &str,
        start_at: DateTime<Utc>,
    ) -> Result<i64, Error> {
        let id = sqlx::query_scalar(
            "INSERT INTO job_run (name, start_at, status, output)
             VALUES (?, ?, 'running', '')
             RETURNING id",
        )
        .bind(name)
        .bind(start_at)
        .fetch_one(pool)
        .await?;
        Ok(id)
    }

    /// Record the terminal state of a run. Only a `running` row can be finished.
    pub async fn finish(
        pool: &SqlitePool,
        id: i64,
        status: JobStatus,
        output: &str,
        stop_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE job_run SET stop_at = ?, status = ?, output = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(stop_at)
        .bind(status)
        .bind(output)
        .bind(id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("running job_run {}", id)));
        }
        Ok(())
    }

    /// Force every `running` row to `crashed`, stamping `stop_at`.
    pub async fn mark_crashed(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE job_run SET status = 'crashed', stop_at = ? WHERE status = 'running'",
        )
        .bind(now)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Most recent runs first.
    pub async fn list(pool: &SqlitePool, limit: u32) -> Result<Vec<JobRun>, Error> {
        let rows = sqlx::query_as::<_, JobRun>(&format!(
            "SELECT {} FROM job_run ORDER BY id DESC LIMIT ?",
            JOB_RUN_COLUMNS
        ))
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn get(pool: &SqlitePool, id: i64) -> Result<JobRun, Error> {
        sqlx::query_as::<_, JobRun>(&format!(
            "SELECT {} FROM job_run WHERE id = ?",
            JOB_RUN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found(format!("job_run {}", id)))
    }
}

// ── Schedules ────────────────────────────────────────────────────────

pub struct ScheduleStore;

impl ScheduleStore {
    pub async fn insert(pool: &SqlitePool, name: &str, cron: &str) -> Result<Schedule, Error> {
        let row = sqlx::query_as::<_, Schedule>(
            "INSERT INTO job_schedule (name, cron) VALUES (?, ?) RETURNING id, name, cron",
        )
        .bind(name)
        .bind(cron)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }

    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<(), Error> {
        let result = sqlx::query("DELETE FROM job_schedule WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("schedule {}", id)));
        }
        Ok(())
    }

    /// Newest schedules first.
    pub async fn list(pool: &SqlitePool) -> Result<Vec<Schedule>, Error> {
        let rows = sqlx::query_as::<_, Schedule>(
            "SELECT id, name, cron FROM job_schedule ORDER BY id DESC",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}
