use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tokio::sync::oneshot;

use bibsync_core::Error;

/// Status of a job run. Every status except `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Ok,
    Failed,
    Cancelled,
    Crashed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Ok => "ok",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Crashed => "crashed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `job_run`.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct JobRun {
    pub id: i64,
    pub name: String,
    pub start_at: DateTime<Utc>,
    pub stop_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub output: String,
}

/// One row of `job_schedule`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Schedule {
    pub id: i64,
    pub name: String,
    pub cron: String,
}

/// Returned by [`Runner::run_job`](crate::Runner::run_job).
#[derive(Debug)]
pub struct RunHandle {
    pub id: i64,
    pub done: oneshot::Receiver<JobStatus>,
}

impl RunHandle {
    /// Wait for the run to reach its terminal status.
    pub async fn wait(self) -> Result<JobStatus, Error> {
        self.done
            .await
            .map_err(|_| Error::internal(format!("run {} finished without reporting a status", self.id)))
    }
}
