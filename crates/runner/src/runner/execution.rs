use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bibsync_core::Error;

use crate::job::{Job, JobOutput};
use crate::model::JobStatus;
use crate::store::JobRunStore;

use super::core::Inner;

impl Inner {
    /// Spawn the execution of an already-inserted `running` row.
    ///
    /// `scheduled` runs hold their name in the running set until the terminal
    /// row is written.
    pub(super) fn spawn_execution(
        self: &Arc<Self>,
        job: Arc<dyn Job>,
        run_id: i64,
        scheduled: bool,
        done: Option<oneshot::Sender<JobStatus>>,
    ) -> Result<(), Error> {
        let cancel = self.runs_cancel.child_token();
        self.write_state()?.in_flight.insert(run_id, cancel.clone());

        let inner = self.clone();
        self.tracker.spawn(async move {
            let status = inner.execute(job.as_ref(), run_id, cancel, scheduled).await;
            if let Some(done) = done {
                // The caller may have dropped its handle.
                let _ = done.send(status);
            }
        });
        Ok(())
    }

    async fn execute(
        &self,
        job: &dyn Job,
        run_id: i64,
        cancel: CancellationToken,
        scheduled: bool,
    ) -> JobStatus {
        let name = job.name().to_string();
        let mut out = JobOutput::new();

        let result = AssertUnwindSafe(job.run(cancel, &mut out)).catch_unwind().await;
        let status = match result {
            Ok(Ok(())) => JobStatus::Ok,
            Ok(Err(e)) => {
                out.push_str(&format!("\nfailed with: {}", e));
                if e.is_canceled() {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Failed
                }
            }
            Err(_) => {
                out.push_str("\nfailed with: job panicked");
                JobStatus::Failed
            }
        };

        match JobRunStore::finish(self.db.pool(), run_id, status, out.as_str(), Utc::now()).await {
            Ok(()) => match status {
                JobStatus::Ok => info!(job = %name, run_id, "job finished"),
                _ => warn!(job = %name, run_id, status = %status, "job finished"),
            },
            Err(e) => error!(job = %name, run_id, error = %e, "failed to persist job result"),
        }

        match self.write_state() {
            Ok(mut state) => {
                state.in_flight.remove(&run_id);
                if scheduled {
                    state.running.remove(&name);
                }
            }
            Err(e) => error!(job = %name, run_id, error = %e, "failed to release run"),
        }
        status
    }
}
