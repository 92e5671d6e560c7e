use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use bibsync_core::Error;

use crate::cron::until_next_fire;
use crate::model::Schedule;
use crate::store::JobRunStore;

use super::core::Inner;

/// A timer fire, consumed by the dispatcher.
#[derive(Debug)]
pub(super) struct RunRequest {
    pub(super) name: String,
    pub(super) schedule_id: i64,
}

impl Inner {
    /// Arm (or re-arm) the timer for `schedule`.
    ///
    /// The timer only sends run requests; it never touches runner state.
    pub(super) fn register_timer(&self, schedule: &Schedule, parsed: cron::Schedule) -> Result<(), Error> {
        let token = self.shutdown.child_token();
        let previous = self
            .timers
            .lock()
            .map_err(|_| Error::internal("runner timer lock poisoned"))?
            .insert(schedule.id, token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let requests = self.requests.clone();
        let name = schedule.name.clone();
        let schedule_id = schedule.id;
        self.tracker.spawn(async move {
            loop {
                let Some(wait) = until_next_fire(&parsed, Utc::now()) else {
                    debug!(schedule_id, "schedule has no further fire times");
                    break;
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                let request = RunRequest { name: name.clone(), schedule_id };
                if requests.send(request).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    pub(super) fn cancel_timer(&self, schedule_id: i64) -> Result<(), Error> {
        let token = self
            .timers
            .lock()
            .map_err(|_| Error::internal("runner timer lock poisoned"))?
            .remove(&schedule_id);
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }

    /// Single consumer of run requests. Serializes the overlap check and the
    /// transition into `running` for scheduled runs.
    pub(super) async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<RunRequest>) {
        loop {
            let request = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            if let Err(e) = self.dispatch(&request).await {
                error!(job = %request.name, schedule_id = request.schedule_id, error = %e, "scheduled dispatch failed");
            }
        }
        debug!("dispatcher stopped");
    }

    async fn dispatch(self: &Arc<Self>, request: &RunRequest) -> Result<(), Error> {
        // Overlap check and claim of the name in one critical section.
        let job = {
            let mut state = self.write_state()?;
            let Some(job) = state.jobs.get(&request.name).cloned() else {
                warn!(job = %request.name, schedule_id = request.schedule_id, "scheduled job is not registered, skipping");
                return Ok(());
            };
            if !state.running.insert(request.name.clone()) {
                warn!(job = %request.name, schedule_id = request.schedule_id, "previous run still in progress, skipping trigger");
                return Ok(());
            }
            job
        };

        let run_id = match JobRunStore::insert_running(self.db.pool(), &request.name, Utc::now()).await {
            Ok(id) => id,
            Err(e) => {
                self.write_state()?.running.remove(&request.name);
                return Err(e);
            }
        };

        if let Err(e) = self.spawn_execution(job, run_id, true, None) {
            self.write_state()?.running.remove(&request.name);
            return Err(e);
        }
        info!(job = %request.name, run_id, schedule_id = request.schedule_id, trigger = "scheduled", "job started");
        Ok(())
    }
}
