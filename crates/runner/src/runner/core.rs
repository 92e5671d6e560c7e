use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use bibsync_core::Error;
use bibsync_storage::Database;

use crate::cron::parse_cron;
use crate::job::Job;
use crate::model::{JobRun, RunHandle, Schedule};
use crate::store::{JobRunStore, ScheduleStore};

use super::dispatch::RunRequest;

/// The job runner. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Runner {
    pub(super) inner: Arc<Inner>,
}

pub(super) struct Inner {
    pub(super) db: Database,
    /// Job registry and running bookkeeping, behind one reader/writer lock.
    pub(super) state: RwLock<RunnerState>,
    pub(super) requests: mpsc::UnboundedSender<RunRequest>,
    /// Taken by `start()`; the dispatcher owns it afterwards.
    pub(super) request_rx: Mutex<Option<mpsc::UnboundedReceiver<RunRequest>>>,
    /// Live timer per schedule id.
    pub(super) timers: Mutex<HashMap<i64, CancellationToken>>,
    /// Cancels timers and the dispatcher.
    pub(super) shutdown: CancellationToken,
    /// Parent of every run's cancellation token.
    pub(super) runs_cancel: CancellationToken,
    pub(super) tracker: TaskTracker,
    pub(super) started: AtomicBool,
}

#[derive(Default)]
pub(super) struct RunnerState {
    pub(super) jobs: HashMap<String, Arc<dyn Job>>,
    /// Names with a scheduled execution in flight.
    pub(super) running: HashSet<String>,
    /// Cancellation token per in-flight run id (scheduled and ad-hoc).
    pub(super) in_flight: HashMap<i64, CancellationToken>,
}

/// Resolves once every execution dispatched before `stop()` has finished.
pub struct ShutdownHandle {
    tracker: TaskTracker,
}

impl ShutdownHandle {
    pub async fn wait(self) {
        self.tracker.wait().await;
    }

    /// Wait up to `timeout`; returns `false` if executions are still running.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok()
    }
}

impl Runner {
    pub fn new(db: Database) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                db,
                state: RwLock::new(RunnerState::default()),
                requests: tx,
                request_rx: Mutex::new(Some(rx)),
                timers: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                runs_cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    // ── Registry ─────────────────────────────────────────────────────

    /// Add a job under its name, replacing any job already registered there.
    pub fn register(&self, job: Arc<dyn Job>) -> Result<(), Error> {
        let name = job.name().to_string();
        let replaced = self.inner.write_state()?.jobs.insert(name.clone(), job).is_some();
        info!(job = %name, replaced, "registered job");
        Ok(())
    }

    /// Registered job names, sorted.
    pub fn job_names(&self) -> Result<Vec<String>, Error> {
        let mut names: Vec<String> = self.inner.read_state()?.jobs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    // ── Scheduling ───────────────────────────────────────────────────

    /// Persist a schedule for a registered job. Its timer is armed now if the
    /// runner is started, otherwise by `start()`.
    pub async fn schedule_job(&self, name: &str, cron: &str) -> Result<Schedule, Error> {
        if !self.inner.read_state()?.jobs.contains_key(name) {
            return Err(Error::not_found(format!("job '{}'", name)));
        }
        let parsed = parse_cron(cron)?;

        let schedule = ScheduleStore::insert(self.inner.db.pool(), name, cron.trim()).await?;
        if self.inner.started.load(Ordering::SeqCst) {
            self.inner.register_timer(&schedule, parsed)?;
        }
        info!(schedule_id = schedule.id, job = %name, cron = %schedule.cron, "schedule created");
        Ok(schedule)
    }

    /// Delete a persisted schedule and stop its timer.
    pub async fn delete_schedule(&self, id: i64) -> Result<(), Error> {
        ScheduleStore::delete(self.inner.db.pool(), id).await?;
        self.inner.cancel_timer(id)?;
        info!(schedule_id = id, "schedule deleted");
        Ok(())
    }

    pub async fn schedules(&self) -> Result<Vec<Schedule>, Error> {
        ScheduleStore::list(self.inner.db.pool()).await
    }

    // ── Ad-hoc runs ──────────────────────────────────────────────────

    /// Start a run immediately.
    ///
    /// Ad-hoc runs do not consult the overlap guard, so they may run
    /// alongside a scheduled run of the same job.
    pub async fn run_job(&self, name: &str) -> Result<RunHandle, Error> {
        let job = self
            .inner
            .read_state()?
            .jobs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("job '{}'", name)))?;

        let run_id = JobRunStore::insert_running(self.inner.db.pool(), name, Utc::now()).await?;
        let (done_tx, done_rx) = oneshot::channel();
        self.inner.spawn_execution(job, run_id, false, Some(done_tx))?;
        info!(job = %name, run_id, trigger = "adhoc", "job started");
        Ok(RunHandle { id: run_id, done: done_rx })
    }

    /// Cancel an in-flight run. The job decides how promptly it stops.
    pub fn cancel(&self, run_id: i64) -> Result<(), Error> {
        let state = self.inner.read_state()?;
        let token = state
            .in_flight
            .get(&run_id)
            .ok_or_else(|| Error::not_found(format!("in-flight run {}", run_id)))?;
        token.cancel();
        info!(run_id, "run cancellation requested");
        Ok(())
    }

    /// Cancel every in-flight run.
    pub fn cancel_all(&self) {
        self.inner.runs_cancel.cancel();
    }

    // ── History ──────────────────────────────────────────────────────

    pub async fn job_runs(&self, limit: u32) -> Result<Vec<JobRun>, Error> {
        JobRunStore::list(self.inner.db.pool(), limit).await
    }

    pub async fn get_job_run(&self, id: i64) -> Result<JobRun, Error> {
        JobRunStore::get(self.inner.db.pool(), id).await
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Mark orphaned runs as crashed, arm timers for persisted schedules and
    /// start the dispatcher. Call once, before any ad-hoc run in this process.
    pub async fn start(&self) -> Result<(), Error> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("runner already started"));
        }

        let crashed = JobRunStore::mark_crashed(self.inner.db.pool(), Utc::now()).await?;
        if crashed > 0 {
            warn!(count = crashed, "marked orphaned runs as crashed");
        }

        let schedules = ScheduleStore::list(self.inner.db.pool()).await?;
        for schedule in &schedules {
            match parse_cron(&schedule.cron) {
                Ok(parsed) => self.inner.register_timer(schedule, parsed)?,
                Err(e) => warn!(
                    schedule_id = schedule.id,
                    job = %schedule.name,
                    error = %e,
                    "skipping persisted schedule with invalid cron"
                ),
            }
        }

        let rx = self
            .inner
            .request_rx
            .lock()
            .map_err(|_| Error::internal("runner request channel lock poisoned"))?
            .take()
            .ok_or_else(|| Error::internal("runner dispatcher already taken"))?;
        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move { inner.dispatch_loop(rx).await });

        info!(schedules = schedules.len(), "runner started");
        Ok(())
    }

    /// Stop timers and the dispatcher. In-flight runs continue; the returned
    /// handle resolves once they have all finished.
    pub fn stop(&self) -> ShutdownHandle {
        self.inner.shutdown.cancel();
        if let Ok(mut timers) = self.inner.timers.lock() {
            timers.clear();
        }
        self.inner.tracker.close();
        info!("runner stopping");
        ShutdownHandle {
            tracker: self.inner.tracker.clone(),
        }
    }
}

impl Inner {
    pub(super) fn read_state(&self) -> Result<RwLockReadGuard<'_, RunnerState>, Error> {
        self.state
            .read()
            .map_err(|_| Error::internal("runner state lock poisoned"))
    }

    pub(super) fn write_state(&self) -> Result<RwLockWriteGuard<'_, RunnerState>, Error> {
        self.state
            .write()
            .map_err(|_| Error::internal("runner state lock poisoned"))
    }
}
