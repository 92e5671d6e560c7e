use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use bibsync_core::{Error, ErrorKind};
use bibsync_storage::Database;

use crate::job::{Job, JobOutput};
use crate::model::JobStatus;
use crate::runner::Runner;
use crate::store::JobRunStore;

/// Configurable job for exercising the runner.
struct MockJob {
    name: String,
    delay: Duration,
    fail_with: Option<String>,
    /// Wait for cancellation instead of finishing.
    block: bool,
    runs: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl MockJob {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            fail_with: None,
            block: false,
            runs: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn slow(name: &str, delay: Duration) -> Self {
        Self { delay, ..Self::new(name) }
    }

    fn failing(name: &str, msg: &str) -> Self {
        Self { fail_with: Some(msg.to_string()), ..Self::new(name) }
    }

    fn blocking(name: &str) -> Self {
        Self { block: true, ..Self::new(name) }
    }
}

#[async_trait]
impl Job for MockJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: CancellationToken, out: &mut JobOutput) -> Result<(), Error> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        out.line(format!("{} started", self.name));

        let result = if self.block {
            cancel.cancelled().await;
            Err(Error::Canceled)
        } else {
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Canceled),
                _ = tokio::time::sleep(self.delay) => match &self.fail_with {
                    Some(msg) => Err(Error::internal(msg)),
                    None => Ok(()),
                },
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

async fn runner() -> Runner {
    Runner::new(Database::open_in_memory().await.unwrap())
}

async fn runs_named(runner: &Runner, name: &str) -> Vec<crate::model::JobRun> {
    runner
        .job_runs(1000)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.name == name)
        .collect()
}

// ── Registry ─────────────────────────────────────────────────────────

#[tokio::test]
async fn job_names_are_sorted_and_registration_overwrites() {
    let runner = runner().await;
    runner.register(Arc::new(MockJob::new("zeta"))).unwrap();
    runner.register(Arc::new(MockJob::new("alpha"))).unwrap();
    runner.register(Arc::new(MockJob::failing("alpha", "boom"))).unwrap();
    assert_eq!(runner.job_names().unwrap(), vec!["alpha", "zeta"]);

    // The last registration wins.
    let status = runner.run_job("alpha").await.unwrap().wait().await.unwrap();
    assert_eq!(status, JobStatus::Failed);
}

// ── Ad-hoc runs ──────────────────────────────────────────────────────

#[tokio::test]
async fn sequential_adhoc_runs_get_distinct_ids() {
    let runner = runner().await;
    runner.register(Arc::new(MockJob::new("echo"))).unwrap();

    let first = runner.run_job("echo").await.unwrap();
    let first_id = first.id;
    assert_eq!(first.wait().await.unwrap(), JobStatus::Ok);

    let second = runner.run_job("echo").await.unwrap();
    let second_id = second.id;
    assert_eq!(second.wait().await.unwrap(), JobStatus::Ok);
    assert_ne!(first_id, second_id);

    for id in [first_id, second_id] {
        let run = runner.get_job_run(id).await.unwrap();
        assert_eq!(run.status, JobStatus::Ok);
        assert!(run.stop_at.is_some());
        assert_eq!(run.output, "echo started\n");
    }
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let runner = runner().await;
    let err = runner.run_job("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(runs_named(&runner, "missing").await.is_empty());
}

#[tokio::test]
async fn failing_job_appends_error_to_output() {
    let runner = runner().await;
    runner.register(Arc::new(MockJob::failing("broken", "upstream returned 503"))).unwrap();

    let handle = runner.run_job("broken").await.unwrap();
    let id = handle.id;
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Failed);

    let run = runner.get_job_run(id).await.unwrap();
    assert_eq!(run.status, JobStatus::Failed);
    assert!(run
        .output
        .ends_with("\nfailed with: internal error: upstream returned 503"));
}

#[tokio::test]
async fn cancelled_run_is_recorded_as_cancelled() {
    let runner = runner().await;
    runner.register(Arc::new(MockJob::blocking("forever"))).unwrap();

    let handle = runner.run_job("forever").await.unwrap();
    let id = handle.id;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.get_job_run(id).await.unwrap().status, JobStatus::Running);

    runner.cancel(id).unwrap();
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Cancelled);

    let run = runner.get_job_run(id).await.unwrap();
    assert_eq!(run.status, JobStatus::Cancelled);
    assert!(run.output.contains("failed with: context canceled"));

    // No longer in flight.
    assert_eq!(runner.cancel(id).unwrap_err().kind(), ErrorKind::NotFound);
}

// ── Schedules ────────────────────────────────────────────────────────

#[tokio::test]
async fn schedule_validation() {
    let runner = runner().await;
    runner.register(Arc::new(MockJob::new("echo"))).unwrap();

    let err = runner.schedule_job("missing", "* * * * * *").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = runner.schedule_job("echo", "*/5 * * * *").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = runner.schedule_job("echo", "not a cron at all").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    assert!(runner.schedules().await.unwrap().is_empty());

    let s = runner.schedule_job("echo", "0 0 3 * * *").await.unwrap();
    assert_eq!(runner.schedules().await.unwrap(), vec![s.clone()]);

    let err = runner.delete_schedule(s.id + 100).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    runner.delete_schedule(s.id).await.unwrap();
    assert!(runner.schedules().await.unwrap().is_empty());
}

#[tokio::test]
async fn deleted_schedule_stops_firing() {
    let runner = runner().await;
    let job = MockJob::new("tick");
    let runs = job.runs.clone();
    runner.register(Arc::new(job)).unwrap();
    runner.start().await.unwrap();

    let schedule = runner.schedule_job("tick", "* * * * * *").await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(runs.load(Ordering::SeqCst) >= 1);

    runner.delete_schedule(schedule.id).await.unwrap();
    // Let any request fired before the deletion drain.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let after_delete = runs_named(&runner, "tick").await.len();

    tokio::time::sleep(Duration::from_millis(2200)).await;
    assert_eq!(runs_named(&runner, "tick").await.len(), after_delete);

    runner.stop().wait().await;
}

#[tokio::test]
async fn scheduled_runs_never_overlap() {
    let runner = runner().await;
    let job = MockJob::slow("slow", Duration::from_millis(2200));
    let max_active = job.max_active.clone();
    runner.register(Arc::new(job)).unwrap();
    runner.start().await.unwrap();
    runner.schedule_job("slow", "* * * * * *").await.unwrap();

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let running = runs_named(&runner, "slow")
            .await
            .into_iter()
            .filter(|r| r.status == JobStatus::Running)
            .count();
        assert!(running <= 1, "found {} concurrent scheduled runs", running);
    }
    assert_eq!(max_active.load(Ordering::SeqCst), 1);

    // Triggers that found the job busy left no rows behind: ~4s of
    // per-second triggers against a 2.2s job yields at most two runs.
    assert!(runs_named(&runner, "slow").await.len() <= 2);

    runner.cancel_all();
    runner.stop().wait().await;
}

#[tokio::test]
async fn adhoc_run_may_overlap_scheduled_run() {
    let runner = runner().await;
    let job = MockJob::slow("slow", Duration::from_millis(1500));
    let max_active = job.max_active.clone();
    runner.register(Arc::new(job)).unwrap();
    runner.start().await.unwrap();
    let schedule = runner.schedule_job("slow", "* * * * * *").await.unwrap();

    // Wait until the scheduled run is in progress.
    for _ in 0..30 {
        if runs_named(&runner, "slow").await.iter().any(|r| r.status == JobStatus::Running) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let handle = runner.run_job("slow").await.unwrap();
    runner.delete_schedule(schedule.id).await.unwrap();

    assert_eq!(handle.wait().await.unwrap(), JobStatus::Ok);
    assert_eq!(max_active.load(Ordering::SeqCst), 2);
    runner.stop().wait().await;
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn start_marks_orphaned_runs_crashed() {
    let db = Database::open_in_memory().await.unwrap();
    let started = Utc::now();
    let orphan = JobRunStore::insert_running(db.pool(), "harvest", started).await.unwrap();
    sqlx::query("UPDATE job_run SET output = 'page 1 done' WHERE id = ?")
        .bind(orphan)
        .execute(db.pool())
        .await
        .unwrap();

    let runner = Runner::new(db);
    runner.start().await.unwrap();

    let run = runner.get_job_run(orphan).await.unwrap();
    assert_eq!(run.status, JobStatus::Crashed);
    assert_eq!(run.name, "harvest");
    assert!((run.start_at - started).num_milliseconds().abs() < 1);
    assert_eq!(run.output, "page 1 done");
    assert!(run.stop_at.is_some());

    assert!(runner.start().await.is_err(), "second start must fail");
    runner.stop().wait().await;
}

#[tokio::test]
async fn start_rearms_persisted_schedules() {
    let db = Database::open_in_memory().await.unwrap();
    crate::store::ScheduleStore::insert(db.pool(), "tick", "* * * * * *")
        .await
        .unwrap();

    let runner = Runner::new(db);
    let job = MockJob::new("tick");
    let runs = job.runs.clone();
    runner.register(Arc::new(job)).unwrap();
    runner.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(2300)).await;
    assert!(runs.load(Ordering::SeqCst) >= 1);
    runner.stop().wait().await;
}

#[tokio::test]
async fn schedule_before_start_is_armed_by_start() {
    let runner = runner().await;
    let job = MockJob::new("tick");
    let runs = job.runs.clone();
    runner.register(Arc::new(job)).unwrap();
    runner.schedule_job("tick", "* * * * * *").await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(runner.inner.timers.lock().unwrap().is_empty());
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    runner.start().await.unwrap();
    assert_eq!(runner.inner.timers.lock().unwrap().len(), 1);
    tokio::time::sleep(Duration::from_millis(2300)).await;
    assert!(runs.load(Ordering::SeqCst) >= 1);
    runner.stop().wait().await;
}

#[tokio::test]
async fn stop_waits_for_in_flight_runs() {
    let runner = runner().await;
    runner.register(Arc::new(MockJob::slow("slow", Duration::from_millis(300)))).unwrap();
    runner.start().await.unwrap();

    let handle = runner.run_job("slow").await.unwrap();
    let id = handle.id;
    runner.stop().wait().await;

    let run = runner.get_job_run(id).await.unwrap();
    assert_eq!(run.status, JobStatus::Ok);
}
