use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use bibsync_core::ErrorKind;
use bibsync_harvest::DublinCore;
use bibsync_ingest::Ingestor;
use bibsync_runner::{JobOutput, JobRun, JobStatus, Runner};

use crate::app::App;

pub async fn serve(app: &App) -> Result<()> {
    app.runner.start().await?;
    info!("runner started, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    let shutdown = app.runner.stop();
    if !shutdown.wait_timeout(app.config.runner.shutdown_timeout()).await {
        warn!("runs still in flight after shutdown timeout, cancelling them");
        app.runner.cancel_all();
        shutdown.wait().await;
    }
    app.db.close().await;
    info!("stopped");
    Ok(())
}

pub fn jobs(app: &App) -> Result<()> {
    for name in app.runner.job_names()? {
        println!("{}", name);
    }
    Ok(())
}

pub async fn run(app: &App, name: &str) -> Result<()> {
    let handle = app.runner.run_job(name).await?;
    let id = handle.id;
    println!("started run {}", id);

    let done = handle.wait();
    tokio::pin!(done);
    let status = tokio::select! {
        status = &mut done => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = id, "cancelling run");
            cancel_run(&app.runner, id)?;
            done.await?
        }
    };

    let run = app.runner.get_job_run(id).await?;
    print!("{}", run.output);
    if !run.output.is_empty() && !run.output.ends_with('\n') {
        println!();
    }
    if status != JobStatus::Ok {
        bail!("run {} finished with status {}", id, status);
    }
    Ok(())
}

/// Request cancellation of `id`. A run that already finished is not an error.
fn cancel_run(runner: &Runner, id: i64) -> Result<()> {
    match runner.cancel(id) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => Ok(other?),
    }
}

pub async fn schedule(app: &App, name: &str, cron: &str) -> Result<()> {
    let schedule = app.runner.schedule_job(name, cron).await?;
    println!("schedule {}: {} at '{}'", schedule.id, schedule.name, schedule.cron);
    Ok(())
}

pub async fn unschedule(app: &App, id: i64) -> Result<()> {
    app.runner.delete_schedule(id).await?;
    println!("schedule {} deleted", id);
    Ok(())
}

pub async fn schedules(app: &App) -> Result<()> {
    for s in app.runner.schedules().await? {
        println!("{:>5}  {:<24}  {}", s.id, s.cron, s.name);
    }
    Ok(())
}

pub async fn runs(app: &App, limit: u32) -> Result<()> {
    for run in app.runner.job_runs(limit).await? {
        println!(
            "{:>6}  {:<9}  {}  {}  {}",
            run.id,
            run.status.as_str(),
            fmt_time(Some(run.start_at)),
            fmt_time(run.stop_at),
            run.name
        );
    }
    Ok(())
}

pub async fn show(app: &App, id: i64) -> Result<()> {
    let JobRun {
        id,
        name,
        start_at,
        stop_at,
        status,
        output,
    } = app.runner.get_job_run(id).await?;
    println!("run:     {}", id);
    println!("job:     {}", name);
    println!("status:  {}", status);
    println!("started: {}", fmt_time(Some(start_at)));
    println!("stopped: {}", fmt_time(stop_at));
    println!();
    print!("{}", output);
    Ok(())
}

pub async fn ingest(app: &App, scheme: &str, value: &str) -> Result<()> {
    let report = Ingestor::new(app.db.clone())
        .ingest_identifier(scheme, value, &DublinCore)
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn update(app: &App, source: &str, ids: &[String]) -> Result<()> {
    let Some(harvester) = app.harvester(source) else {
        bail!("unknown source '{}'", source);
    };
    let mut out = JobOutput::new();
    harvester.update_records(ids, &mut out).await?;
    print!("{}", out.as_str());
    Ok(())
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    match t {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".repeat(19),
    }
}
