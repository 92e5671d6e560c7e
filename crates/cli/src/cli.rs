use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Harvest bibliographic records and keep the local catalogue in sync.
#[derive(Parser, Debug)]
#[command(name = "bibsync", version, about)]
pub struct CliArgs {
    /// Harvest source definitions (overrides HARVEST_SOURCES).
    #[arg(long, global = true)]
    pub sources: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the scheduler with every configured job and run until Ctrl-C.
    Serve,
    /// List registered job names.
    Jobs,
    /// Run a job now and print its output. Ctrl-C cancels the run.
    Run { name: String },
    /// Schedule a job with a six-field cron expression (seconds first).
    Schedule { name: String, cron: String },
    /// Delete a schedule.
    Unschedule { id: i64 },
    /// List schedules.
    Schedules,
    /// Show recent job runs.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show one job run with its output.
    Show { id: i64 },
    /// Ingest a harvested record by external identifier, e.g. `isbn 9788205000001`.
    Ingest { scheme: String, value: String },
    /// Re-fetch single records of a source by their OAI identifiers.
    Update {
        source: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
}
