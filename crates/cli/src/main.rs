mod app;
mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

use bibsync_core::config::{self, Config};

use crate::app::App;
use crate::cli::{CliArgs, Command};

#[tokio::main]
async fn main() -> Result<()> {
    config::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let config = Config::from_env();
    config.log_summary();

    let app = App::open(config, args.sources).await?;

    match args.command {
        Command::Serve => commands::serve(&app).await,
        Command::Jobs => commands::jobs(&app),
        Command::Run { name } => commands::run(&app, &name).await,
        Command::Schedule { name, cron } => commands::schedule(&app, &name, &cron).await,
        Command::Unschedule { id } => commands::unschedule(&app, id).await,
        Command::Schedules => commands::schedules(&app).await,
        Command::Runs { limit } => commands::runs(&app, limit).await,
        Command::Show { id } => commands::show(&app, id).await,
        Command::Ingest { scheme, value } => commands::ingest(&app, &scheme, &value).await,
        Command::Update { source, ids } => commands::update(&app, &source, &ids).await,
    }
}
