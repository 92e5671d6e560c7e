//! Wiring: database, runner and the configured jobs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use bibsync_core::config::HarvestConfig;
use bibsync_core::Config;
use bibsync_harvest::{load_sources, DublinCore, Harvester, OaiClient, RecordIndexer, SourceSpec};
use bibsync_ingest::LinkJanitor;
use bibsync_runner::Runner;
use bibsync_storage::Database;

pub struct App {
    pub config: Config,
    pub db: Database,
    pub runner: Runner,
    pub harvesters: Vec<Arc<Harvester>>,
}

impl App {
    pub async fn open(config: Config, sources: Option<PathBuf>) -> Result<Self> {
        let db = Database::connect(&config.database)
            .await
            .context("failed to open database")?;

        let path = sources.unwrap_or_else(|| config.harvest.sources_file.clone());
        let specs = load_sources(&path).with_context(|| format!("failed to load {}", path.display()))?;

        let runner = Runner::new(db.clone());
        let mut harvesters = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.enqueue {
                runner.register(Arc::new(RecordIndexer::new(&spec.id, db.clone(), Arc::new(DublinCore))))?;
            }
            let harvester = Arc::new(build_harvester(spec, &config.harvest, &db)?);
            runner.register(harvester.clone())?;
            harvesters.push(harvester);
        }
        runner.register(Arc::new(LinkJanitor::new(db.clone())))?;
        info!(jobs = ?runner.job_names()?, "jobs registered");

        Ok(Self {
            config,
            db,
            runner,
            harvesters,
        })
    }

    pub fn harvester(&self, source_id: &str) -> Option<&Arc<Harvester>> {
        self.harvesters.iter().find(|h| h.spec().id == source_id)
    }
}

fn build_harvester(mut spec: SourceSpec, config: &HarvestConfig, db: &Database) -> Result<Harvester> {
    if spec.batch_size.is_none() {
        spec.batch_size = Some(config.batch_size);
    }
    let client = OaiClient::new(&spec.endpoint, config.request_timeout())
        .with_context(|| format!("source '{}'", spec.id))?;
    Ok(Harvester::new(spec, db.clone(), Arc::new(client), Arc::new(DublinCore)))
}
