use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub database: DatabaseConfig,
    pub harvest: HarvestConfig,
    pub runner: RunnerConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `BIBSYNC_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("BIBSYNC_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            database: DatabaseConfig::from_env_profiled(p),
            harvest: HarvestConfig::from_env_profiled(p),
            runner: RunnerConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  database:  url={}, max_connections={}",
            self.database.redacted_url(),
            self.database.max_connections
        );
        tracing::info!(
            "  harvest:   sources={}, batch_size={}, timeout={}s",
            self.harvest.sources_file.display(),
            self.harvest.batch_size,
            self.harvest.request_timeout_secs
        );
        tracing::info!("  runner:    shutdown_timeout={}s", self.runner.shutdown_timeout_secs);
    }
}

// ── Database ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite://data/bibsync.db`.
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl DatabaseConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_or(p, "DATABASE_URL", "sqlite://data/bibsync.db"),
            max_connections: profiled_env_u32(p, "DB_MAX_CONNECTIONS", 20),
            acquire_timeout_secs: profiled_env_u64(p, "DB_ACQUIRE_TIMEOUT_SECS", 30),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// The URL with any `user:password@` part stripped.
    pub fn redacted_url(&self) -> String {
        match (self.url.find("://"), self.url.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                format!("{}://***@{}", &self.url[..scheme_end], &self.url[at + 1..])
            }
            _ => self.url.clone(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::from_env_profiled("")
    }
}

// ── Harvest ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// TOML file with `[[source]]` definitions.
    pub sources_file: PathBuf,
    /// Default records per persisted batch (a source may override it).
    pub batch_size: usize,
    pub request_timeout_secs: u64,
}

impl HarvestConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            sources_file: PathBuf::from(profiled_env_or(p, "HARVEST_SOURCES", "config/sources.toml")),
            batch_size: profiled_env_u32(p, "HARVEST_BATCH_SIZE", 1000).max(1) as usize,
            request_timeout_secs: profiled_env_u64(p, "HARVEST_TIMEOUT_SECS", 60),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ── Runner ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// How long `serve` waits for in-flight runs after Ctrl-C.
    pub shutdown_timeout_secs: u64,
}

impl RunnerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            shutdown_timeout_secs: profiled_env_u64(p, "RUNNER_SHUTDOWN_TIMEOUT_SECS", 30),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
