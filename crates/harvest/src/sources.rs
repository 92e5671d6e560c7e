//! Harvest source definitions, loaded from a TOML file of `[[source]]` tables.
//!
//! ```toml
//! [[source]]
//! id = "bibsys"
//! endpoint = "https://oai.example.org/oai"
//! set = "books"
//! prefix = "oai_dc"
//! enqueue = true
//! batch_size = 500
//! start_at = "2020-01-01"
//! ```

use std::collections::HashSet;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use bibsync_core::Error;

pub const DEFAULT_PREFIX: &str = "oai_dc";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
    /// Local source id; the key of the cursor and of harvested records.
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub set: Option<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Overrides the default `oai_harvester:<id>:<set>` job name.
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub enqueue: bool,
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Lower date bound for the very first harvest.
    #[serde(default)]
    pub start_at: Option<NaiveDate>,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

impl SourceSpec {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            set: None,
            prefix: default_prefix(),
            job_name: None,
            enqueue: false,
            batch_size: None,
            start_at: None,
        }
    }

    pub fn job_name(&self) -> String {
        match &self.job_name {
            Some(name) => name.clone(),
            None => format!("oai_harvester:{}:{}", self.id, self.set.as_deref().unwrap_or("")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(default, rename = "source")]
    sources: Vec<SourceSpec>,
}

/// Parse and validate source definitions.
pub fn parse_sources(text: &str) -> Result<Vec<SourceSpec>, Error> {
    let file: SourcesFile =
        toml::from_str(text).map_err(|e| Error::InvalidArgument(format!("sources file: {}", e)))?;

    let mut seen = HashSet::new();
    for spec in &file.sources {
        if spec.id.trim().is_empty() {
            return Err(Error::InvalidArgument("source with empty id".into()));
        }
        if !seen.insert(spec.id.as_str()) {
            return Err(Error::InvalidArgument(format!("duplicate source id '{}'", spec.id)));
        }
        if spec.batch_size == Some(0) {
            return Err(Error::InvalidArgument(format!("source '{}': batch_size must be > 0", spec.id)));
        }
    }
    Ok(file.sources)
}

/// Load source definitions; a missing file means no sources.
pub fn load_sources(path: &Path) -> Result<Vec<SourceSpec>, Error> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_sources(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "sources file not found, no harvest jobs configured");
            Ok(Vec::new())
        }
        Err(e) => Err(Error::internal(format!("reading {}: {}", path.display(), e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bibsync_core::ErrorKind;
    use std::io::Write;

    #[test]
    fn parses_defaults_and_overrides() {
        let sources = parse_sources(
            r#"
            [[source]]
            id = "bibsys"
            endpoint = "https://oai.example.org/oai"
            set = "books"

            [[source]]
            id = "dewey"
            endpoint = "https://dewey.example.org/oai"
            prefix = "marcxchange"
            job_name = "dewey_sync"
            enqueue = true
            batch_size = 250
            start_at = "2020-01-01"
            "#,
        )
        .unwrap();

        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].prefix, "oai_dc");
        assert_eq!(sources[0].job_name(), "oai_harvester:bibsys:books");
        assert!(!sources[0].enqueue);

        assert_eq!(sources[1].job_name(), "dewey_sync");
        assert_eq!(sources[1].batch_size, Some(250));
        assert_eq!(sources[1].start_at, NaiveDate::from_ymd_opt(2020, 1, 1));
    }

    #[test]
    fn default_job_name_without_set() {
        assert_eq!(SourceSpec::new("x", "http://h").job_name(), "oai_harvester:x:");
    }

    #[test]
    fn rejects_duplicates_and_zero_batch() {
        let dup = "[[source]]\nid='a'\nendpoint='http://h'\n[[source]]\nid='a'\nendpoint='http://h'\n";
        assert_eq!(parse_sources(dup).unwrap_err().kind(), ErrorKind::InvalidArgument);

        let zero = "[[source]]\nid='a'\nendpoint='http://h'\nbatch_size=0\n";
        assert_eq!(parse_sources(zero).unwrap_err().kind(), ErrorKind::InvalidArgument);

        let typo = "[[source]]\nid='a'\nendpont='http://h'\n";
        assert!(parse_sources(typo).is_err());
    }

    #[test]
    fn load_from_file_and_missing_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[source]]\nid = \"a\"\nendpoint = \"http://h/oai\"").unwrap();
        let sources = load_sources(file.path()).unwrap();
        assert_eq!(sources[0].id, "a");

        let dir = tempfile::tempdir().unwrap();
        assert!(load_sources(&dir.path().join("none.toml")).unwrap().is_empty());
    }
}
