//! Record transformers: raw source records into derived records.

mod dublin_core;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use bibsync_core::{DerivedRecord, RawRecord};

pub use dublin_core::DublinCore;

/// A per-record failure. The harvester logs it and skips the record.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("record {id}: malformed metadata: {reason}")]
    Malformed { id: String, reason: String },

    #[error("record {id}: missing required field '{field}'")]
    MissingField { id: String, field: &'static str },
}

/// Maps one raw record to its derived form. Must be pure.
pub trait Transform: Send + Sync {
    fn transform(&self, record: &RawRecord) -> Result<DerivedRecord, TransformError>;
}

impl<F> Transform for F
where
    F: Fn(&RawRecord) -> Result<DerivedRecord, TransformError> + Send + Sync,
{
    fn transform(&self, record: &RawRecord) -> Result<DerivedRecord, TransformError> {
        self(record)
    }
}

/// Parse an OAI datestamp: either a full UTC timestamp or a bare day.
pub fn parse_datestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
