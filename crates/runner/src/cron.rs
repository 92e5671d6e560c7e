//! Cron expression validation and fire-time helpers.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use bibsync_core::Error;

/// Parse a six-field (seconds first) cron expression.
///
/// Five-field and seven-field (year) expressions are rejected even though the
/// `cron` crate accepts the latter.
pub fn parse_cron(expr: &str) -> Result<Schedule, Error> {
    let fields = expr.split_whitespace().count();
    if fields != 6 {
        return Err(Error::InvalidArgument(format!(
            "cron expression '{}' has {} fields, expected 6 (sec min hour dom month dow)",
            expr, fields
        )));
    }
    Schedule::from_str(expr.trim())
        .map_err(|e| Error::InvalidArgument(format!("invalid cron expression '{}': {}", expr, e)))
}

/// Time to sleep from `now` until the next fire, or `None` if the schedule
/// never fires again.
pub(crate) fn until_next_fire(schedule: &Schedule, now: DateTime<Utc>) -> Option<Duration> {
    let next = schedule.after(&now).next()?;
    Some((next - now).to_std().unwrap_or(Duration::ZERO))
}
