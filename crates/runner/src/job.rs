use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use bibsync_core::Error;

/// A named unit of work the [`Runner`](crate::Runner) can execute.
///
/// Implementations should check `cancel` at natural suspension points and
/// return [`Error::Canceled`] promptly once it fires.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, cancel: CancellationToken, out: &mut JobOutput) -> Result<(), Error>;
}

/// Text sink for a run's captured output, persisted in `job_run.output`.
#[derive(Debug, Default, Clone)]
pub struct JobOutput {
    buf: String,
}

impl JobOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line.
    pub fn line(&mut self, line: impl fmt::Display) {
        use fmt::Write;
        // Writing into a String cannot fail.
        let _ = writeln!(self.buf, "{}", line);
    }

    pub fn push_str(&mut self, s: &str) {
        self.buf.push_str(s);
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

impl fmt::Write for JobOutput {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf.push_str(s);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn output_collects_lines_and_writes() {
        let mut out = JobOutput::new();
        assert!(out.is_empty());
        out.line("fetched 3 records");
        write!(out, "archived {}", 1).unwrap();
        assert_eq!(out.as_str(), "fetched 3 records\narchived 1");
    }
}
