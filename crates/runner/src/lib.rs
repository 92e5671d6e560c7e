pub mod cron;
pub mod job;
pub mod model;
pub mod runner;
pub mod store;

pub use job::{Job, JobOutput};
pub use model::{JobRun, JobStatus, RunHandle, Schedule};
pub use runner::{Runner, ShutdownHandle};

pub use tokio_util::sync::CancellationToken;
