//! Merging derived records into the entity graph.

pub mod ingestor;
pub mod janitor;
pub mod store;

pub use ingestor::{IngestReport, Ingestor};
pub use janitor::{HealStats, LinkJanitor, JANITOR_JOB};
pub use store::{EntityStore, StoredEntity, StoredLink};
