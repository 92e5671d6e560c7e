//! Incremental OAI-PMH harvesting into the local record store.

pub mod error;
pub mod harvester;
pub mod indexer;
pub mod oai;
pub mod source;
pub mod sources;
pub mod store;
pub mod transform;

pub use error::HarvestError;
pub use harvester::{HarvestStats, Harvester, DEFAULT_BATCH_SIZE};
pub use indexer::{IndexStats, RecordIndexer};
pub use oai::OaiClient;
pub use source::{ListRequest, Page, RecordSource};
pub use sources::{load_sources, parse_sources, SourceSpec};
pub use store::{CursorStore, RecordStore, SourceCursor, StoredRecord, UpsertMode};
pub use transform::{DublinCore, Transform, TransformError};
