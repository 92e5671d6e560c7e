use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityData, EntityKind, ExternalId};

/// One record as delivered by a remote source, before transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub identifier: String,
    /// Source datestamp, verbatim.
    pub datestamp: String,
    /// Header flagged the record as deleted at the source.
    pub deleted: bool,
    /// Inner XML of the `<metadata>` element; empty for tombstones.
    pub metadata: String,
}

/// Transformer output for one raw record.
///
/// A record with `archived_at` set is a tombstone; the harvester archives it
/// instead of upserting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedRecord {
    pub id: String,
    pub kind: EntityKind,
    pub label: String,
    /// Raw metadata kept so the record can be re-transformed later.
    pub payload: String,
    pub archived_at: Option<DateTime<Utc>>,
    pub identifiers: Vec<ExternalId>,
    pub ingestion: Ingestion,
}

impl DerivedRecord {
    pub fn tombstone(id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            kind: EntityKind::Unknown,
            label: String::new(),
            payload: String::new(),
            archived_at: Some(at),
            identifiers: Vec::new(),
            ingestion: Ingestion::default(),
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

// ── Ingestion graph ───────────────────────────────────────────

/// Candidate entities, links and side records derived from one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ingestion {
    pub entities: Vec<CandidateEntity>,
    pub links: Vec<CandidateLink>,
    pub side_records: Vec<SideRecord>,
}

impl Ingestion {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.links.is_empty() && self.side_records.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntity {
    /// Provisional id; becomes the stored id unless the candidate is merged.
    pub id: String,
    pub label: String,
    pub data: EntityData,
    pub identifiers: Vec<ExternalId>,
    /// The entity the record itself introduces. Never deduplicated.
    pub primary: bool,
}

impl CandidateEntity {
    pub fn new(id: impl Into<String>, data: EntityData) -> Self {
        Self {
            id: id.into(),
            label: data.label(),
            data,
            identifiers: Vec::new(),
            primary: false,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn with_identifier(mut self, scheme: impl Into<String>, value: impl Into<String>) -> Self {
        self.identifiers.push(ExternalId::new(scheme, value));
        self
    }

    pub fn kind(&self) -> EntityKind {
        self.data.kind()
    }
}

/// Target of a candidate link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkTarget {
    /// A candidate's provisional id, or the id of an already stored entity.
    Entity(String),
    /// Resolve by external identifier lookup.
    Identifier(ExternalId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateLink {
    pub from: String,
    pub to: LinkTarget,
    pub kind: String,
    pub payload: serde_json::Value,
}

impl CandidateLink {
    pub fn new(from: impl Into<String>, to: LinkTarget, kind: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to,
            kind: kind.into(),
            payload: serde_json::Value::Object(Default::default()),
        }
    }
}

/// Auxiliary record attached to an entity but not part of the graph (e.g. a review).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideRecord {
    pub from: String,
    pub kind: String,
    pub payload: serde_json::Value,
}
