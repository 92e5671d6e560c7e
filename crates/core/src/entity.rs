use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Kind tag stored in `entity.type` / `record.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Publication,
    Publisher,
    Person,
    Corporation,
    LiteraryAward,
    Series,
    Dewey,
    Unknown,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Publication,
        EntityKind::Publisher,
        EntityKind::Person,
        EntityKind::Corporation,
        EntityKind::LiteraryAward,
        EntityKind::Series,
        EntityKind::Dewey,
        EntityKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Publication => "publication",
            EntityKind::Publisher => "publisher",
            EntityKind::Person => "person",
            EntityKind::Corporation => "corporation",
            EntityKind::LiteraryAward => "literary_award",
            EntityKind::Series => "series",
            EntityKind::Dewey => "dewey",
            EntityKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown entity type '{}'", s)))
    }
}

// ── External identifiers ──────────────────────────────────────

/// An identifier in some external scheme, e.g. `("isbn", "9788203193149")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalId {
    pub scheme: String,
    pub value: String,
}

impl ExternalId {
    pub fn new(scheme: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.value)
    }
}

// ── Entity payloads (tagged union) ────────────────────────────

/// Payload of a graph entity, tagged by `type` field.
///
/// Stored as JSON in `entity.payload`; the tag always equals `entity.type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityData {
    Publication(Publication),
    Publisher(Named),
    Person(Person),
    Corporation(Named),
    LiteraryAward(Named),
    Series(Named),
    Dewey(Dewey),
    Unknown { raw: serde_json::Value },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    /// Free-form life span, e.g. "1947-".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dates: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Named {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dewey {
    pub number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl EntityData {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityData::Publication(_) => EntityKind::Publication,
            EntityData::Publisher(_) => EntityKind::Publisher,
            EntityData::Person(_) => EntityKind::Person,
            EntityData::Corporation(_) => EntityKind::Corporation,
            EntityData::LiteraryAward(_) => EntityKind::LiteraryAward,
            EntityData::Series(_) => EntityKind::Series,
            EntityData::Dewey(_) => EntityKind::Dewey,
            EntityData::Unknown { .. } => EntityKind::Unknown,
        }
    }

    /// Display label synthesized from the payload.
    pub fn label(&self) -> String {
        match self {
            EntityData::Publication(p) => {
                let mut label = p.title.clone();
                if let Some(sub) = &p.subtitle {
                    label.push_str(": ");
                    label.push_str(sub);
                }
                if let Some(year) = &p.year {
                    label.push_str(&format!(" ({})", year));
                }
                label
            }
            EntityData::Person(p) => match &p.dates {
                Some(dates) => format!("{} ({})", p.name, dates),
                None => p.name.clone(),
            },
            EntityData::Publisher(n)
            | EntityData::Corporation(n)
            | EntityData::LiteraryAward(n)
            | EntityData::Series(n) => n.name.clone(),
            EntityData::Dewey(d) => match &d.name {
                Some(name) => format!("{} {}", d.number, name),
                None => d.number.clone(),
            },
            EntityData::Unknown { .. } => String::new(),
        }
    }

    /// Decode a stored payload, checking it against the row's type column.
    pub fn decode(kind: EntityKind, payload: &str) -> Result<Self, Error> {
        let data: EntityData = serde_json::from_str(payload)?;
        if data.kind() != kind {
            return Err(Error::Internal(format!(
                "payload tagged '{}' stored under type '{}'",
                data.kind(),
                kind
            )));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_string_roundtrip_covers_all() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("pamphlet".parse::<EntityKind>().is_err());
    }

    #[test]
    fn payload_is_tagged_with_type() {
        let data = EntityData::Person(Person {
            name: "Hamsun, Knut".to_string(),
            dates: Some("1859-1952".to_string()),
        });
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["type"], "person");
        assert_eq!(json["name"], "Hamsun, Knut");
        assert_eq!(data.label(), "Hamsun, Knut (1859-1952)");
    }

    #[test]
    fn decode_rejects_mismatched_tag() {
        let payload = r#"{"type":"series","name":"Lanterne"}"#;
        assert!(EntityData::decode(EntityKind::Series, payload).is_ok());
        let err = EntityData::decode(EntityKind::Person, payload).unwrap_err();
        assert!(err.to_string().contains("series"));
    }

    #[test]
    fn publication_label_includes_subtitle_and_year() {
        let data = EntityData::Publication(Publication {
            title: "Sult".to_string(),
            subtitle: Some("roman".to_string()),
            year: Some("1890".to_string()),
            language: None,
        });
        assert_eq!(data.label(), "Sult: roman (1890)");
    }
}
