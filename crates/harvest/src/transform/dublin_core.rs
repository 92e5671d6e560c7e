use chrono::Utc;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::json;

use bibsync_core::{
    CandidateEntity, CandidateLink, DerivedRecord, EntityData, EntityKind, ExternalId, Ingestion,
    LinkTarget, Named, Person, Publication, RawRecord, SideRecord,
};

use super::{parse_datestamp, Transform, TransformError};

/// Transformer for unqualified Dublin Core (`oai_dc`) metadata.
///
/// Each record becomes one publication. Creators and contributors become
/// person candidates, the publisher a publisher candidate; both are matched
/// against known entities by name. `dc:relation` values that are ISBN/ISSN
/// identifiers become `is_part_of` links resolved by identifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct DublinCore;

#[derive(Debug, Default)]
struct DcFields {
    title: Vec<String>,
    creator: Vec<String>,
    contributor: Vec<String>,
    publisher: Vec<String>,
    date: Vec<String>,
    language: Vec<String>,
    identifier: Vec<String>,
    relation: Vec<String>,
    description: Vec<String>,
}

impl DcFields {
    fn slot(&mut self, name: &[u8]) -> Option<&mut Vec<String>> {
        match name {
            b"title" => Some(&mut self.title),
            b"creator" => Some(&mut self.creator),
            b"contributor" => Some(&mut self.contributor),
            b"publisher" => Some(&mut self.publisher),
            b"date" => Some(&mut self.date),
            b"language" => Some(&mut self.language),
            b"identifier" => Some(&mut self.identifier),
            b"relation" => Some(&mut self.relation),
            b"description" => Some(&mut self.description),
            _ => None,
        }
    }

    fn parse(id: &str, xml: &str) -> Result<Self, TransformError> {
        let malformed = |e: quick_xml::Error| TransformError::Malformed {
            id: id.to_string(),
            reason: e.to_string(),
        };

        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut fields = DcFields::default();
        let mut current: Option<Vec<u8>> = None;

        loop {
            match reader.read_event().map_err(malformed)? {
                Event::Start(e) => {
                    current = Some(e.local_name().as_ref().to_vec());
                    if let Some(slot) = fields.slot(e.local_name().as_ref()) {
                        slot.push(String::new());
                    }
                }
                Event::Text(t) => {
                    let text = t.unescape().map_err(malformed)?;
                    if let Some(name) = current.as_deref() {
                        if let Some(last) = fields.slot(name).and_then(|slot| slot.last_mut()) {
                            last.push_str(&text);
                        }
                    }
                }
                Event::End(_) => current = None,
                Event::Eof => break,
                _ => {}
            }
        }

        for slot in [
            &mut fields.title,
            &mut fields.creator,
            &mut fields.contributor,
            &mut fields.publisher,
            &mut fields.date,
            &mut fields.language,
            &mut fields.identifier,
            &mut fields.relation,
            &mut fields.description,
        ] {
            slot.retain(|v| !v.trim().is_empty());
        }
        Ok(fields)
    }
}

impl Transform for DublinCore {
    fn transform(&self, raw: &RawRecord) -> Result<DerivedRecord, TransformError> {
        if raw.deleted {
            let at = parse_datestamp(&raw.datestamp).unwrap_or_else(Utc::now);
            return Ok(DerivedRecord::tombstone(raw.identifier.clone(), at));
        }

        let dc = DcFields::parse(&raw.identifier, &raw.metadata)?;
        let title = dc.title.first().ok_or_else(|| TransformError::MissingField {
            id: raw.identifier.clone(),
            field: "title",
        })?;
        let (title, subtitle) = split_title(title);

        let data = EntityData::Publication(Publication {
            title,
            subtitle,
            year: dc.date.iter().find_map(|d| year_of(d)),
            language: dc.language.first().map(|l| l.trim().to_string()),
        });

        let identifiers: Vec<ExternalId> = dc.identifier.iter().filter_map(|v| classify_identifier(v)).collect();

        let pub_id = raw.identifier.clone();
        let mut primary = CandidateEntity::new(pub_id.clone(), data.clone()).primary();
        primary.identifiers = identifiers.clone();

        let mut ingestion = Ingestion {
            entities: vec![primary],
            ..Ingestion::default()
        };

        let agents = dc
            .creator
            .iter()
            .map(|n| (n, "creator"))
            .chain(dc.contributor.iter().map(|n| (n, "contributor")));
        for (i, (name, role)) in agents.enumerate() {
            let name = name.trim();
            let person_id = format!("{}#agent{}", pub_id, i);
            ingestion.entities.push(
                CandidateEntity::new(
                    person_id.clone(),
                    EntityData::Person(Person { name: name.to_string(), dates: None }),
                )
                .with_identifier("name", name_key(name)),
            );
            let mut link = CandidateLink::new(pub_id.clone(), LinkTarget::Entity(person_id), "has_contributor");
            link.payload = json!({ "role": role });
            ingestion.links.push(link);
        }

        for (i, name) in dc.publisher.iter().enumerate() {
            let name = name.trim();
            let publisher_id = format!("{}#publisher{}", pub_id, i);
            ingestion.entities.push(
                CandidateEntity::new(publisher_id.clone(), EntityData::Publisher(Named { name: name.to_string() }))
                    .with_identifier("publisher_name", name_key(name)),
            );
            ingestion
                .links
                .push(CandidateLink::new(pub_id.clone(), LinkTarget::Entity(publisher_id), "published_by"));
        }

        for relation in &dc.relation {
            if let Some(target) = classify_identifier(relation).filter(|id| id.scheme != "uri") {
                ingestion
                    .links
                    .push(CandidateLink::new(pub_id.clone(), LinkTarget::Identifier(target), "is_part_of"));
            }
        }

        for text in &dc.description {
            ingestion.side_records.push(SideRecord {
                from: pub_id.clone(),
                kind: "description".to_string(),
                payload: json!({ "text": text.trim() }),
            });
        }

        Ok(DerivedRecord {
            id: pub_id,
            kind: EntityKind::Publication,
            label: data.label(),
            payload: raw.metadata.clone(),
            archived_at: None,
            identifiers,
            ingestion,
        })
    }
}

/// "Main title : subtitle" as catalogued in many DC exports.
fn split_title(title: &str) -> (String, Option<String>) {
    match title.split_once(" : ") {
        Some((main, sub)) => (main.trim().to_string(), Some(sub.trim().to_string())),
        None => (title.trim().to_string(), None),
    }
}

fn year_of(date: &str) -> Option<String> {
    let year: String = date.trim().chars().take(4).collect();
    (year.len() == 4 && year.chars().all(|c| c.is_ascii_digit())).then_some(year)
}

/// Dedup key for names: lowercase, single-spaced.
fn name_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Recognize ISBN, ISSN and URI identifiers in free-form `dc:identifier` values.
pub(crate) fn classify_identifier(value: &str) -> Option<ExternalId> {
    let v = value.trim();
    let lower = v.to_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(ExternalId::new("uri", v));
    }
    for (scheme, prefixes) in [
        ("isbn", ["urn:isbn:", "isbn:", "isbn "]),
        ("issn", ["urn:issn:", "issn:", "issn "]),
    ] {
        for prefix in prefixes {
            if let Some(rest) = lower.strip_prefix(prefix) {
                let normalized: String = rest
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .collect::<String>()
                    .to_uppercase();
                if normalized.is_empty() {
                    return None;
                }
                return Some(ExternalId::new(scheme, normalized));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, metadata: &str) -> RawRecord {
        RawRecord {
            identifier: id.to_string(),
            datestamp: "2024-02-28".to_string(),
            deleted: false,
            metadata: metadata.to_string(),
        }
    }

    const DC: &str = r#"<oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/">
        <dc:title>Markens grøde : roman</dc:title>
        <dc:creator>Hamsun,  Knut</dc:creator>
        <dc:contributor>Nilsen, Ola</dc:contributor>
        <dc:publisher>Gyldendal</dc:publisher>
        <dc:date>1917-11-01</dc:date>
        <dc:language>nob</dc:language>
        <dc:identifier>ISBN 978-82-05-00000-1</dc:identifier>
        <dc:identifier>https://example.org/bib/1</dc:identifier>
        <dc:identifier>local-123</dc:identifier>
        <dc:relation>urn:issn:0333-1234</dc:relation>
        <dc:description>A &quot;novel&quot; of the soil.</dc:description>
    </oai_dc:dc>"#;

    #[test]
    fn derives_publication_graph() {
        let rec = DublinCore.transform(&raw("oai:x:1", DC)).unwrap();
        assert_eq!(rec.id, "oai:x:1");
        assert_eq!(rec.kind, EntityKind::Publication);
        assert_eq!(rec.label, "Markens grøde: roman (1917)");
        assert!(!rec.is_archived());
        assert_eq!(
            rec.identifiers,
            vec![
                ExternalId::new("isbn", "9788205000001"),
                ExternalId::new("uri", "https://example.org/bib/1"),
            ]
        );

        let ing = &rec.ingestion;
        assert_eq!(ing.entities.len(), 4);
        assert!(ing.entities[0].primary);
        assert_eq!(ing.entities[1].label, "Hamsun,  Knut");
        assert_eq!(ing.entities[1].identifiers, vec![ExternalId::new("name", "hamsun, knut")]);
        assert_eq!(ing.entities[3].kind(), EntityKind::Publisher);

        let kinds: Vec<_> = ing.links.iter().map(|l| l.kind.as_str()).collect();
        assert_eq!(kinds, vec!["has_contributor", "has_contributor", "published_by", "is_part_of"]);
        assert_eq!(ing.links[1].payload["role"], "contributor");
        assert_eq!(
            ing.links[3].to,
            LinkTarget::Identifier(ExternalId::new("issn", "03331234"))
        );

        assert_eq!(ing.side_records.len(), 1);
        assert_eq!(ing.side_records[0].payload["text"], "A \"novel\" of the soil.");
    }

    #[test]
    fn deleted_record_is_tombstone_at_datestamp() {
        let mut r = raw("oai:x:2", "");
        r.deleted = true;
        let rec = DublinCore.transform(&r).unwrap();
        assert!(rec.is_archived());
        assert_eq!(rec.archived_at.unwrap().format("%Y-%m-%d").to_string(), "2024-02-28");
    }

    #[test]
    fn missing_title_is_an_error() {
        let err = DublinCore
            .transform(&raw("oai:x:3", "<oai_dc:dc><dc:creator>Someone</dc:creator></oai_dc:dc>"))
            .unwrap_err();
        assert!(matches!(err, TransformError::MissingField { field: "title", .. }));
    }

    #[test]
    fn broken_metadata_is_malformed() {
        let err = DublinCore
            .transform(&raw("oai:x:4", "<oai_dc:dc><dc:title>x</dc:creator></oai_dc:dc>"))
            .unwrap_err();
        assert!(matches!(err, TransformError::Malformed { .. }));
    }

    #[test]
    fn identifier_classification() {
        assert_eq!(classify_identifier("urn:isbn:82-05-12345-x"), Some(ExternalId::new("isbn", "820512345X")));
        assert_eq!(classify_identifier("ISSN 1234-5678"), Some(ExternalId::new("issn", "12345678")));
        assert_eq!(classify_identifier("isbn:"), None);
        assert_eq!(classify_identifier("doi:10.1000/1"), None);
    }
}
