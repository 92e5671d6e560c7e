//! Streaming decoder for OAI-PMH `ListRecords` / `GetRecord` responses.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use bibsync_core::RawRecord;

use crate::error::HarvestError;

/// Decoded response body. `error` holds the OAI `<error code=..>` if present.
#[derive(Debug, Default)]
pub(crate) struct OaiResponse {
    pub(crate) records: Vec<RawRecord>,
    pub(crate) token: String,
    pub(crate) error: Option<(String, String)>,
}

#[derive(Clone, Copy)]
enum Field {
    Identifier,
    Datestamp,
    Token,
    Error,
}

pub(crate) fn parse_response(xml: &str) -> Result<OaiResponse, HarvestError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut response = OaiResponse::default();
    let mut current: Option<RawRecord> = None;
    let mut in_header = false;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"record" => current = Some(empty_record()),
                b"header" => {
                    in_header = true;
                    if let Some(rec) = current.as_mut() {
                        rec.deleted = is_deleted(&e)?;
                    }
                }
                b"identifier" if in_header => field = Some(Field::Identifier),
                b"datestamp" if in_header => field = Some(Field::Datestamp),
                b"metadata" => {
                    // Keep the payload verbatim; transformers decode it.
                    let end = e.to_end().into_owned();
                    let inner = reader.read_text(end.name())?;
                    if let Some(rec) = current.as_mut() {
                        rec.metadata = inner.trim().to_string();
                    }
                }
                b"resumptionToken" => field = Some(Field::Token),
                b"error" => {
                    response.error = Some((attr(&e, b"code")?, String::new()));
                    field = Some(Field::Error);
                }
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"header" => {
                    if let Some(rec) = current.as_mut() {
                        rec.deleted = is_deleted(&e)?;
                    }
                }
                b"error" => response.error = Some((attr(&e, b"code")?, String::new())),
                _ => {}
            },
            Event::Text(t) => {
                let text = t.unescape()?;
                match (field, current.as_mut()) {
                    (Some(Field::Identifier), Some(rec)) => rec.identifier.push_str(&text),
                    (Some(Field::Datestamp), Some(rec)) => rec.datestamp.push_str(&text),
                    (Some(Field::Token), _) => response.token.push_str(&text),
                    (Some(Field::Error), _) => {
                        if let Some((_, message)) = response.error.as_mut() {
                            message.push_str(&text);
                        }
                    }
                    _ => {}
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"record" => {
                    if let Some(rec) = current.take() {
                        response.records.push(rec);
                    }
                }
                b"header" => in_header = false,
                b"identifier" | b"datestamp" | b"resumptionToken" | b"error" => field = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(response)
}

fn empty_record() -> RawRecord {
    RawRecord {
        identifier: String::new(),
        datestamp: String::new(),
        deleted: false,
        metadata: String::new(),
    }
}

fn is_deleted(e: &BytesStart<'_>) -> Result<bool, HarvestError> {
    Ok(attr(e, b"status")? == "deleted")
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Result<String, HarvestError> {
    match e.try_get_attribute(name)? {
        Some(a) => Ok(a.unescape_value()?.into_owned()),
        None => Ok(String::new()),
    }
}
