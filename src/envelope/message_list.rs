//! Typed `MessageList` payload.
//!
//! Each `Message` element describes one queued message. Entries missing a
//! mandatory field are reported individually as [`EntryFault`]s; the rest of
//! the batch is still usable.

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;

use super::NOUN_MESSAGE_LIST;
use crate::error::ValidationFault;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageListEntry {
    /// Server-assigned, strictly increasing per endpoint. Used as watermark.
    pub code: u64,
    pub message_identification: String,
    pub version: Option<String>,
    pub status: Option<String>,
    pub application_start: DateTime<Utc>,
    pub application_end: Option<DateTime<Utc>>,
    pub server_timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub message_type: String,
    pub owner: String,
}

/// An entry that could not be used.
pub type EntryFault = ValidationFault;

#[derive(Default)]
struct PartialEntry {
    code: Option<u64>,
    message_identification: Option<String>,
    version: Option<String>,
    status: Option<String>,
    application_start: Option<DateTime<Utc>>,
    application_end: Option<DateTime<Utc>>,
    server_timestamp: Option<DateTime<Utc>>,
    message_type: Option<String>,
    owner: Option<String>,
}

impl PartialEntry {
    fn finish(self) -> Result<MessageListEntry, EntryFault> {
        let mut missing = Vec::new();
        if self.code.is_none() {
            missing.push("Code");
        }
        if self.message_identification.is_none() {
            missing.push("MessageIdentification");
        }
        if self.message_type.is_none() {
            missing.push("Type");
        }
        if self.application_start.is_none() {
            missing.push("ApplicationTimeInterval.start");
        }
        if self.server_timestamp.is_none() {
            missing.push("ServerTimestamp");
        }
        if self.owner.is_none() {
            missing.push("Owner");
        }

        match self {
            PartialEntry {
                code: Some(code),
                message_identification: Some(message_identification),
                version,
                status,
                application_start: Some(application_start),
                application_end,
                server_timestamp: Some(server_timestamp),
                message_type: Some(message_type),
                owner: Some(owner),
            } => Ok(MessageListEntry {
                code,
                message_identification,
                version,
                status,
                application_start,
                application_end,
                server_timestamp,
                message_type,
                owner,
            }),
            partial => Err(ValidationFault::MissingEntryFields {
                code: partial.code,
                fields: missing,
            }),
        }
    }
}

/// Entries and per-entry faults of one list payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedList {
    pub entries: Vec<MessageListEntry>,
    pub faults: Vec<EntryFault>,
}

fn malformed(reason: impl std::fmt::Display) -> ValidationFault {
    ValidationFault::MalformedEnvelope(format!("message list: {reason}"))
}

fn text<'a>(reader: &mut Reader<&'a [u8]>, start: &BytesStart<'a>) -> Result<String, ValidationFault> {
    let raw = reader.read_text(start.name()).map_err(malformed)?;
    Ok(quick_xml::escape::unescape(&raw)
        .map_err(malformed)?
        .trim()
        .to_string())
}

/// Empty or unparseable values count as absent.
fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn time(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Parse a `MessageList` document.
pub fn parse(xml: &str) -> Result<ParsedList, ValidationFault> {
    let mut reader = Reader::from_str(xml);
    let mut list = ParsedList::default();

    // Root
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) if e.local_name().as_ref() == NOUN_MESSAGE_LIST.as_bytes() => break,
            Event::Empty(e) if e.local_name().as_ref() == NOUN_MESSAGE_LIST.as_bytes() => {
                return Ok(list);
            }
            Event::Start(e) | Event::Empty(e) => {
                return Err(malformed(format!(
                    "unexpected root {}",
                    String::from_utf8_lossy(e.local_name().as_ref())
                )));
            }
            Event::Eof => return Err(malformed("document is empty")),
            _ => {}
        }
    }

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) if e.local_name().as_ref() == b"Message" => {
                match parse_entry(&mut reader)?.finish() {
                    Ok(entry) => list.entries.push(entry),
                    Err(fault) => list.faults.push(fault),
                }
            }
            Event::Empty(e) if e.local_name().as_ref() == b"Message" => {
                if let Err(fault) = PartialEntry::default().finish() {
                    list.faults.push(fault);
                }
            }
            Event::Start(e) => {
                reader.read_to_end(e.name()).map_err(malformed)?;
            }
            Event::End(_) => break,
            Event::Eof => return Err(malformed("document is truncated")),
            _ => {}
        }
    }

    Ok(list)
}

fn parse_entry(reader: &mut Reader<&[u8]>) -> Result<PartialEntry, ValidationFault> {
    let mut entry = PartialEntry::default();
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"Code" => entry.code = text(reader, &e)?.parse().ok(),
                b"MessageIdentification" => {
                    entry.message_identification = non_empty(text(reader, &e)?);
                }
                b"Version" => entry.version = non_empty(text(reader, &e)?),
                b"Status" => entry.status = non_empty(text(reader, &e)?),
                b"ApplicationTimeInterval" => loop {
                    match reader.read_event().map_err(malformed)? {
                        Event::Start(c) => match c.local_name().as_ref() {
                            b"start" => entry.application_start = time(text(reader, &c)?),
                            b"end" => entry.application_end = time(text(reader, &c)?),
                            _ => {
                                reader.read_to_end(c.name()).map_err(malformed)?;
                            }
                        },
                        Event::End(_) => break,
                        Event::Eof => return Err(malformed("interval is truncated")),
                        _ => {}
                    }
                },
                b"ServerTimestamp" => entry.server_timestamp = time(text(reader, &e)?),
                b"Type" => entry.message_type = non_empty(text(reader, &e)?),
                b"Owner" => entry.owner = non_empty(text(reader, &e)?),
                _ => {
                    reader.read_to_end(e.name()).map_err(malformed)?;
                }
            },
            Event::End(_) => break,
            Event::Eof => return Err(malformed("entry is truncated")),
            _ => {}
        }
    }
    Ok(entry)
}

/// Serialize entries as a `MessageList` document.
pub fn render(entries: &[MessageListEntry]) -> String {
    fn time(t: &DateTime<Utc>) -> String {
        t.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    let mut xml = String::from("<MessageList>");
    for e in entries {
        xml.push_str("<Message>");
        xml.push_str(&format!("<Code>{}</Code>", e.code));
        xml.push_str(&format!(
            "<MessageIdentification>{}</MessageIdentification>",
            escape(e.message_identification.as_str())
        ));
        if let Some(v) = &e.version {
            xml.push_str(&format!("<Version>{}</Version>", escape(v.as_str())));
        }
        if let Some(s) = &e.status {
            xml.push_str(&format!("<Status>{}</Status>", escape(s.as_str())));
        }
        xml.push_str("<ApplicationTimeInterval>");
        xml.push_str(&format!("<start>{}</start>", time(&e.application_start)));
        if let Some(end) = &e.application_end {
            xml.push_str(&format!("<end>{}</end>", time(end)));
        }
        xml.push_str("</ApplicationTimeInterval>");
        xml.push_str(&format!(
            "<ServerTimestamp>{}</ServerTimestamp>",
            time(&e.server_timestamp)
        ));
        xml.push_str(&format!("<Type>{}</Type>", escape(e.message_type.as_str())));
        xml.push_str(&format!("<Owner>{}</Owner>", escape(e.owner.as_str())));
        xml.push_str("</Message>");
    }
    xml.push_str("</MessageList>");
    xml
}
