//! Envelope model for the message exchange protocol.
//!
//! Every exchange carries one `Header(verb, noun)`. Requests have either a
//! `Request` body (options, ids, time bounds) or a `Payload`; responses carry
//! an optional `Reply` and an optional `Payload`.
//!
//! Wire format lives in [`codec`], the typed message list in
//! [`message_list`].

pub mod codec;
pub mod message_list;

use std::fmt;
use std::io::Read;

use chrono::{DateTime, Utc};

use crate::error::ValidationFault;

pub use message_list::{EntryFault, MessageListEntry};

/// Noun used by get and query requests that do not target a specific type.
pub const NOUN_ANY: &str = "Any";

/// Reserved noun/root tag for compressed payloads.
pub const NOUN_COMPRESSED: &str = "Compressed";

/// Reserved noun for list responses.
pub const NOUN_MESSAGE_LIST: &str = "MessageList";

/// Reply result values.
pub const RESULT_OK: &str = "OK";
pub const RESULT_FAILED: &str = "FAILED";

/// Format tag for XML content carried in a compressed payload.
pub const FORMAT_XML: &str = "XML";

/// zstd level for outgoing attachments.
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Reply,
    Other(String),
}

impl Verb {
    pub fn parse(s: &str) -> Self {
        match s {
            "get" => Verb::Get,
            "create" => Verb::Create,
            "reply" => Verb::Reply,
            other => Verb::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Verb::Get => "get",
            Verb::Create => "create",
            Verb::Reply => "reply",
            Verb::Other(s) => s,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub verb: Verb,
    pub noun: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Header {
    pub fn new(verb: Verb, noun: impl Into<String>) -> Self {
        Self {
            verb,
            noun: noun.into(),
            timestamp: None,
        }
    }
}

/// Request body: ordered options, typed ids and optional time bounds.
///
/// Option names are unique; [`Request::with_option`] rejects duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    options: Vec<(String, String)>,
    ids: Vec<(String, String)>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_option(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, ValidationFault> {
        let name = name.into();
        if self.options.iter().any(|(n, _)| *n == name) {
            return Err(ValidationFault::DuplicateOption(name));
        }
        self.options.push((name, value.into()));
        Ok(self)
    }

    pub fn with_id(mut self, id_type: impl Into<String>, value: impl Into<String>) -> Self {
        self.ids.push((id_type.into(), value.into()));
        self
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn with_end_time(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    /// Value of the named option, if present.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn ids(&self) -> &[(String, String)] {
        &self.ids
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }
}

/// Payload content. Inline XML and compressed content are exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadContent {
    /// Inline element, kept verbatim together with its root local name.
    Inline { xml: String, root: String },
    /// zstd-compressed bytes (base64 on the wire).
    Compressed(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    content: PayloadContent,
    format: Option<String>,
    file_name: Option<String>,
}

impl Payload {
    /// Wrap an inline XML document. The XML declaration, if any, is dropped.
    pub fn inline(xml: impl AsRef<str>) -> Result<Self, ValidationFault> {
        let xml = strip_declaration(xml.as_ref()).trim().to_string();
        let root = codec::root_local_name(&xml)?;
        Ok(Self {
            content: PayloadContent::Inline { xml, root },
            format: None,
            file_name: None,
        })
    }

    /// Compress raw content into a payload.
    pub fn compress(
        raw: &[u8],
        format: Option<String>,
        file_name: Option<String>,
    ) -> Result<Self, ValidationFault> {
        let compressed = zstd::encode_all(raw, COMPRESSION_LEVEL)
            .map_err(|e| ValidationFault::Compression(e.to_string()))?;
        Ok(Self::from_compressed(compressed, format, file_name))
    }

    /// Wrap content that is already compressed.
    pub fn from_compressed(
        compressed: Vec<u8>,
        format: Option<String>,
        file_name: Option<String>,
    ) -> Self {
        Self {
            content: PayloadContent::Compressed(compressed),
            format,
            file_name,
        }
    }

    /// Assemble a payload from decoded wire parts.
    ///
    /// Returns `Ok(None)` when neither content form is present.
    pub fn from_parts(
        inline: Option<String>,
        compressed: Option<Vec<u8>>,
        format: Option<String>,
        file_name: Option<String>,
    ) -> Result<Option<Self>, ValidationFault> {
        let payload = match (inline, compressed) {
            (Some(_), Some(_)) => return Err(ValidationFault::ConflictingPayload),
            (Some(xml), None) => {
                let mut payload = Self::inline(xml)?;
                payload.format = format;
                payload.file_name = file_name;
                payload
            }
            (None, Some(bytes)) => Self::from_compressed(bytes, format, file_name),
            (None, None) => return Ok(None),
        };
        Ok(Some(payload))
    }

    pub fn content(&self) -> &PayloadContent {
        &self.content
    }

    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.content, PayloadContent::Compressed(_))
    }

    /// True unless the format explicitly names something other than XML.
    pub fn is_xml_format(&self) -> bool {
        self.format
            .as_deref()
            .map_or(true, |f| f.eq_ignore_ascii_case(FORMAT_XML))
    }

    /// Root tag used for header validation: the local name of the inline
    /// element, or the compressed sentinel.
    pub fn root_tag(&self) -> &str {
        match &self.content {
            PayloadContent::Inline { root, .. } => root,
            PayloadContent::Compressed(_) => NOUN_COMPRESSED,
        }
    }

    /// Raw content: the inline XML bytes, or the decompressed bytes.
    pub fn decompress(&self) -> Result<Vec<u8>, ValidationFault> {
        match &self.content {
            PayloadContent::Inline { xml, .. } => Ok(xml.clone().into_bytes()),
            PayloadContent::Compressed(bytes) => {
                let mut decoder = zstd::Decoder::new(bytes.as_slice())
                    .map_err(|e| ValidationFault::Compression(e.to_string()))?;
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| ValidationFault::Compression(e.to_string()))?;
                Ok(out)
            }
        }
    }

    /// Content as text, for payloads that carry XML either inline or
    /// compressed.
    pub fn text(&self) -> Result<String, ValidationFault> {
        match &self.content {
            PayloadContent::Inline { xml, .. } => Ok(xml.clone()),
            PayloadContent::Compressed(_) => String::from_utf8(self.decompress()?)
                .map_err(|_| {
                    ValidationFault::MalformedEnvelope(
                        "compressed payload is not UTF-8 text".to_string(),
                    )
                }),
        }
    }
}

fn strip_declaration(xml: &str) -> &str {
    let trimmed = xml.trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return &trimmed[end + 2..];
        }
    }
    trimmed
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyError {
    pub code: String,
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub result: String,
    pub ids: Vec<(String, String)>,
    pub errors: Vec<ReplyError>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            result: RESULT_OK.to_string(),
            ids: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.result.eq_ignore_ascii_case(RESULT_FAILED)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Request(Request),
    Payload(Payload),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub header: Header,
    pub body: Body,
}

impl RequestEnvelope {
    pub fn request(verb: Verb, noun: impl Into<String>, request: Request) -> Self {
        Self {
            header: Header::new(verb, noun),
            body: Body::Request(request),
        }
    }

    /// Payload-carrying request. Inline payloads take their root tag as the
    /// noun; compressed payloads use the sentinel.
    pub fn payload(verb: Verb, payload: Payload) -> Self {
        Self {
            header: Header::new(verb, payload.root_tag()),
            body: Body::Payload(payload),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub header: Option<Header>,
    pub reply: Option<Reply>,
    pub payload: Option<Payload>,
}

impl ResponseEnvelope {
    /// A `reply` response whose noun follows the payload root tag.
    pub fn reply(payload: Option<Payload>, noun: &str) -> Self {
        Self {
            header: Some(Header::new(Verb::Reply, noun)),
            reply: Some(Reply::ok()),
            payload,
        }
    }
}

/// SOAP-level fault returned instead of a response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    /// The fault element as received.
    pub raw: String,
}
