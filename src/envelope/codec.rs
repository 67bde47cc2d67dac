//! SOAP wire codec.
//!
//! Wire format: SOAP 1.1 envelope whose body holds exactly one
//! `RequestMessage`, `ResponseMessage` or `Fault` element. Message children
//! live in the IEC message namespace; only local names are significant when
//! decoding.
//!
//! ```text
//! Envelope
//! +-- Header                      (empty, room for the signature block)
//! +-- Body
//!     +-- RequestMessage | ResponseMessage
//!         +-- Header(Verb, Noun, Timestamp?)
//!         +-- Request(StartTime?, EndTime?, Option*, ID*)
//!         +-- Reply(Result, ID*, Error*)
//!         +-- Payload(<inline element> | Compressed, format?, fileName?)
//! ```
//!
//! Encoders always emit `<soapenv:Header></soapenv:Header>` so a signature
//! service can splice its block in without reserializing the document.

use std::fmt::Display;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::escape::unescape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use super::{
    Body, Header, Payload, PayloadContent, Reply, ReplyError, Request, RequestEnvelope,
    ResponseEnvelope, SoapFault, Verb,
};
use crate::error::ValidationFault;

pub const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const MESSAGE_NS: &str = "http://iec.ch/TC57/2011/schema/message";

/// Tag that opens the (initially empty) SOAP header.
pub const SOAP_HEADER_OPEN: &str = "<soapenv:Header>";

type Result<T> = std::result::Result<T, ValidationFault>;

/// A decoded response body: either a message or a SOAP fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Response(ResponseEnvelope),
    Fault(SoapFault),
}

fn malformed<E: Display>(e: E) -> ValidationFault {
    ValidationFault::MalformedEnvelope(e.to_string())
}

// =============================================================================
// Encoding
// =============================================================================

struct Emitter {
    writer: Writer<Vec<u8>>,
}

impl Emitter {
    fn new() -> Self {
        Self {
            writer: Writer::new(Vec::with_capacity(1024)),
        }
    }

    fn event(&mut self, event: Event<'_>) -> Result<()> {
        self.writer.write_event(event).map_err(malformed)
    }

    fn open(&mut self, name: &str) -> Result<()> {
        self.event(Event::Start(BytesStart::new(name)))
    }

    fn close(&mut self, name: &str) -> Result<()> {
        self.event(Event::End(BytesEnd::new(name)))
    }

    fn text_element(&mut self, name: &str, text: &str) -> Result<()> {
        self.open(name)?;
        self.event(Event::Text(BytesText::new(text)))?;
        self.close(name)
    }

    fn id_element(&mut self, id_type: &str, value: &str) -> Result<()> {
        let mut start = BytesStart::new("msg:ID");
        start.push_attribute(("idType", id_type));
        self.event(Event::Start(start))?;
        self.event(Event::Text(BytesText::new(value)))?;
        self.close("msg:ID")
    }

    /// Embed an already-serialized element verbatim.
    fn raw(&mut self, xml: &str) {
        self.writer.get_mut().extend_from_slice(xml.as_bytes());
    }

    fn envelope<F>(mut self, body: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&mut Emitter) -> Result<()>,
    {
        self.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let mut root = BytesStart::new("soapenv:Envelope");
        root.push_attribute(("xmlns:soapenv", SOAP_NS));
        root.push_attribute(("xmlns:msg", MESSAGE_NS));
        self.event(Event::Start(root))?;
        self.open("soapenv:Header")?;
        self.close("soapenv:Header")?;
        self.open("soapenv:Body")?;
        body(&mut self)?;
        self.close("soapenv:Body")?;
        self.close("soapenv:Envelope")?;
        Ok(self.writer.into_inner())
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn write_header(out: &mut Emitter, header: &Header) -> Result<()> {
    out.open("msg:Header")?;
    out.text_element("msg:Verb", header.verb.as_str())?;
    out.text_element("msg:Noun", &header.noun)?;
    if let Some(ts) = &header.timestamp {
        out.text_element("msg:Timestamp", &format_time(ts))?;
    }
    out.close("msg:Header")
}

fn write_request(out: &mut Emitter, request: &Request) -> Result<()> {
    out.open("msg:Request")?;
    if let Some(start) = request.start_time() {
        out.text_element("msg:StartTime", &format_time(&start))?;
    }
    if let Some(end) = request.end_time() {
        out.text_element("msg:EndTime", &format_time(&end))?;
    }
    for (name, value) in request.options() {
        out.open("msg:Option")?;
        out.text_element("msg:name", name)?;
        out.text_element("msg:value", value)?;
        out.close("msg:Option")?;
    }
    for (id_type, value) in request.ids() {
        out.id_element(id_type, value)?;
    }
    out.close("msg:Request")
}

fn write_payload(out: &mut Emitter, payload: &Payload) -> Result<()> {
    out.open("msg:Payload")?;
    match payload.content() {
        PayloadContent::Inline { xml, .. } => out.raw(xml),
        PayloadContent::Compressed(bytes) => {
            out.text_element("msg:Compressed", &STANDARD.encode(bytes))?;
        }
    }
    if let Some(format) = payload.format() {
        out.text_element("msg:format", format)?;
    }
    if let Some(name) = payload.file_name() {
        out.text_element("msg:fileName", name)?;
    }
    out.close("msg:Payload")
}

fn write_reply(out: &mut Emitter, reply: &Reply) -> Result<()> {
    out.open("msg:Reply")?;
    out.text_element("msg:Result", &reply.result)?;
    for (id_type, value) in &reply.ids {
        out.id_element(id_type, value)?;
    }
    for error in &reply.errors {
        out.open("msg:Error")?;
        out.text_element("msg:code", &error.code)?;
        if let Some(details) = &error.details {
            out.text_element("msg:details", details)?;
        }
        out.close("msg:Error")?;
    }
    out.close("msg:Reply")
}

/// Serialize a request envelope.
pub fn encode_request(envelope: &RequestEnvelope) -> Result<Vec<u8>> {
    Emitter::new().envelope(|out| {
        out.open("msg:RequestMessage")?;
        write_header(out, &envelope.header)?;
        match &envelope.body {
            Body::Request(request) => write_request(out, request)?,
            Body::Payload(payload) => write_payload(out, payload)?,
        }
        out.close("msg:RequestMessage")
    })
}

/// Serialize a response envelope.
pub fn encode_response(envelope: &ResponseEnvelope) -> Result<Vec<u8>> {
    Emitter::new().envelope(|out| {
        out.open("msg:ResponseMessage")?;
        if let Some(header) = &envelope.header {
            write_header(out, header)?;
        }
        if let Some(reply) = &envelope.reply {
            write_reply(out, reply)?;
        }
        if let Some(payload) = &envelope.payload {
            write_payload(out, payload)?;
        }
        out.close("msg:ResponseMessage")
    })
}

/// Serialize a SOAP fault.
pub fn encode_fault(code: &str, message: &str, detail: Option<&str>) -> Result<Vec<u8>> {
    Emitter::new().envelope(|out| {
        out.open("soapenv:Fault")?;
        out.text_element("faultcode", code)?;
        out.text_element("faultstring", message)?;
        if let Some(detail) = detail {
            out.text_element("detail", detail)?;
        }
        out.close("soapenv:Fault")
    })
}

// =============================================================================
// Decoding
// =============================================================================

struct Parser<'a> {
    src: &'a str,
    reader: Reader<&'a [u8]>,
}

impl<'a> Parser<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self> {
        let src = std::str::from_utf8(bytes).map_err(malformed)?;
        Ok(Self::over(src))
    }

    fn over(src: &'a str) -> Self {
        Self {
            src,
            reader: Reader::from_str(src),
        }
    }

    /// Next event together with the byte offset where it starts.
    fn next(&mut self) -> Result<(usize, Event<'a>)> {
        let pos = self.reader.buffer_position() as usize;
        let event = self.reader.read_event().map_err(malformed)?;
        Ok((pos, event))
    }

    fn text(&mut self, start: &BytesStart<'a>) -> Result<String> {
        let raw = self.reader.read_text(start.name()).map_err(malformed)?;
        Ok(unescape(&raw).map_err(malformed)?.trim().to_string())
    }

    fn skip(&mut self, start: &BytesStart<'a>) -> Result<()> {
        self.reader.read_to_end(start.name()).map_err(malformed)?;
        Ok(())
    }

    /// Consume the element opened at `pos` and return it verbatim.
    fn raw_element(&mut self, pos: usize, start: &BytesStart<'a>) -> Result<String> {
        self.skip(start)?;
        Ok(self.src[pos..self.position()].to_string())
    }

    fn position(&self) -> usize {
        self.reader.buffer_position() as usize
    }

    /// Walk to the first element inside the SOAP body.
    ///
    /// Returns its offset, start tag and whether it was self-closing.
    fn enter_body(&mut self) -> Result<(usize, BytesStart<'a>, bool)> {
        let mut seen_envelope = false;
        loop {
            let (_, event) = self.next()?;
            match event {
                Event::Start(e) if !seen_envelope => {
                    if e.local_name().as_ref() != b"Envelope" {
                        return Err(malformed("document is not a SOAP envelope"));
                    }
                    seen_envelope = true;
                }
                Event::Start(e) if e.local_name().as_ref() == b"Body" => {
                    return self.first_child();
                }
                Event::Start(e) => self.skip(&e)?,
                Event::Empty(_) if !seen_envelope => {
                    return Err(malformed("document is not a SOAP envelope"));
                }
                Event::Empty(e) if e.local_name().as_ref() == b"Body" => {
                    return Err(malformed("SOAP body is empty"));
                }
                Event::Eof => return Err(malformed("document has no SOAP body")),
                _ => {}
            }
        }
    }

    fn first_child(&mut self) -> Result<(usize, BytesStart<'a>, bool)> {
        loop {
            let (pos, event) = self.next()?;
            match event {
                Event::Start(e) => return Ok((pos, e, false)),
                Event::Empty(e) => return Ok((pos, e, true)),
                Event::End(_) => return Err(malformed("SOAP body is empty")),
                Event::Eof => return Err(malformed("SOAP body is truncated")),
                _ => {}
            }
        }
    }

    fn fault(&mut self, pos: usize, empty: bool) -> Result<SoapFault> {
        let mut fault = SoapFault {
            code: String::new(),
            message: String::new(),
            detail: None,
            raw: String::new(),
        };
        if !empty {
            loop {
                match self.next()? {
                    (_, Event::Start(c)) => match c.local_name().as_ref() {
                        b"faultcode" => fault.code = self.text(&c)?,
                        b"faultstring" => fault.message = self.text(&c)?,
                        b"detail" => {
                            let raw = self.reader.read_text(c.name()).map_err(malformed)?;
                            fault.detail = Some(raw.trim().to_string());
                        }
                        _ => self.skip(&c)?,
                    },
                    (_, Event::End(_)) => break,
                    (_, Event::Eof) => return Err(malformed("fault is truncated")),
                    _ => {}
                }
            }
        }
        fault.raw = self.src[pos..self.position()].to_string();
        Ok(fault)
    }

    fn header(&mut self) -> Result<Header> {
        let mut verb = None;
        let mut noun = None;
        let mut timestamp = None;
        loop {
            match self.next()? {
                (_, Event::Start(c)) => match c.local_name().as_ref() {
                    b"Verb" => verb = Some(Verb::parse(&self.text(&c)?)),
                    b"Noun" => noun = Some(self.text(&c)?),
                    b"Timestamp" => timestamp = Some(parse_time(&self.text(&c)?)?),
                    _ => self.skip(&c)?,
                },
                (_, Event::End(_)) => break,
                (_, Event::Eof) => return Err(malformed("header is truncated")),
                _ => {}
            }
        }
        Ok(Header {
            verb: verb.ok_or_else(|| malformed("header has no verb"))?,
            noun: noun.ok_or_else(|| malformed("header has no noun"))?,
            timestamp,
        })
    }

    fn id(&mut self, start: &BytesStart<'a>, empty: bool) -> Result<(String, String)> {
        let mut id_type = String::new();
        for attr in start.attributes() {
            let attr = attr.map_err(malformed)?;
            if attr.key.local_name().as_ref() == b"idType" {
                id_type = attr.unescape_value().map_err(malformed)?.into_owned();
            }
        }
        let value = if empty { String::new() } else { self.text(start)? };
        Ok((id_type, value))
    }

    fn reply(&mut self) -> Result<Reply> {
        let mut reply = Reply {
            result: String::new(),
            ids: Vec::new(),
            errors: Vec::new(),
        };
        loop {
            match self.next()? {
                (_, Event::Start(c)) => match c.local_name().as_ref() {
                    b"Result" => reply.result = self.text(&c)?,
                    b"ID" => reply.ids.push(self.id(&c, false)?),
                    b"Error" => reply.errors.push(self.reply_error()?),
                    _ => self.skip(&c)?,
                },
                (_, Event::Empty(c)) if c.local_name().as_ref() == b"ID" => {
                    reply.ids.push(self.id(&c, true)?);
                }
                (_, Event::End(_)) => break,
                (_, Event::Eof) => return Err(malformed("reply is truncated")),
                _ => {}
            }
        }
        Ok(reply)
    }

    fn reply_error(&mut self) -> Result<ReplyError> {
        let mut error = ReplyError {
            code: String::new(),
            details: None,
        };
        loop {
            match self.next()? {
                (_, Event::Start(c)) => match c.local_name().as_ref() {
                    b"code" => error.code = self.text(&c)?,
                    b"details" => error.details = Some(self.text(&c)?),
                    _ => self.skip(&c)?,
                },
                (_, Event::End(_)) => break,
                (_, Event::Eof) => return Err(malformed("reply error is truncated")),
                _ => {}
            }
        }
        Ok(error)
    }

    fn payload(&mut self) -> Result<Option<Payload>> {
        let mut inline = None;
        let mut compressed = None;
        let mut format = None;
        let mut file_name = None;
        loop {
            match self.next()? {
                (pos, Event::Start(c)) => match c.local_name().as_ref() {
                    b"Compressed" => compressed = Some(decode_base64(&self.text(&c)?)?),
                    b"format" => format = Some(self.text(&c)?),
                    b"fileName" => file_name = Some(self.text(&c)?),
                    _ if inline.is_none() => inline = Some(self.raw_element(pos, &c)?),
                    _ => self.skip(&c)?,
                },
                (pos, Event::Empty(c)) => match c.local_name().as_ref() {
                    b"Compressed" => compressed = Some(Vec::new()),
                    b"format" | b"fileName" => {}
                    _ if inline.is_none() => {
                        inline = Some(self.src[pos..self.position()].to_string());
                    }
                    _ => {}
                },
                (_, Event::End(_)) => break,
                (_, Event::Eof) => return Err(malformed("payload is truncated")),
                _ => {}
            }
        }
        Payload::from_parts(inline, compressed, format, file_name)
    }

    fn request(&mut self) -> Result<Request> {
        let mut request = Request::new();
        loop {
            match self.next()? {
                (_, Event::Start(c)) => match c.local_name().as_ref() {
                    b"StartTime" => request = request.with_start_time(parse_time(&self.text(&c)?)?),
                    b"EndTime" => request = request.with_end_time(parse_time(&self.text(&c)?)?),
                    b"Option" => {
                        let (name, value) = self.option()?;
                        request = request.with_option(name, value)?;
                    }
                    b"ID" => {
                        let (id_type, value) = self.id(&c, false)?;
                        request = request.with_id(id_type, value);
                    }
                    _ => self.skip(&c)?,
                },
                (_, Event::Empty(c)) if c.local_name().as_ref() == b"ID" => {
                    let (id_type, value) = self.id(&c, true)?;
                    request = request.with_id(id_type, value);
                }
                (_, Event::End(_)) => break,
                (_, Event::Eof) => return Err(malformed("request is truncated")),
                _ => {}
            }
        }
        Ok(request)
    }

    fn option(&mut self) -> Result<(String, String)> {
        let mut name = None;
        let mut value = String::new();
        loop {
            match self.next()? {
                (_, Event::Start(c)) => match c.local_name().as_ref() {
                    b"name" => name = Some(self.text(&c)?),
                    b"value" => value = self.text(&c)?,
                    _ => self.skip(&c)?,
                },
                (_, Event::End(_)) => break,
                (_, Event::Eof) => return Err(malformed("option is truncated")),
                _ => {}
            }
        }
        let name = name.ok_or_else(|| malformed("option has no name"))?;
        Ok((name, value))
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| malformed(format!("invalid timestamp {s:?}: {e}")))
}

fn decode_base64(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|e| malformed(format!("invalid base64 content: {e}")))
}

/// Decode a response body into a message or a SOAP fault.
pub fn decode_response(bytes: &[u8]) -> Result<Decoded> {
    let mut parser = Parser::new(bytes)?;
    let (pos, first, empty) = parser.enter_body()?;

    match first.local_name().as_ref() {
        b"Fault" => Ok(Decoded::Fault(parser.fault(pos, empty)?)),
        b"ResponseMessage" => {
            let mut envelope = ResponseEnvelope::default();
            if empty {
                return Ok(Decoded::Response(envelope));
            }
            loop {
                match parser.next()? {
                    (_, Event::Start(c)) => match c.local_name().as_ref() {
                        b"Header" => envelope.header = Some(parser.header()?),
                        b"Reply" => envelope.reply = Some(parser.reply()?),
                        b"Payload" => envelope.payload = parser.payload()?,
                        _ => parser.skip(&c)?,
                    },
                    (_, Event::End(_)) => break,
                    (_, Event::Eof) => return Err(malformed("response message is truncated")),
                    _ => {}
                }
            }
            Ok(Decoded::Response(envelope))
        }
        other => Err(malformed(format!(
            "unexpected body element {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Only the fault, if the body holds one. Anything else (including
/// documents that do not parse) yields `None`.
pub fn decode_fault(bytes: &[u8]) -> Option<SoapFault> {
    let mut parser = Parser::new(bytes).ok()?;
    let (pos, first, empty) = parser.enter_body().ok()?;
    if first.local_name().as_ref() != b"Fault" {
        return None;
    }
    parser.fault(pos, empty).ok()
}

/// Decode a request envelope (used by endpoint-side tooling and tests).
pub fn decode_request(bytes: &[u8]) -> Result<RequestEnvelope> {
    let mut parser = Parser::new(bytes)?;
    let (_, first, empty) = parser.enter_body()?;
    if first.local_name().as_ref() != b"RequestMessage" || empty {
        return Err(malformed("body is not a request message"));
    }

    let mut header = None;
    let mut body = None;
    loop {
        match parser.next()? {
            (_, Event::Start(c)) => match c.local_name().as_ref() {
                b"Header" => header = Some(parser.header()?),
                b"Request" => body = Some(Body::Request(parser.request()?)),
                b"Payload" => {
                    let payload = parser
                        .payload()?
                        .ok_or_else(|| malformed("request payload is empty"))?;
                    body = Some(Body::Payload(payload));
                }
                _ => parser.skip(&c)?,
            },
            (_, Event::Empty(c)) if c.local_name().as_ref() == b"Request" => {
                body = Some(Body::Request(Request::new()));
            }
            (_, Event::End(_)) => break,
            (_, Event::Eof) => return Err(malformed("request message is truncated")),
            _ => {}
        }
    }

    Ok(RequestEnvelope {
        header: header.ok_or_else(|| malformed("request has no header"))?,
        body: body.ok_or_else(|| malformed("request has no body"))?,
    })
}

/// Local name of the first element of an XML fragment.
pub fn root_local_name(xml: &str) -> Result<String> {
    let mut parser = Parser::over(xml);
    loop {
        match parser.next()? {
            (_, Event::Start(e)) | (_, Event::Empty(e)) => {
                return Ok(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            (_, Event::Eof) => return Err(malformed("payload has no root element")),
            _ => {}
        }
    }
}
