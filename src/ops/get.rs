//! Get: fetch one message by identification, by code, or the next in queue.

use tracing::debug;

use super::{operation_client, option, Operation};
use crate::envelope::{Payload, PayloadContent, Request, RequestEnvelope, Verb, NOUN_ANY};
use crate::error::{Result, ValidationFault};
use crate::exchange::validate;
use crate::signing::Certificate;

/// Which message to fetch. The variants are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetSelector {
    MessageIdentification { id: String, version: Option<String> },
    Code(u64),
    NextInQueue,
}

impl GetSelector {
    fn request(&self) -> std::result::Result<Request, ValidationFault> {
        let request = Request::new();
        match self {
            GetSelector::MessageIdentification { id, version } => {
                let request = request.with_option(option::MESSAGE_IDENTIFICATION, id)?;
                match version {
                    Some(v) => request.with_option(option::VERSION, v),
                    None => Ok(request),
                }
            }
            GetSelector::Code(code) => request.with_option(option::CODE, code.to_string()),
            GetSelector::NextInQueue => request.with_option(option::QUEUE, option::QUEUE_NEXT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetContent {
    Xml(String),
    Binary {
        data: Vec<u8>,
        file_name: String,
        format: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct GetResult {
    /// Header noun of the response.
    pub noun: String,
    pub content: GetContent,
    /// Verified signer, when verification was enabled.
    pub signer: Option<Certificate>,
}

#[derive(Clone)]
pub struct GetClient {
    op: Operation,
}

operation_client!(GetClient);

impl GetClient {
    pub async fn get(&self, selector: &GetSelector) -> Result<GetResult> {
        let envelope = RequestEnvelope::request(Verb::Get, NOUN_ANY, selector.request()?);
        let exchange = self.op.send(&envelope).await?;
        validate(&exchange.response, None, false)?;

        let noun = exchange
            .response
            .header
            .map(|h| h.noun)
            .unwrap_or_default();
        let payload = exchange
            .response
            .payload
            .ok_or_else(|| ValidationFault::MissingPayload {
                verb: Verb::Reply.to_string(),
                noun: noun.clone(),
            })?;

        let content = content_of(&payload)?;
        debug!(?selector, noun = %noun, "Fetched message");
        Ok(GetResult {
            noun,
            content,
            signer: exchange.metadata.signature_certificate,
        })
    }
}

/// Compressed content is exposed as binary only when tagged non-XML.
fn content_of(payload: &Payload) -> std::result::Result<GetContent, ValidationFault> {
    match payload.content() {
        PayloadContent::Inline { xml, .. } => Ok(GetContent::Xml(xml.clone())),
        PayloadContent::Compressed(_) if !payload.is_xml_format() => {
            let file_name = payload
                .file_name()
                .filter(|n| !n.trim().is_empty())
                .ok_or(ValidationFault::MissingFileName)?;
            Ok(GetContent::Binary {
                data: payload.decompress()?,
                file_name: file_name.to_string(),
                format: payload.format().map(str::to_string),
            })
        }
        PayloadContent::Compressed(_) => Ok(GetContent::Xml(payload.text()?)),
    }
}
