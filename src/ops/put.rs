//! Put: submit an XML document or a named binary attachment.

use tracing::info;

use super::{operation_client, Operation};
use crate::envelope::{Payload, RequestEnvelope, Verb};
use crate::error::{Result, ValidationFault};
use crate::exchange::validate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutContent {
    /// Inline document; its root tag becomes the header noun.
    Xml(String),
    /// Compressed attachment; the noun is the binary sentinel.
    Binary {
        data: Vec<u8>,
        file_name: String,
        format: Option<String>,
    },
}

impl PutContent {
    fn payload(&self) -> std::result::Result<Payload, ValidationFault> {
        match self {
            PutContent::Xml(xml) => Payload::inline(xml),
            PutContent::Binary {
                data,
                file_name,
                format,
            } => {
                if file_name.trim().is_empty() {
                    return Err(ValidationFault::MissingFileName);
                }
                Payload::compress(data, format.clone(), Some(file_name.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutResult {
    pub result: String,
    /// Identifiers assigned by the endpoint.
    pub ids: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct PutClient {
    op: Operation,
}

operation_client!(PutClient);

impl PutClient {
    /// Build the request envelope without sending it.
    pub fn envelope(content: &PutContent) -> Result<RequestEnvelope> {
        Ok(RequestEnvelope::payload(Verb::Create, content.payload()?))
    }

    pub async fn put(&self, content: &PutContent) -> Result<PutResult> {
        let envelope = Self::envelope(content)?;
        let noun = envelope.header.noun.clone();
        let exchange = self.op.send(&envelope).await?;
        validate(&exchange.response, None, true)?;

        let result = exchange
            .response
            .reply
            .map(|r| PutResult {
                result: r.result,
                ids: r.ids,
            })
            .unwrap_or_default();
        info!(noun = %noun, result = %result.result, "Message submitted");
        Ok(result)
    }
}
