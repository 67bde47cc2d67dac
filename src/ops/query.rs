//! Query: parameterised data request answered with a single payload.

use chrono::{DateTime, Utc};

use super::{operation_client, option, Operation};
use crate::envelope::{Request, RequestEnvelope, Verb, NOUN_ANY};
use crate::error::{Result, ValidationFault};
use crate::exchange::validate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub data_type: String,
    pub parameters: Vec<(String, String)>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl QueryRequest {
    pub fn new(data_type: impl Into<String>) -> Self {
        Self {
            data_type: data_type.into(),
            parameters: Vec::new(),
            start: None,
            end: None,
        }
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((name.into(), value.into()));
        self
    }

    fn request(&self) -> std::result::Result<Request, ValidationFault> {
        let mut request = Request::new().with_option(option::DATA_TYPE, &self.data_type)?;
        for (name, value) in &self.parameters {
            request = request.with_option(name, value)?;
        }
        if let Some(start) = self.start {
            request = request.with_start_time(start);
        }
        if let Some(end) = self.end {
            request = request.with_end_time(end);
        }
        Ok(request)
    }
}

#[derive(Clone)]
pub struct QueryClient {
    op: Operation,
}

operation_client!(QueryClient);

impl QueryClient {
    /// Returns the payload as text.
    pub async fn query(&self, query: &QueryRequest) -> Result<String> {
        let envelope = RequestEnvelope::request(Verb::Get, NOUN_ANY, query.request()?);
        let exchange = self.op.send(&envelope).await?;
        validate(&exchange.response, None, false)?;

        match exchange.response.payload {
            Some(payload) => Ok(payload.text()?),
            None => Err(ValidationFault::MissingPayload {
                verb: Verb::Reply.to_string(),
                noun: NOUN_ANY.to_string(),
            }
            .into()),
        }
    }
}
