//! List: enumerate queued messages after a code or inside a time window.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{operation_client, option, Operation};
use crate::envelope::message_list::{self, EntryFault, MessageListEntry};
use crate::envelope::{Request, RequestEnvelope, Verb, NOUN_MESSAGE_LIST};
use crate::error::{Result, ValidationFault};
use crate::exchange::validate;

/// Which clock a time window refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntervalType {
    #[default]
    Application,
    Server,
}

impl IntervalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalType::Application => "Application",
            IntervalType::Server => "Server",
        }
    }
}

/// `AfterCode` and `Interval` are mutually exclusive on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListWindow {
    /// Only codes strictly greater than this one.
    AfterCode(u64),
    Interval {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval_type: IntervalType,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub window: ListWindow,
    /// May contain wildcards, interpreted by the endpoint.
    pub message_identification: Option<String>,
    pub msg_type: Option<String>,
    pub owner: Option<String>,
}

impl ListQuery {
    pub fn after(code: u64) -> Self {
        Self {
            window: ListWindow::AfterCode(code),
            message_identification: None,
            msg_type: None,
            owner: None,
        }
    }

    fn request(&self) -> std::result::Result<Request, ValidationFault> {
        let mut request = Request::new();
        match &self.window {
            ListWindow::AfterCode(code) => {
                request = request.with_option(option::CODE, code.to_string())?;
            }
            ListWindow::Interval {
                start,
                end,
                interval_type,
            } => {
                request = request
                    .with_start_time(*start)
                    .with_end_time(*end)
                    .with_option(option::INTERVAL_TYPE, interval_type.as_str())?;
            }
        }
        if let Some(id) = &self.message_identification {
            request = request.with_option(option::MESSAGE_IDENTIFICATION, id)?;
        }
        if let Some(t) = &self.msg_type {
            request = request.with_option(option::MSG_TYPE, t)?;
        }
        if let Some(owner) = &self.owner {
            request = request.with_option(option::OWNER, owner)?;
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub entries: Vec<MessageListEntry>,
    /// Entries dropped for missing mandatory fields.
    pub faults: Vec<EntryFault>,
}

#[derive(Clone)]
pub struct ListClient {
    op: Operation,
}

operation_client!(ListClient);

impl ListClient {
    pub async fn list(&self, query: &ListQuery) -> Result<ListResult> {
        let envelope = RequestEnvelope::request(Verb::Get, NOUN_MESSAGE_LIST, query.request()?);
        let exchange = self.op.send(&envelope).await?;
        validate(&exchange.response, Some(NOUN_MESSAGE_LIST), false)?;

        let payload = exchange
            .response
            .payload
            .ok_or_else(|| ValidationFault::MissingPayload {
                verb: Verb::Reply.to_string(),
                noun: NOUN_MESSAGE_LIST.to_string(),
            })?;
        let parsed = message_list::parse(&payload.text()?)?;

        for fault in &parsed.faults {
            warn!("Skipping list entry: {}", fault);
        }
        debug!(
            entries = parsed.entries.len(),
            faults = parsed.faults.len(),
            "Listed messages"
        );
        Ok(ListResult {
            entries: parsed.entries,
            faults: parsed.faults,
        })
    }
}
