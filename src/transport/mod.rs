//! Transport abstraction.
//!
//! A transport posts one serialized envelope and hands back the raw HTTP
//! response. Connection-level failures are mapped onto [`TransportFault`]
//! before they leave this module; HTTP status interpretation is left to the
//! exchange client so that SOAP faults carried in error responses are not
//! lost.

pub mod fault;
pub mod http;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::TransportFault;

pub use http::HttpTransport;

/// Raw response as seen on the wire.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Value of the `Date` header, if present and parseable.
    pub date: Option<DateTime<Utc>>,
    pub body: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, body: Bytes) -> Result<HttpResponse, TransportFault>;
}
