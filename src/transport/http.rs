//! HTTPS transport over reqwest.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, DATE};
use tracing::{debug, warn};

use super::fault::classify_reqwest;
use super::{HttpResponse, Transport};
use crate::error::TransportFault;

const CONTENT_TYPE_XML: &str = "text/xml; charset=utf-8";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportFault> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| classify_reqwest(&e))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, body: Bytes) -> Result<HttpResponse, TransportFault> {
        debug!(url = %self.url, bytes = body.len(), "Posting envelope");

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, CONTENT_TYPE_XML)
            .header("SOAPAction", "\"\"")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let fault = classify_reqwest(&e);
                warn!(url = %self.url, category = fault.category(), "Request failed: {}", fault);
                fault
            })?;

        let status = response.status().as_u16();
        let date = response
            .headers()
            .get(DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.with_timezone(&Utc));
        let body = response.bytes().await.map_err(|e| classify_reqwest(&e))?;

        debug!(status, bytes = body.len(), "Received response");
        Ok(HttpResponse { status, date, body })
    }
}
