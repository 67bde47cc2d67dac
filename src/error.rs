//! Error taxonomy.
//!
//! Exchange-level faults fall into four families (transport, protocol,
//! signature, validation) unified by [`ExchangeError`]. Sync-level faults
//! wrap them with the entry or file they concern. Configuration problems
//! have their own type.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::envelope::ReplyError;
use crate::signing::Certificate;

/// Result alias for exchange operations.
pub type Result<T, E = ExchangeError> = std::result::Result<T, E>;

/// Stable categories for failures below the message layer.
///
/// Low-level library errors never leave the transport module; they are
/// mapped onto one of these first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFault {
    #[error("server certificate is not trusted: {0}")]
    UntrustedCertificate(String),

    #[error("server certificate does not match the host name: {0}")]
    HostnameMismatch(String),

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("HTTP 400: request rejected as malformed")]
    BadRequest,

    #[error("HTTP 401: client is not authenticated")]
    Unauthorized,

    #[error("HTTP 403: client is not authorized")]
    Forbidden,

    #[error("HTTP 404: endpoint not found")]
    NotFound,

    #[error("HTTP {status}: unexpected response")]
    UnexpectedStatus { status: u16 },

    #[error("HTTP 200 without a message envelope: {0}")]
    UnexpectedContent(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("TLS server name rejected: {0}")]
    TlsNameRejected(String),

    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportFault {
    /// Short, stable identifier used in log fields.
    pub fn category(&self) -> &'static str {
        match self {
            TransportFault::UntrustedCertificate(_) => "untrusted-certificate",
            TransportFault::HostnameMismatch(_) => "hostname-mismatch",
            TransportFault::UnknownHost(_) => "unknown-host",
            TransportFault::BadRequest => "http-400",
            TransportFault::Unauthorized => "http-401",
            TransportFault::Forbidden => "http-403",
            TransportFault::NotFound => "http-404",
            TransportFault::UnexpectedStatus { .. } => "http-status",
            TransportFault::UnexpectedContent(_) => "unexpected-content",
            TransportFault::ConnectionRefused(_) => "connection-refused",
            TransportFault::Timeout(_) => "timeout",
            TransportFault::TlsNameRejected(_) => "tls-name-rejected",
            TransportFault::Other(_) => "other",
        }
    }
}

/// The remote party explicitly rejected the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote rejected the message: {code}: {message}")]
pub struct ProtocolFault {
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub errors: Vec<ReplyError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureFault {
    #[error("failed to sign request: {0}")]
    Creation(String),

    /// Carries the signer certificate when one could be extracted, even
    /// though it is not trusted.
    #[error("response signature verification failed: {reason}")]
    Verification {
        reason: String,
        certificate: Option<Certificate>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFault {
    #[error("response has no header")]
    MissingHeader,

    #[error("response {verb}/{noun} has no payload")]
    MissingPayload { verb: String, noun: String },

    #[error("expected noun {expected}, got {actual}")]
    NounMismatch { expected: String, actual: String },

    #[error(
        "header mismatch: expected verb {expected_verb} and noun {expected_noun}, \
         got verb {actual_verb} and noun {actual_noun}"
    )]
    HeaderMismatch {
        expected_verb: String,
        actual_verb: String,
        expected_noun: String,
        actual_noun: String,
    },

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("duplicate request option: {0}")]
    DuplicateOption(String),

    #[error("payload carries both inline XML and compressed content")]
    ConflictingPayload,

    #[error("binary payload has no declared file name")]
    MissingFileName,

    #[error("message list entry {} is missing {}", .code.map_or_else(|| "?".to_string(), |c| c.to_string()), .fields.join(", "))]
    MissingEntryFields {
        code: Option<u64>,
        fields: Vec<&'static str>,
    },

    #[error("compressed payload could not be processed: {0}")]
    Compression(String),
}

/// Any fault that aborts a single exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Transport(#[from] TransportFault),

    #[error(transparent)]
    Protocol(#[from] ProtocolFault),

    #[error(transparent)]
    Signature(#[from] SignatureFault),

    #[error(transparent)]
    Validation(#[from] ValidationFault),
}

/// Failures inside the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("listing new messages failed")]
    List(#[source] ExchangeError),

    #[error("fetching message {code} failed")]
    Fetch {
        code: u64,
        #[source]
        source: ExchangeError,
    },

    #[error("delivering {} failed", .path.display())]
    Deliver {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("post-delivery hook {} failed: {reason}", .command.display())]
    Hook { command: PathBuf, reason: String },

    #[error("watermark for {key} could not be persisted")]
    Watermark {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("lock {} could not be managed", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid key material in {}: {reason}", .path.display())]
    Key { path: PathBuf, reason: String },
}

/// `err` followed by each of its sources, joined with `": "`.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
