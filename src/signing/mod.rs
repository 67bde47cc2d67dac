//! Signature interceptor.
//!
//! Runs twice per exchange: once on the serialized request before it is
//! transmitted ([`Direction::Outbound`]) and once on the raw response
//! ([`Direction::Inbound`]). Signing and verification themselves are
//! delegated to a [`SignatureService`].

pub mod ed25519;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::envelope::codec;
use crate::error::{ExchangeError, ProtocolFault, SignatureFault};

pub use ed25519::Ed25519SignatureService;

/// Public half of a signing identity, as presented by a signer.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    subject: String,
    public_key: Vec<u8>,
}

impl Certificate {
    pub fn new(subject: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            public_key,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Short hex fingerprint for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.public_key[..self.public_key.len().min(8)])
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Certificate plus private key material.
#[derive(Clone)]
pub struct Identity {
    certificate: Certificate,
    private_key: Vec<u8>,
}

impl Identity {
    pub fn new(certificate: Certificate, private_key: Vec<u8>) -> Self {
        Self {
            certificate,
            private_key,
        }
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("certificate", &self.certificate)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Opaque signing collaborator.
pub trait SignatureService: Send + Sync {
    /// Sign a serialized document. `None` selects the service's default
    /// identity.
    fn sign(&self, document: &[u8], identity: Option<&Identity>) -> Result<Vec<u8>, SignatureFault>;

    /// Verify a signed document and return the signer certificate.
    fn verify(&self, document: &[u8]) -> Result<Certificate, SignatureFault>;
}

/// Per-call signing policy.
#[derive(Debug, Clone)]
pub struct SignaturePolicy {
    pub sign_outbound: bool,
    pub verify_inbound: bool,
    pub identity: Option<Identity>,
}

impl Default for SignaturePolicy {
    fn default() -> Self {
        Self {
            sign_outbound: true,
            verify_inbound: true,
            identity: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }
}

/// Raw message passing through the interceptor.
#[derive(Debug, Clone, Default)]
pub struct WireMessage {
    pub body: Vec<u8>,
    /// HTTP status, inbound only.
    pub status: Option<u16>,
    /// Server clock, inbound only.
    pub server_date: Option<DateTime<Utc>>,
}

impl WireMessage {
    pub fn outbound(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }
}

/// What the interceptor learned during one exchange.
///
/// Reset at the start of every call; read after the call returns.
#[derive(Debug, Clone, Default)]
pub struct ExchangeMetadata {
    pub status: Option<u16>,
    pub server_timestamp: Option<DateTime<Utc>>,
    pub signature_certificate: Option<Certificate>,
    pub reject_text: Option<String>,
    pub exception: Option<ExchangeError>,
}

impl ExchangeMetadata {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct SignatureInterceptor {
    policy: SignaturePolicy,
    service: Arc<dyn SignatureService>,
    debug_messages: bool,
}

impl SignatureInterceptor {
    pub fn new(
        policy: SignaturePolicy,
        service: Arc<dyn SignatureService>,
        debug_messages: bool,
    ) -> Self {
        Self {
            policy,
            service,
            debug_messages,
        }
    }

    /// Process one message in the given direction.
    ///
    /// Outbound signing failures are returned and abort the exchange.
    /// Inbound faults never return an error; they are recorded in
    /// `metadata.exception` for the exchange client to raise.
    pub fn intercept(
        &self,
        direction: Direction,
        message: &mut WireMessage,
        metadata: &mut ExchangeMetadata,
    ) -> Result<(), SignatureFault> {
        match direction {
            Direction::Outbound => {
                if self.policy.sign_outbound {
                    message.body = self
                        .service
                        .sign(&message.body, self.policy.identity.as_ref())?;
                }
                self.log(direction, &message.body);
                Ok(())
            }
            Direction::Inbound => {
                self.log(direction, &message.body);
                self.inbound(message, metadata);
                Ok(())
            }
        }
    }

    fn inbound(&self, message: &WireMessage, metadata: &mut ExchangeMetadata) {
        metadata.status = message.status;
        metadata.server_timestamp = message.server_date;

        if let Some(fault) = codec::decode_fault(&message.body) {
            metadata.reject_text = Some(fault.raw.clone());
            metadata.exception = Some(ExchangeError::Protocol(ProtocolFault {
                code: fault.code,
                message: fault.message,
                detail: fault.detail,
                errors: Vec::new(),
            }));
            return;
        }

        if self.policy.verify_inbound {
            match self.service.verify(&message.body) {
                Ok(certificate) => {
                    debug!(
                        subject = certificate.subject(),
                        fingerprint = %certificate.fingerprint(),
                        "Response signature verified"
                    );
                    metadata.signature_certificate = Some(certificate);
                }
                Err(fault) => {
                    if let SignatureFault::Verification {
                        certificate: Some(cert),
                        ..
                    } = &fault
                    {
                        metadata.signature_certificate = Some(cert.clone());
                    }
                    metadata.exception = Some(ExchangeError::Signature(fault));
                }
            }
        }
    }

    fn log(&self, direction: Direction, body: &[u8]) {
        if self.debug_messages {
            debug!(
                direction = direction.as_str(),
                "Raw message:\n{}",
                String::from_utf8_lossy(body)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Payload, ResponseEnvelope};

    /// Appends a marker on sign, requires it on verify.
    struct MarkerService {
        fail_sign: bool,
    }

    impl SignatureService for MarkerService {
        fn sign(&self, document: &[u8], _: Option<&Identity>) -> Result<Vec<u8>, SignatureFault> {
            if self.fail_sign {
                return Err(SignatureFault::Creation("no key".into()));
            }
            let mut signed = document.to_vec();
            signed.extend_from_slice(b"<!--signed-->");
            Ok(signed)
        }

        fn verify(&self, document: &[u8]) -> Result<Certificate, SignatureFault> {
            if document.ends_with(b"<!--signed-->") {
                Ok(Certificate::new("CN=server", vec![1, 2, 3]))
            } else {
                Err(SignatureFault::Verification {
                    reason: "not signed".into(),
                    certificate: Some(Certificate::new("CN=rogue", vec![9])),
                })
            }
        }
    }

    fn interceptor(fail_sign: bool, policy: SignaturePolicy) -> SignatureInterceptor {
        SignatureInterceptor::new(policy, Arc::new(MarkerService { fail_sign }), true)
    }

    fn response() -> Vec<u8> {
        let env = ResponseEnvelope::reply(Some(Payload::inline("<Foo/>").unwrap()), "Foo");
        codec::encode_response(&env).unwrap()
    }

    #[test]
    fn test_outbound_signs_body() {
        let mut msg = WireMessage::outbound(b"<doc/>".to_vec());
        let mut md = ExchangeMetadata::default();
        interceptor(false, SignaturePolicy::default())
            .intercept(Direction::Outbound, &mut msg, &mut md)
            .unwrap();
        assert_eq!(msg.body, b"<doc/><!--signed-->");
    }

    #[test]
    fn test_outbound_failure_aborts() {
        let mut msg = WireMessage::outbound(b"<doc/>".to_vec());
        let mut md = ExchangeMetadata::default();
        let err = interceptor(true, SignaturePolicy::default())
            .intercept(Direction::Outbound, &mut msg, &mut md)
            .unwrap_err();
        assert_eq!(err, SignatureFault::Creation("no key".into()));
        assert_eq!(msg.body, b"<doc/>");
    }

    #[test]
    fn test_outbound_unsigned_when_disabled() {
        let policy = SignaturePolicy {
            sign_outbound: false,
            ..Default::default()
        };
        let mut msg = WireMessage::outbound(b"<doc/>".to_vec());
        interceptor(true, policy)
            .intercept(Direction::Outbound, &mut msg, &mut ExchangeMetadata::default())
            .unwrap();
        assert_eq!(msg.body, b"<doc/>");
    }

    #[test]
    fn test_inbound_records_certificate_and_status() {
        let mut body = response();
        body.extend_from_slice(b"<!--signed-->");
        let now = Utc::now();
        let mut msg = WireMessage {
            body,
            status: Some(200),
            server_date: Some(now),
        };
        let mut md = ExchangeMetadata::default();
        interceptor(false, SignaturePolicy::default())
            .intercept(Direction::Inbound, &mut msg, &mut md)
            .unwrap();

        assert_eq!(md.status, Some(200));
        assert_eq!(md.server_timestamp, Some(now));
        assert_eq!(md.signature_certificate.unwrap().subject(), "CN=server");
        assert!(md.exception.is_none());
    }

    #[test]
    fn test_inbound_verification_failure_recorded() {
        let mut msg = WireMessage {
            body: response(),
            status: Some(200),
            server_date: None,
        };
        let mut md = ExchangeMetadata::default();
        interceptor(false, SignaturePolicy::default())
            .intercept(Direction::Inbound, &mut msg, &mut md)
            .unwrap();

        match md.exception {
            Some(ExchangeError::Signature(SignatureFault::Verification { certificate, .. })) => {
                assert_eq!(certificate.unwrap().subject(), "CN=rogue");
            }
            other => panic!("unexpected exception {other:?}"),
        }
        assert_eq!(md.status, Some(200));
    }

    #[test]
    fn test_inbound_fault_records_reject_text() {
        let body = codec::encode_fault("soapenv:Client", "Unknown sender", None).unwrap();
        let mut msg = WireMessage {
            body,
            status: Some(500),
            server_date: None,
        };
        let mut md = ExchangeMetadata::default();
        interceptor(false, SignaturePolicy::default())
            .intercept(Direction::Inbound, &mut msg, &mut md)
            .unwrap();

        assert!(md.reject_text.unwrap().contains("Unknown sender"));
        assert!(matches!(md.exception, Some(ExchangeError::Protocol(ref f)) if f.message == "Unknown sender"));
        assert!(md.signature_certificate.is_none());
    }

    #[test]
    fn test_metadata_reset() {
        let mut md = ExchangeMetadata {
            status: Some(500),
            reject_text: Some("x".into()),
            ..Default::default()
        };
        md.reset();
        assert!(md.status.is_none());
        assert!(md.reject_text.is_none());
    }
}
