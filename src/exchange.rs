//! Exchange client: one signed request, one verified and validated response.
//!
//! ```text
//! BUILD -> (SIGN) -> TRANSMIT -> (VERIFY) -> VALIDATE -> DONE | FAILED
//! ```
//!
//! Nothing is retried here. Retries happen only when an outer schedule
//! re-runs the whole operation.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::envelope::codec::{self, Decoded};
use crate::envelope::{RequestEnvelope, ResponseEnvelope, Verb};
use crate::error::{ExchangeError, ProtocolFault, Result, TransportFault, ValidationFault};
use crate::signing::{
    Direction, ExchangeMetadata, SignatureInterceptor, SignaturePolicy, SignatureService,
    WireMessage,
};
use crate::transport::fault::classify_status;
use crate::transport::Transport;

/// A decoded response together with what the interceptor recorded.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub response: ResponseEnvelope,
    pub metadata: ExchangeMetadata,
}

pub struct ExchangeClient {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn SignatureService>,
    debug_messages: bool,
    last: Mutex<ExchangeMetadata>,
}

impl ExchangeClient {
    pub fn new(transport: Arc<dyn Transport>, signer: Arc<dyn SignatureService>) -> Self {
        Self {
            transport,
            signer,
            debug_messages: false,
            last: Mutex::new(ExchangeMetadata::default()),
        }
    }

    /// Log every raw message at debug level.
    pub fn with_debug_messages(mut self, enabled: bool) -> Self {
        self.debug_messages = enabled;
        self
    }

    /// Metadata of the most recent call on this client, successful or not.
    ///
    /// When several tasks share a client this is whichever call finished
    /// last; per-call metadata is returned in [`Exchange`].
    pub fn last_metadata(&self) -> ExchangeMetadata {
        match self.last.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Send one envelope under the given signing policy.
    pub async fn send(&self, envelope: &RequestEnvelope, policy: &SignaturePolicy) -> Result<Exchange> {
        let mut metadata = ExchangeMetadata::default();
        let result = self.exchange(envelope, policy, &mut metadata).await;

        if let Err(err) = &result {
            if metadata.exception.is_none() {
                metadata.exception = Some(err.clone());
            }
        }
        match self.last.lock() {
            Ok(mut guard) => *guard = metadata.clone(),
            Err(poisoned) => *poisoned.into_inner() = metadata.clone(),
        }

        result.map(|response| Exchange { response, metadata })
    }

    async fn exchange(
        &self,
        envelope: &RequestEnvelope,
        policy: &SignaturePolicy,
        metadata: &mut ExchangeMetadata,
    ) -> Result<ResponseEnvelope> {
        metadata.reset();
        let interceptor =
            SignatureInterceptor::new(policy.clone(), Arc::clone(&self.signer), self.debug_messages);

        // BUILD + SIGN
        let mut outbound = WireMessage::outbound(codec::encode_request(envelope)?);
        interceptor.intercept(Direction::Outbound, &mut outbound, metadata)?;

        // TRANSMIT
        debug!(
            verb = %envelope.header.verb,
            noun = %envelope.header.noun,
            signed = policy.sign_outbound,
            "Sending request"
        );
        let response = self.transport.post(Bytes::from(outbound.body)).await?;

        // VERIFY
        let mut inbound = WireMessage {
            body: response.body.to_vec(),
            status: Some(response.status),
            server_date: response.date,
        };
        interceptor.intercept(Direction::Inbound, &mut inbound, metadata)?;

        if let Some(ExchangeError::Protocol(fault)) = &metadata.exception {
            warn!(code = %fault.code, "Remote rejected the request: {}", fault.message);
            return Err(ExchangeError::Protocol(fault.clone()));
        }
        if let Some(fault) = classify_status(response.status) {
            return Err(fault.into());
        }

        let success = (200..300).contains(&response.status);
        let decoded = match codec::decode_response(&inbound.body) {
            Ok(Decoded::Response(decoded)) => decoded,
            Ok(Decoded::Fault(fault)) => {
                return Err(ProtocolFault {
                    code: fault.code,
                    message: fault.message,
                    detail: fault.detail,
                    errors: Vec::new(),
                }
                .into());
            }
            Err(err) if success => {
                return Err(TransportFault::UnexpectedContent(err.to_string()).into());
            }
            Err(_) => {
                return Err(TransportFault::UnexpectedStatus {
                    status: response.status,
                }
                .into());
            }
        };

        // An unsigned or mis-signed response is never a success.
        if let Some(err) = &metadata.exception {
            return Err(err.clone());
        }

        if metadata.server_timestamp.is_none() {
            metadata.server_timestamp = decoded.header.as_ref().and_then(|h| h.timestamp);
        }

        if let Some(reply) = decoded.reply.as_ref().filter(|r| r.is_failed()) {
            let first = reply.errors.first();
            return Err(ProtocolFault {
                code: first.map_or_else(|| reply.result.clone(), |e| e.code.clone()),
                message: first
                    .and_then(|e| e.details.clone())
                    .unwrap_or_else(|| "request failed".to_string()),
                detail: None,
                errors: reply.errors.clone(),
            }
            .into());
        }

        if !success {
            return Err(TransportFault::UnexpectedStatus {
                status: response.status,
            }
            .into());
        }

        Ok(decoded)
    }
}

/// Check a decoded response against the protocol's header rules.
///
/// `can_be_empty` admits a payload-less response, which must still be a
/// `reply`.
pub fn validate(
    response: &ResponseEnvelope,
    expected_noun: Option<&str>,
    can_be_empty: bool,
) -> std::result::Result<(), ValidationFault> {
    let header = response.header.as_ref().ok_or(ValidationFault::MissingHeader)?;

    if let Some(expected) = expected_noun {
        if header.noun != expected {
            return Err(ValidationFault::NounMismatch {
                expected: expected.to_string(),
                actual: header.noun.clone(),
            });
        }
    }

    let mismatch = |expected_noun: &str| ValidationFault::HeaderMismatch {
        expected_verb: Verb::Reply.to_string(),
        actual_verb: header.verb.to_string(),
        expected_noun: expected_noun.to_string(),
        actual_noun: header.noun.clone(),
    };

    match &response.payload {
        None if !can_be_empty => Err(ValidationFault::MissingPayload {
            verb: header.verb.to_string(),
            noun: header.noun.clone(),
        }),
        None if header.verb != Verb::Reply => Err(mismatch(&header.noun)),
        None => Ok(()),
        Some(payload) => {
            let root = payload.root_tag();
            if header.verb != Verb::Reply || root != header.noun {
                Err(mismatch(root))
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Header, Payload, Reply, ReplyError, Request, NOUN_ANY, NOUN_COMPRESSED, NOUN_MESSAGE_LIST};
    use crate::error::SignatureFault;
    use crate::signing::{Certificate, Identity};
    use crate::transport::HttpResponse;
    use async_trait::async_trait;
    use proptest::prelude::*;

    /// Signs by appending a marker; verifies by checking for it.
    struct MarkerSigner;

    const MARK: &[u8] = b"<!--signed-->";

    impl SignatureService for MarkerSigner {
        fn sign(&self, document: &[u8], _: Option<&Identity>) -> std::result::Result<Vec<u8>, SignatureFault> {
            let mut out = document.to_vec();
            out.extend_from_slice(MARK);
            Ok(out)
        }

        fn verify(&self, document: &[u8]) -> std::result::Result<Certificate, SignatureFault> {
            if document.ends_with(MARK) {
                Ok(Certificate::new("CN=endpoint", vec![1; 32]))
            } else {
                Err(SignatureFault::Verification {
                    reason: "response is not signed".into(),
                    certificate: None,
                })
            }
        }
    }

    /// Replies with a fixed status and body.
    struct Canned {
        status: u16,
        body: Vec<u8>,
    }

    #[async_trait]
    impl Transport for Canned {
        async fn post(&self, body: Bytes) -> std::result::Result<HttpResponse, TransportFault> {
            assert!(body.ends_with(MARK), "request must be signed");
            Ok(HttpResponse {
                status: self.status,
                date: None,
                body: Bytes::from(self.body.clone()),
            })
        }
    }

    fn signed(mut body: Vec<u8>) -> Vec<u8> {
        body.extend_from_slice(MARK);
        body
    }

    fn client(status: u16, body: Vec<u8>) -> ExchangeClient {
        ExchangeClient::new(Arc::new(Canned { status, body }), Arc::new(MarkerSigner))
    }

    fn get_request() -> RequestEnvelope {
        RequestEnvelope::request(Verb::Get, NOUN_ANY, Request::new().with_option("Code", "1").unwrap())
    }

    fn foo_response() -> ResponseEnvelope {
        ResponseEnvelope::reply(Some(Payload::inline("<Foo/>").unwrap()), "Foo")
    }

    #[tokio::test]
    async fn test_send_returns_verified_response() {
        let body = signed(codec::encode_response(&foo_response()).unwrap());
        let client = client(200, body);

        let exchange = client.send(&get_request(), &SignaturePolicy::default()).await.unwrap();
        assert_eq!(exchange.response, foo_response());
        assert_eq!(exchange.metadata.status, Some(200));
        assert_eq!(
            exchange.metadata.signature_certificate.unwrap().subject(),
            "CN=endpoint"
        );
        assert!(client.last_metadata().exception.is_none());
    }

    #[tokio::test]
    async fn test_unsigned_response_is_rejected() {
        let body = codec::encode_response(&foo_response()).unwrap();
        let client = client(200, body);

        let err = client.send(&get_request(), &SignaturePolicy::default()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Signature(SignatureFault::Verification { .. })));
        assert!(client.last_metadata().exception.is_some());
    }

    #[tokio::test]
    async fn test_verification_can_be_disabled() {
        let body = codec::encode_response(&foo_response()).unwrap();
        let policy = SignaturePolicy {
            verify_inbound: false,
            ..Default::default()
        };
        let exchange = client(200, body).send(&get_request(), &policy).await.unwrap();
        assert!(exchange.metadata.signature_certificate.is_none());
    }

    #[tokio::test]
    async fn test_soap_fault_is_protocol_fault() {
        let body = codec::encode_fault("soapenv:Server", "Queue closed", None).unwrap();
        let client = client(500, body);

        let err = client.send(&get_request(), &SignaturePolicy::default()).await.unwrap_err();
        match err {
            ExchangeError::Protocol(fault) => assert_eq!(fault.message, "Queue closed"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(client.last_metadata().reject_text.unwrap().contains("Queue closed"));
    }

    #[tokio::test]
    async fn test_http_status_faults() {
        for (status, expected) in [
            (400, TransportFault::BadRequest),
            (401, TransportFault::Unauthorized),
            (403, TransportFault::Forbidden),
            (404, TransportFault::NotFound),
        ] {
            let err = client(status, b"<html/>".to_vec())
                .send(&get_request(), &SignaturePolicy::default())
                .await
                .unwrap_err();
            assert_eq!(err, ExchangeError::Transport(expected));
        }
    }

    #[tokio::test]
    async fn test_non_envelope_content() {
        let err = client(200, b"<html>maintenance</html>".to_vec())
            .send(&get_request(), &SignaturePolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Transport(TransportFault::UnexpectedContent(_))));

        let err = client(502, b"bad gateway".to_vec())
            .send(&get_request(), &SignaturePolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err, ExchangeError::Transport(TransportFault::UnexpectedStatus { status: 502 }));
    }

    #[tokio::test]
    async fn test_failed_reply_is_protocol_fault() {
        let mut response = ResponseEnvelope::reply(None, NOUN_ANY);
        response.reply = Some(Reply {
            result: "FAILED".into(),
            ids: Vec::new(),
            errors: vec![ReplyError {
                code: "2.9".into(),
                details: Some("unknown code".into()),
            }],
        });
        let body = signed(codec::encode_response(&response).unwrap());

        let err = client(200, body)
            .send(&get_request(), &SignaturePolicy::default())
            .await
            .unwrap_err();
        match err {
            ExchangeError::Protocol(fault) => {
                assert_eq!(fault.code, "2.9");
                assert_eq!(fault.message, "unknown code");
                assert_eq!(fault.errors.len(), 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_validate_missing_header() {
        assert_eq!(
            validate(&ResponseEnvelope::default(), None, true),
            Err(ValidationFault::MissingHeader)
        );
    }

    #[test]
    fn test_validate_noun_mismatch() {
        assert!(matches!(
            validate(&foo_response(), Some(NOUN_MESSAGE_LIST), false),
            Err(ValidationFault::NounMismatch { .. })
        ));
        assert!(validate(&foo_response(), Some("Foo"), false).is_ok());
    }

    #[test]
    fn test_validate_empty_message_list_fails() {
        let response = ResponseEnvelope {
            header: Some(Header::new(Verb::Reply, NOUN_MESSAGE_LIST)),
            reply: Some(Reply::ok()),
            payload: None,
        };
        assert_eq!(
            validate(&response, Some(NOUN_MESSAGE_LIST), false),
            Err(ValidationFault::MissingPayload {
                verb: "reply".into(),
                noun: NOUN_MESSAGE_LIST.into(),
            })
        );
    }

    #[test]
    fn test_validate_compressed_uses_sentinel() {
        let payload = Payload::compress(b"bytes", Some("PDF".into()), Some("a.pdf".into())).unwrap();
        let ok = ResponseEnvelope::reply(Some(payload.clone()), NOUN_COMPRESSED);
        assert!(validate(&ok, None, false).is_ok());

        let wrong = ResponseEnvelope::reply(Some(payload), "Schedule");
        assert!(matches!(
            validate(&wrong, None, false),
            Err(ValidationFault::HeaderMismatch { .. })
        ));
    }

    fn verb_strategy() -> impl Strategy<Value = Verb> {
        prop_oneof![
            Just(Verb::Reply),
            Just(Verb::Get),
            Just(Verb::Create),
            "[a-z]{3,8}".prop_map(|s| Verb::parse(&s)),
        ]
    }

    proptest! {
        #[test]
        fn test_validate_matrix(
            verb in verb_strategy(),
            root in "[A-Z][a-zA-Z]{0,8}",
            noun in "[A-Z][a-zA-Z]{0,8}",
        ) {
            let payload = Payload::inline(format!("<{root}/>")).unwrap();
            let response = ResponseEnvelope {
                header: Some(Header::new(verb.clone(), noun.clone())),
                reply: Some(Reply::ok()),
                payload: Some(payload),
            };
            let result = validate(&response, None, false);
            if verb == Verb::Reply && root == noun {
                prop_assert!(result.is_ok());
            } else {
                let is_mismatch = matches!(result, Err(ValidationFault::HeaderMismatch { .. }));
                prop_assert!(is_mismatch);
            }
        }

        #[test]
        fn test_can_be_empty_requires_reply(verb in verb_strategy(), noun in "[A-Z][a-z]{0,8}") {
            let response = ResponseEnvelope {
                header: Some(Header::new(verb.clone(), noun)),
                reply: Some(Reply::ok()),
                payload: None,
            };
            let result = validate(&response, None, true);
            prop_assert_eq!(result.is_ok(), verb == Verb::Reply);
        }
    }
}
