//! Ed25519 signature service.
//!
//! The signature block is spliced into the SOAP header, directly after the
//! opening tag:
//!
//! ```text
//! <sig:Signature xmlns:sig="urn:mexsync:signature">
//!   <sig:SignatureValue>base64(signature)</sig:SignatureValue>
//!   <sig:KeyInfo subject="CN=...">base64(public key)</sig:KeyInfo>
//! </sig:Signature>
//! ```
//!
//! The signature covers the `subject` attribute, a NUL byte, then the document
//! exactly as it was before the block was inserted. Verification removes the
//! block and checks the remainder under the subject the block names.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::{Certificate, Identity, SignatureService};
use crate::envelope::codec::SOAP_HEADER_OPEN;
use crate::error::SignatureFault;

pub const SIGNATURE_NS: &str = "urn:mexsync:signature";

const BLOCK_OPEN: &str = "<sig:Signature ";
const BLOCK_CLOSE: &str = "</sig:Signature>";

/// Build an identity from a 32-byte Ed25519 seed.
pub fn identity_from_seed(subject: impl Into<String>, seed: [u8; 32]) -> Identity {
    let key = SigningKey::from_bytes(&seed);
    let certificate = Certificate::new(subject, key.verifying_key().to_bytes().to_vec());
    Identity::new(certificate, seed.to_vec())
}

pub struct Ed25519SignatureService {
    default_identity: Option<Identity>,
    trusted: Vec<Certificate>,
}

impl Ed25519SignatureService {
    pub fn new(default_identity: Option<Identity>, trusted: Vec<Certificate>) -> Self {
        Self {
            default_identity,
            trusted,
        }
    }

    fn is_trusted(&self, certificate: &Certificate) -> bool {
        self.trusted
            .iter()
            .any(|t| t.public_key() == certificate.public_key())
    }
}

/// Bytes the signature is computed over.
fn signed_message(subject: &str, document: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(subject.len() + 1 + document.len());
    message.extend_from_slice(subject.as_bytes());
    message.push(0);
    message.extend_from_slice(document);
    message
}

fn creation(reason: impl Into<String>) -> SignatureFault {
    SignatureFault::Creation(reason.into())
}

fn rejected(reason: impl Into<String>, certificate: Option<Certificate>) -> SignatureFault {
    SignatureFault::Verification {
        reason: reason.into(),
        certificate,
    }
}

impl SignatureService for Ed25519SignatureService {
    fn sign(&self, document: &[u8], identity: Option<&Identity>) -> Result<Vec<u8>, SignatureFault> {
        let identity = identity
            .or(self.default_identity.as_ref())
            .ok_or_else(|| creation("no signing identity configured"))?;

        let seed: [u8; 32] = identity
            .private_key()
            .try_into()
            .map_err(|_| creation("signing key must be a 32-byte Ed25519 seed"))?;
        let key = SigningKey::from_bytes(&seed);

        let text = std::str::from_utf8(document).map_err(|e| creation(e.to_string()))?;
        let at = text
            .find(SOAP_HEADER_OPEN)
            .map(|i| i + SOAP_HEADER_OPEN.len())
            .ok_or_else(|| creation("document has no SOAP header to carry the signature"))?;

        let signature = key.sign(&signed_message(identity.certificate().subject(), document));
        let block = format!(
            "<sig:Signature xmlns:sig=\"{SIGNATURE_NS}\">\
             <sig:SignatureValue>{}</sig:SignatureValue>\
             <sig:KeyInfo subject=\"{}\">{}</sig:KeyInfo>\
             </sig:Signature>",
            STANDARD.encode(signature.to_bytes()),
            escape(identity.certificate().subject()),
            STANDARD.encode(key.verifying_key().to_bytes()),
        );

        let mut signed = String::with_capacity(text.len() + block.len());
        signed.push_str(&text[..at]);
        signed.push_str(&block);
        signed.push_str(&text[at..]);
        Ok(signed.into_bytes())
    }

    fn verify(&self, document: &[u8]) -> Result<Certificate, SignatureFault> {
        let text = std::str::from_utf8(document)
            .map_err(|_| rejected("response is not UTF-8 text", None))?;

        let start = text
            .find(BLOCK_OPEN)
            .ok_or_else(|| rejected("response is not signed", None))?;
        let end = text[start..]
            .find(BLOCK_CLOSE)
            .map(|i| start + i + BLOCK_CLOSE.len())
            .ok_or_else(|| rejected("signature block is truncated", None))?;

        let block = parse_block(&text[start..end])?;

        let key_bytes: [u8; 32] = block
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| rejected("signer key has the wrong length", None))?;
        let certificate = Certificate::new(block.subject, key_bytes.to_vec());
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| rejected(format!("signer key is invalid: {e}"), Some(certificate.clone())))?;
        let signature = Signature::from_slice(&block.signature)
            .map_err(|e| rejected(format!("signature is invalid: {e}"), Some(certificate.clone())))?;

        let mut unsigned = Vec::with_capacity(document.len());
        unsigned.extend_from_slice(&document[..start]);
        unsigned.extend_from_slice(&document[end..]);

        key.verify(&signed_message(certificate.subject(), &unsigned), &signature)
            .map_err(|_| rejected("signature does not match the content", Some(certificate.clone())))?;

        if !self.is_trusted(&certificate) {
            return Err(rejected(
                format!("signer {} is not trusted", certificate.subject()),
                Some(certificate),
            ));
        }
        Ok(certificate)
    }
}

struct SignatureBlock {
    signature: Vec<u8>,
    public_key: Vec<u8>,
    subject: String,
}

fn parse_block(xml: &str) -> Result<SignatureBlock, SignatureFault> {
    let bad = |e: &dyn std::fmt::Display| rejected(format!("signature block is malformed: {e}"), None);

    let mut reader = Reader::from_str(xml);
    let mut signature = None;
    let mut public_key = None;
    let mut subject = String::new();

    loop {
        match reader.read_event().map_err(|e| bad(&e))? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"SignatureValue" => {
                    let value = reader.read_text(e.name()).map_err(|e| bad(&e))?;
                    signature = Some(STANDARD.decode(value.trim()).map_err(|e| bad(&e))?);
                }
                b"KeyInfo" => {
                    for attr in e.attributes() {
                        let attr = attr.map_err(|e| bad(&e))?;
                        if attr.key.local_name().as_ref() == b"subject" {
                            subject = attr.unescape_value().map_err(|e| bad(&e))?.into_owned();
                        }
                    }
                    let value = reader.read_text(e.name()).map_err(|e| bad(&e))?;
                    public_key = Some(STANDARD.decode(value.trim()).map_err(|e| bad(&e))?);
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    match (signature, public_key) {
        (Some(signature), Some(public_key)) => Ok(SignatureBlock {
            signature,
            public_key,
            subject,
        }),
        _ => Err(bad(&"missing signature value or key")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::codec;
    use crate::envelope::{Payload, ResponseEnvelope};

    fn document() -> Vec<u8> {
        let env = ResponseEnvelope::reply(Some(Payload::inline("<Foo>bar</Foo>").unwrap()), "Foo");
        codec::encode_response(&env).unwrap()
    }

    fn server() -> Identity {
        identity_from_seed("CN=endpoint", [7u8; 32])
    }

    #[test]
    fn test_sign_then_verify() {
        let id = server();
        let service = Ed25519SignatureService::new(Some(id.clone()), vec![id.certificate().clone()]);

        let signed = service.sign(&document(), None).unwrap();
        let text = String::from_utf8(signed.clone()).unwrap();
        assert!(text.contains("<sig:SignatureValue>"));

        let cert = service.verify(&signed).unwrap();
        assert_eq!(cert.subject(), "CN=endpoint");
        assert_eq!(&cert, id.certificate());

        // Signed document still decodes.
        assert!(codec::decode_response(&signed).is_ok());
    }

    #[test]
    fn test_tampered_content_rejected_with_certificate() {
        let id = server();
        let service = Ed25519SignatureService::new(Some(id.clone()), vec![id.certificate().clone()]);

        let signed = String::from_utf8(service.sign(&document(), None).unwrap()).unwrap();
        let tampered = signed.replace("<Foo>bar</Foo>", "<Foo>baz</Foo>");

        match service.verify(tampered.as_bytes()).unwrap_err() {
            SignatureFault::Verification { certificate, .. } => {
                assert_eq!(certificate.unwrap().subject(), "CN=endpoint");
            }
            other => panic!("unexpected fault {other:?}"),
        }
    }

    #[test]
    fn test_untrusted_signer_rejected() {
        let rogue = identity_from_seed("CN=rogue", [9u8; 32]);
        let signer = Ed25519SignatureService::new(Some(rogue), Vec::new());
        let verifier = Ed25519SignatureService::new(None, vec![server().certificate().clone()]);

        let signed = signer.sign(&document(), None).unwrap();
        match verifier.verify(&signed).unwrap_err() {
            SignatureFault::Verification { reason, certificate } => {
                assert!(reason.contains("not trusted"));
                assert_eq!(certificate.unwrap().subject(), "CN=rogue");
            }
            other => panic!("unexpected fault {other:?}"),
        }
    }

    #[test]
    fn test_unsigned_document_rejected() {
        let service = Ed25519SignatureService::new(None, vec![server().certificate().clone()]);
        assert_eq!(
            service.verify(&document()).unwrap_err(),
            SignatureFault::Verification {
                reason: "response is not signed".into(),
                certificate: None,
            }
        );
    }

    #[test]
    fn test_sign_without_identity_fails() {
        let service = Ed25519SignatureService::new(None, Vec::new());
        assert!(matches!(
            service.sign(&document(), None),
            Err(SignatureFault::Creation(_))
        ));
    }

    #[test]
    fn test_explicit_identity_overrides_default() {
        let other = identity_from_seed("CN=other", [3u8; 32]);
        let service = Ed25519SignatureService::new(
            Some(server()),
            vec![other.certificate().clone()],
        );
        let signed = service.sign(&document(), Some(&other)).unwrap();
        assert_eq!(service.verify(&signed).unwrap().subject(), "CN=other");
    }

    #[test]
    fn test_subject_is_escaped() {
        let id = identity_from_seed("CN=\"A&B\"", [5u8; 32]);
        let service = Ed25519SignatureService::new(Some(id.clone()), vec![id.certificate().clone()]);
        let signed = service.sign(&document(), None).unwrap();
        assert_eq!(service.verify(&signed).unwrap().subject(), "CN=\"A&B\"");
    }

    #[test]
    fn test_relabelled_subject_rejected() {
        let id = server();
        let service = Ed25519SignatureService::new(Some(id.clone()), vec![id.certificate().clone()]);

        let signed = String::from_utf8(service.sign(&document(), None).unwrap()).unwrap();
        assert!(signed.contains(r#"subject="CN=endpoint""#));
        let relabelled = signed.replace(r#"subject="CN=endpoint""#, r#"subject="CN=someone-else""#);

        match service.verify(relabelled.as_bytes()).unwrap_err() {
            SignatureFault::Verification { reason, certificate } => {
                assert_eq!(reason, "signature does not match the content");
                assert_eq!(certificate.unwrap().subject(), "CN=someone-else");
            }
            other => panic!("unexpected fault {other:?}"),
        }
    }
}
