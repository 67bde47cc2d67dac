//! In-process endpoint for integration tests.
//!
//! Speaks the same envelope codec as a real endpoint: decodes requests,
//! checks the client signature, answers List/Get/Create and signs the
//! response with its own key.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};

use mexsync::envelope::codec;
use mexsync::envelope::message_list;
use mexsync::envelope::{
    Body, Header, MessageListEntry, Payload, Reply, ReplyError, RequestEnvelope, ResponseEnvelope,
    Verb, NOUN_ANY, NOUN_MESSAGE_LIST, RESULT_FAILED,
};
use mexsync::error::TransportFault;
use mexsync::exchange::ExchangeClient;
use mexsync::signing::ed25519::identity_from_seed;
use mexsync::signing::{Ed25519SignatureService, Identity, SignatureService};
use mexsync::transport::{HttpResponse, Transport};

pub const CLIENT_SEED: [u8; 32] = [7; 32];
pub const SERVER_SEED: [u8; 32] = [9; 32];

pub fn client_identity() -> Identity {
    identity_from_seed("CN=participant", CLIENT_SEED)
}

pub fn server_identity() -> Identity {
    identity_from_seed("CN=market-operator", SERVER_SEED)
}

/// A list entry with fixed timestamps.
pub fn entry(code: u64, message_type: &str, message_id: &str) -> MessageListEntry {
    let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    MessageListEntry {
        code,
        message_identification: message_id.to_string(),
        version: Some("1".to_string()),
        status: None,
        application_start: ts,
        application_end: None,
        server_timestamp: ts,
        message_type: message_type.to_string(),
        owner: "10X-OPERATOR".to_string(),
    }
}

pub struct FakeEndpoint {
    messages: Mutex<BTreeMap<u64, (MessageListEntry, Payload)>>,
    signer: Ed25519SignatureService,
    client_verifier: Ed25519SignatureService,
    requests: Mutex<Vec<RequestEnvelope>>,
    failing_gets: Mutex<Vec<u64>>,
    ownerless: Mutex<Vec<u64>>,
    fetches: AtomicUsize,
    status: AtomicU16,
    pub tamper: AtomicBool,
    pub soap_fault: AtomicBool,
    pub fail_list: AtomicBool,
    pub require_signed_requests: AtomicBool,
    /// List newest first instead of in code order.
    pub reverse_listing: AtomicBool,
}

impl FakeEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(BTreeMap::new()),
            signer: Ed25519SignatureService::new(Some(server_identity()), Vec::new()),
            client_verifier: Ed25519SignatureService::new(
                None,
                vec![client_identity().certificate().clone()],
            ),
            requests: Mutex::new(Vec::new()),
            failing_gets: Mutex::new(Vec::new()),
            ownerless: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            status: AtomicU16::new(200),
            tamper: AtomicBool::new(false),
            soap_fault: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
            require_signed_requests: AtomicBool::new(true),
            reverse_listing: AtomicBool::new(false),
        })
    }

    pub fn add_xml(&self, code: u64, message_type: &str, message_id: &str, xml: &str) {
        let payload = Payload::inline(xml).unwrap();
        self.messages
            .lock()
            .unwrap()
            .insert(code, (entry(code, message_type, message_id), payload));
    }

    pub fn add_binary(&self, code: u64, message_type: &str, message_id: &str, data: &[u8], file_name: &str) {
        let payload =
            Payload::compress(data, Some("PDF".to_string()), Some(file_name.to_string())).unwrap();
        self.messages
            .lock()
            .unwrap()
            .insert(code, (entry(code, message_type, message_id), payload));
    }

    pub fn fail_get(&self, code: u64) {
        self.failing_gets.lock().unwrap().push(code);
    }

    /// List `code` without its `Owner` element.
    pub fn drop_owner(&self, code: u64) {
        self.ownerless.lock().unwrap().push(code);
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    /// Number of Get-by-code requests answered.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RequestEnvelope> {
        self.requests.lock().unwrap().clone()
    }

    /// Exchange client that signs as the participant and trusts this endpoint.
    pub fn client(self: &Arc<Self>) -> Arc<ExchangeClient> {
        let signer = Ed25519SignatureService::new(
            Some(client_identity()),
            vec![server_identity().certificate().clone()],
        );
        Arc::new(ExchangeClient::new(
            Arc::clone(self) as Arc<dyn Transport>,
            Arc::new(signer),
        ))
    }

    fn render_list(&self, mut entries: Vec<MessageListEntry>) -> String {
        if self.reverse_listing.load(Ordering::SeqCst) {
            entries.reverse();
        }
        let ownerless = self.ownerless.lock().unwrap();
        let mut xml = String::from("<MessageList>");
        for mut e in entries {
            let drop_owner = ownerless.contains(&e.code);
            if drop_owner {
                e.owner.clear();
            }
            let one = message_list::render(&[e]);
            let mut message = one
                .trim_start_matches("<MessageList>")
                .trim_end_matches("</MessageList>")
                .to_string();
            if drop_owner {
                message = message.replace("<Owner></Owner>", "");
            }
            xml.push_str(&message);
        }
        xml.push_str("</MessageList>");
        xml
    }

    fn respond(&self, request: &RequestEnvelope) -> ResponseEnvelope {
        let Header { verb, noun, .. } = &request.header;
        match (verb, noun.as_str(), &request.body) {
            (Verb::Get, NOUN_MESSAGE_LIST, Body::Request(req)) => {
                let after: u64 = req.option("Code").and_then(|c| c.parse().ok()).unwrap_or(0);
                let entries: Vec<MessageListEntry> = self
                    .messages
                    .lock()
                    .unwrap()
                    .range(after + 1..)
                    .map(|(_, (entry, _))| entry.clone())
                    .filter(|e| req.option("MsgType").map_or(true, |t| t == e.message_type))
                    .collect();
                let payload = Payload::inline(self.render_list(entries)).unwrap();
                ResponseEnvelope::reply(Some(payload), NOUN_MESSAGE_LIST)
            }
            (Verb::Get, NOUN_ANY, Body::Request(req)) => {
                if let Some(data_type) = req.option("DataType") {
                    let payload =
                        Payload::inline(format!("<{data_type}><Value>42</Value></{data_type}>")).unwrap();
                    return ResponseEnvelope::reply(Some(payload), data_type);
                }
                let messages = self.messages.lock().unwrap();
                let found = if req.option("Queue") == Some("NEXT") {
                    messages.values().next().cloned()
                } else if let Some(code) = req.option("Code").and_then(|c| c.parse::<u64>().ok()) {
                    self.fetches.fetch_add(1, Ordering::SeqCst);
                    if self.failing_gets.lock().unwrap().contains(&code) {
                        return failed(NOUN_ANY, "MESSAGE_UNAVAILABLE");
                    }
                    messages.get(&code).cloned()
                } else {
                    messages
                        .values()
                        .find(|(e, _)| req.option("MessageIdentification") == Some(e.message_identification.as_str()))
                        .cloned()
                };
                match found {
                    Some((_, payload)) => {
                        let noun = payload.root_tag().to_string();
                        ResponseEnvelope::reply(Some(payload), &noun)
                    }
                    None => failed(NOUN_ANY, "NOT_FOUND"),
                }
            }
            (Verb::Create, _, Body::Payload(_)) => {
                let mut messages = self.messages.lock().unwrap();
                let code = messages.keys().next_back().copied().unwrap_or(0) + 1;
                let mut response = ResponseEnvelope::reply(None, noun);
                if let Some(reply) = response.reply.as_mut() {
                    reply.ids.push(("MessageCode".to_string(), code.to_string()));
                }
                if let Body::Payload(payload) = &request.body {
                    messages.insert(code, (entry(code, noun, &format!("PUT-{code}")), payload.clone()));
                }
                response
            }
            _ => failed(noun, "UNSUPPORTED"),
        }
    }
}

fn failed(noun: &str, code: &str) -> ResponseEnvelope {
    ResponseEnvelope {
        header: Some(Header::new(Verb::Reply, noun)),
        reply: Some(Reply {
            result: RESULT_FAILED.to_string(),
            ids: Vec::new(),
            errors: vec![ReplyError {
                code: code.to_string(),
                details: Some(format!("{code} for this request")),
            }],
        }),
        payload: None,
    }
}

fn fault(message: &str) -> HttpResponse {
    HttpResponse {
        status: 500,
        date: Some(Utc::now()),
        body: Bytes::from(codec::encode_fault("soapenv:Server", message, Some("fake endpoint")).unwrap()),
    }
}

#[async_trait]
impl Transport for FakeEndpoint {
    async fn post(&self, body: Bytes) -> Result<HttpResponse, TransportFault> {
        if self.soap_fault.load(Ordering::SeqCst) {
            return Ok(fault("Queue unavailable"));
        }
        if self.require_signed_requests.load(Ordering::SeqCst)
            && self.client_verifier.verify(&body).is_err()
        {
            return Ok(fault("Request signature rejected"));
        }

        let request = match codec::decode_request(&body) {
            Ok(request) => request,
            Err(e) => return Ok(fault(&e.to_string())),
        };
        self.requests.lock().unwrap().push(request.clone());

        if self.fail_list.load(Ordering::SeqCst) && request.header.noun == NOUN_MESSAGE_LIST {
            return Err(TransportFault::ConnectionRefused("endpoint is down".to_string()));
        }

        let response = self.respond(&request);
        let encoded = codec::encode_response(&response).unwrap();
        let mut signed = self.signer.sign(&encoded, None).unwrap();
        if self.tamper.load(Ordering::SeqCst) {
            signed.extend_from_slice(b"<!-- altered in transit -->");
        }

        Ok(HttpResponse {
            status: self.status.load(Ordering::SeqCst),
            date: Some(Utc::now()),
            body: Bytes::from(signed),
        })
    }
}
