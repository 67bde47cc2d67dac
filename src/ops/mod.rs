//! Operation clients: Get, List, Put, Query.
//!
//! Each is a thin stateless builder over [`ExchangeClient`]. Signing
//! defaults to on in both directions and can be overridden per client.

/// Builder methods shared by every operation client.
macro_rules! operation_client {
    ($client:ident) => {
        impl $client {
            pub fn new(exchange: std::sync::Arc<crate::exchange::ExchangeClient>) -> Self {
                Self {
                    op: crate::ops::Operation::new(exchange),
                }
            }

            pub fn with_policy(mut self, sign_outbound: bool, verify_inbound: bool) -> Self {
                self.op = self.op.with_policy(sign_outbound, verify_inbound);
                self
            }

            pub fn with_identity(mut self, identity: crate::signing::Identity) -> Self {
                self.op = self.op.with_identity(identity);
                self
            }

            pub fn policy(&self) -> &crate::signing::SignaturePolicy {
                self.op.policy()
            }
        }
    };
}

pub(crate) use operation_client;

pub mod get;
pub mod list;
pub mod put;
pub mod query;

use std::sync::Arc;

use crate::envelope::RequestEnvelope;
use crate::error::Result;
use crate::exchange::{Exchange, ExchangeClient};
use crate::signing::{Identity, SignaturePolicy};

pub use get::{GetClient, GetContent, GetResult, GetSelector};
pub use list::{IntervalType, ListClient, ListQuery, ListResult, ListWindow};
pub use put::{PutClient, PutContent, PutResult};
pub use query::{QueryClient, QueryRequest};

/// Option names used by the operations.
pub mod option {
    pub const CODE: &str = "Code";
    pub const MESSAGE_IDENTIFICATION: &str = "MessageIdentification";
    pub const VERSION: &str = "Version";
    pub const QUEUE: &str = "Queue";
    pub const QUEUE_NEXT: &str = "NEXT";
    pub const INTERVAL_TYPE: &str = "IntervalType";
    pub const MSG_TYPE: &str = "MsgType";
    pub const OWNER: &str = "Owner";
    pub const DATA_TYPE: &str = "DataType";
}

/// Exchange client plus the signing policy of one operation.
#[derive(Clone)]
pub struct Operation {
    exchange: Arc<ExchangeClient>,
    policy: SignaturePolicy,
}

impl Operation {
    pub fn new(exchange: Arc<ExchangeClient>) -> Self {
        Self {
            exchange,
            policy: SignaturePolicy::default(),
        }
    }

    pub fn with_policy(mut self, sign_outbound: bool, verify_inbound: bool) -> Self {
        self.policy.sign_outbound = sign_outbound;
        self.policy.verify_inbound = verify_inbound;
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.policy.identity = Some(identity);
        self
    }

    pub fn policy(&self) -> &SignaturePolicy {
        &self.policy
    }

    pub fn exchange(&self) -> &ExchangeClient {
        &self.exchange
    }

    async fn send(&self, envelope: &RequestEnvelope) -> Result<Exchange> {
        self.exchange.send(envelope, &self.policy).await
    }
}
