//! DHT protocol message definitions.
//!
//! Every message is an [`Rpc`] envelope carrying the sender's contact and one
//! [`RpcKind`]. Requests and their replies share the enum; a connection
//! carries exactly one request frame followed by one reply frame.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::contact::Contact;
use crate::kuid::Kuid;
use crate::storage::StoreStatus;

/// Envelope for every message on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rpc {
    /// The sender's contact information.
    pub from: Contact,
    pub kind: RpcKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcKind {
    Ping,
    Pong,
    /// Request for the contacts closest to `target`.
    FindNode { target: Kuid },
    Nodes { nodes: Vec<Contact> },
    /// Request for the value under `key`, or closer contacts.
    FindValue { key: Kuid },
    Value {
        value: Option<Bytes>,
        closer: Vec<Contact>,
    },
    Store { key: Kuid, value: Bytes },
    Stored { status: StoreStatus },
    /// The request could not be served, e.g. a key of the wrong length.
    Error { message: String },
}

impl RpcKind {
    /// Name of the variant for log fields.
    pub fn name(&self) -> &'static str {
        match self {
            RpcKind::Ping => "ping",
            RpcKind::Pong => "pong",
            RpcKind::FindNode { .. } => "find_node",
            RpcKind::Nodes { .. } => "nodes",
            RpcKind::FindValue { .. } => "find_value",
            RpcKind::Value { .. } => "value",
            RpcKind::Store { .. } => "store",
            RpcKind::Stored { .. } => "stored",
            RpcKind::Error { .. } => "error",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            RpcKind::Ping | RpcKind::FindNode { .. } | RpcKind::FindValue { .. } | RpcKind::Store { .. }
        )
    }
}

/// Reply to a FIND_NODE request.
#[derive(Clone, Debug)]
pub struct NodesResponse {
    pub responder: Contact,
    pub nodes: Vec<Contact>,
}

/// Reply to a FIND_VALUE request.
#[derive(Clone, Debug)]
pub struct FindValueResponse {
    pub responder: Contact,
    /// The value if the responder holds it.
    pub value: Option<Bytes>,
    /// Closer nodes to continue the lookup if the value was not found.
    pub closer: Vec<Contact>,
}

/// Reply to a STORE request.
#[derive(Clone, Debug)]
pub struct StoreResponse {
    pub responder: Contact,
    pub status: StoreStatus,
}
