//! TCP implementation of the [`DhtNetwork`] trait.
//!
//! Each RPC opens a fresh connection, writes one [`Rpc`] frame and reads one
//! reply frame. Messages are JSON encoded; see [`crate::framing`] for the
//! frame layout.

use std::net::SocketAddr;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;

use crate::contact::Contact;
use crate::core::DhtNetwork;
use crate::framing::{read_frame, write_frame};
use crate::kuid::Kuid;
use crate::protocol::{FindValueResponse, NodesResponse, Rpc, RpcKind, StoreResponse};

/// Network implementation over plain TCP connections.
#[derive(Clone, Debug)]
pub struct TcpNetwork {
    /// Contact info for the local node (included in all RPC requests).
    localhost: Contact,
}

impl TcpNetwork {
    pub fn new(localhost: Contact) -> Self {
        Self { localhost }
    }

    pub fn localhost(&self) -> &Contact {
        &self.localhost
    }

    /// Send one request to `to` and read its reply.
    async fn call(&self, to: SocketAddr, kind: RpcKind) -> Result<(Contact, RpcKind)> {
        let request = Rpc {
            from: self.localhost.clone(),
            kind,
        };
        let bytes = serde_json::to_vec(&request)?;

        let mut stream = TcpStream::connect(to).await?;
        write_frame(&mut stream, &bytes).await?;
        let reply = read_frame(&mut stream)
            .await?
            .ok_or_else(|| anyhow!("{to} closed the connection without replying"))?;
        let Rpc { from, kind } = serde_json::from_slice(&reply)?;
        if let RpcKind::Error { message } = kind {
            bail!("{to} refused {}: {message}", request.kind.name());
        }
        Ok((from.with_remote_address(to), kind))
    }
}

fn unexpected(expected: &str, got: &RpcKind) -> anyhow::Error {
    anyhow!("expected {expected} reply, got {}", got.name())
}

#[async_trait]
impl DhtNetwork for TcpNetwork {
    async fn ping(&self, to: SocketAddr) -> Result<Contact> {
        match self.call(to, RpcKind::Ping).await? {
            (from, RpcKind::Pong) => Ok(from),
            (_, other) => Err(unexpected("pong", &other)),
        }
    }

    async fn find_node(&self, to: &Contact, target: &Kuid) -> Result<NodesResponse> {
        let kind = RpcKind::FindNode {
            target: target.clone(),
        };
        match self.call(to.contact_address(), kind).await? {
            (responder, RpcKind::Nodes { nodes }) => Ok(NodesResponse { responder, nodes }),
            (_, other) => Err(unexpected("nodes", &other)),
        }
    }

    async fn find_value(&self, to: &Contact, key: &Kuid) -> Result<FindValueResponse> {
        let kind = RpcKind::FindValue { key: key.clone() };
        match self.call(to.contact_address(), kind).await? {
            (responder, RpcKind::Value { value, closer }) => Ok(FindValueResponse {
                responder,
                value,
                closer,
            }),
            (_, other) => Err(unexpected("value", &other)),
        }
    }

    async fn store(&self, to: &Contact, key: &Kuid, value: Bytes) -> Result<StoreResponse> {
        let kind = RpcKind::Store {
            key: key.clone(),
            value,
        };
        match self.call(to.contact_address(), kind).await? {
            (responder, RpcKind::Stored { status }) => Ok(StoreResponse { responder, status }),
            (_, other) => Err(unexpected("stored", &other)),
        }
    }
}
