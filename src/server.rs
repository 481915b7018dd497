//! Inbound side of the TCP transport.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::contact::Contact;
use crate::core::{DhtNetwork, DhtNode};
use crate::error::DhtError;
use crate::framing::{read_frame, write_frame};
use crate::operation::Operation;
use crate::protocol::{Rpc, RpcKind};

/// Answer a single request read from `stream`.
///
/// A connection carries one request frame and one reply frame; the client
/// closes it after reading the reply. `remote` is the observed peer address,
/// used when the peer reports an unspecified IP.
pub async fn handle_connection<N, S>(node: &DhtNode<N>, mut stream: S, remote: SocketAddr) -> Result<()>
where
    N: DhtNetwork,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(bytes) = read_frame(&mut stream).await? else {
        return Ok(());
    };
    let rpc: Rpc = serde_json::from_slice(&bytes)?;
    let from = rpc.from.with_remote_address(remote);
    let request = rpc.kind.name();

    let reply_kind = dispatch(node, from, rpc.kind).await;
    if let RpcKind::Error { message } = &reply_kind {
        debug!(%remote, request, "request refused: {message}");
    }

    let reply = Rpc {
        from: node.localhost().clone(),
        kind: reply_kind,
    };
    let reply_bytes = serde_json::to_vec(&reply)?;
    write_frame(&mut stream, &reply_bytes).await?;
    Ok(())
}

async fn dispatch<N: DhtNetwork>(node: &DhtNode<N>, from: Contact, kind: RpcKind) -> RpcKind {
    match kind {
        RpcKind::Ping => {
            node.handle_ping(from).await;
            RpcKind::Pong
        }
        RpcKind::FindNode { target } => match node.handle_find_node(from, &target).await {
            Ok(nodes) => RpcKind::Nodes { nodes },
            Err(err) => RpcKind::Error {
                message: err.to_string(),
            },
        },
        RpcKind::FindValue { key } => match node.handle_find_value(from, &key).await {
            Ok((value, closer)) => RpcKind::Value { value, closer },
            Err(err) => RpcKind::Error {
                message: err.to_string(),
            },
        },
        RpcKind::Store { key, value } => match node.handle_store(from, key, value).await {
            Ok(status) => RpcKind::Stored { status },
            Err(err) => RpcKind::Error {
                message: err.to_string(),
            },
        },
        // Replies never arrive as requests on a fresh connection.
        other => RpcKind::Error {
            message: format!("unexpected {} request", other.name()),
        },
    }
}

/// Accept connections on `listener` until the node shuts down or the
/// returned operation is cancelled. Connections still being served are
/// closed at that point too.
pub fn spawn_server<N: DhtNetwork>(node: &DhtNode<N>, listener: TcpListener) -> Operation<()> {
    let node = node.clone();
    let parent = node.shutdown_token().clone();
    Operation::spawn(&parent, move |token| async move {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, id = %node.id().short(), "dht server listening");
        }
        loop {
            let (stream, remote) = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => return Err(DhtError::Io(err)),
                },
            };
            let node = node.clone();
            let connection = token.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = connection.cancelled() => {
                        debug!(%remote, "connection dropped on server shutdown");
                    }
                    result = handle_connection(&node, stream, remote) => {
                        if let Err(err) = result {
                            debug!(%remote, "connection failed: {err:#}");
                        }
                    }
                }
            });
        }
    })
}
