#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use tokio::time::{sleep, Duration};

use kdht::protocol::{FindValueResponse, NodesResponse, StoreResponse};
use kdht::{Contact, DhtConfig, DhtNetwork, DhtNode, Kuid};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
    Ping,
    FindNode,
    FindValue,
    Store,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub kind: CallKind,
    pub to: SocketAddr,
}

/// Every node of an in-memory network, by address.
#[derive(Clone, Default)]
pub struct NetworkRegistry {
    peers: Arc<Mutex<HashMap<SocketAddr, DhtNode<MockNetwork>>>>,
}

impl NetworkRegistry {
    pub fn register(&self, node: &DhtNode<MockNetwork>) {
        let mut peers = self.peers.lock().unwrap();
        peers.insert(node.localhost().address(), node.clone());
    }

    pub fn unregister(&self, address: SocketAddr) {
        self.peers.lock().unwrap().remove(&address);
    }

    pub fn get(&self, address: &SocketAddr) -> Option<DhtNode<MockNetwork>> {
        self.peers.lock().unwrap().get(address).cloned()
    }
}

#[derive(Default)]
struct MockState {
    failures: HashSet<SocketAddr>,
    delays: HashMap<CallKind, Duration>,
    peer_delays: HashMap<SocketAddr, Duration>,
    calls: Vec<Call>,
    cancelled: Vec<Call>,
}

/// Delivers requests straight to the target node's handlers.
#[derive(Clone)]
pub struct MockNetwork {
    localhost: Contact,
    registry: NetworkRegistry,
    state: Arc<Mutex<MockState>>,
}

/// Records a call as cancelled if dropped before completion.
struct InFlight<'a> {
    state: &'a Mutex<MockState>,
    call: Option<Call>,
}

impl InFlight<'_> {
    fn complete(mut self) {
        self.call = None;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(call) = self.call.take() {
            if let Ok(mut state) = self.state.lock() {
                state.cancelled.push(call);
            }
        }
    }
}

impl MockNetwork {
    pub fn new(localhost: Contact, registry: NetworkRegistry) -> Self {
        Self {
            localhost,
            registry,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Make every request to `address` fail.
    pub fn set_failure(&self, address: SocketAddr, fail: bool) {
        let mut state = self.state.lock().unwrap();
        if fail {
            state.failures.insert(address);
        } else {
            state.failures.remove(&address);
        }
    }

    /// Delay every request of `kind` before it is delivered.
    pub fn set_delay(&self, kind: CallKind, delay: Duration) {
        self.state.lock().unwrap().delays.insert(kind, delay);
    }

    /// Delay every request to `address`, on top of any per-kind delay.
    pub fn set_peer_delay(&self, address: SocketAddr, delay: Duration) {
        self.state.lock().unwrap().peer_delays.insert(address, delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    /// Calls dropped before they were delivered.
    pub fn cancelled(&self) -> Vec<Call> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn clear_calls(&self) {
        let mut state = self.state.lock().unwrap();
        state.calls.clear();
        state.cancelled.clear();
    }

    async fn deliver<T, F, Fut>(&self, kind: CallKind, to: SocketAddr, handle: F) -> Result<T>
    where
        F: FnOnce(DhtNode<MockNetwork>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let call = Call { kind, to };
        let (failing, delay) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call.clone());
            let delay = state.delays.get(&kind).copied().unwrap_or_default()
                + state.peer_delays.get(&to).copied().unwrap_or_default();
            (state.failures.contains(&to), delay)
        };
        let guard = InFlight {
            state: &self.state,
            call: Some(call),
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let peer = self.registry.get(&to);
        guard.complete();

        if failing {
            bail!("injected network failure");
        }
        let peer = peer.ok_or_else(|| anyhow!("no node listening at {to}"))?;
        handle(peer).await
    }
}

#[async_trait::async_trait]
impl DhtNetwork for MockNetwork {
    async fn ping(&self, to: SocketAddr) -> Result<Contact> {
        let from = self.localhost.clone();
        self.deliver(CallKind::Ping, to, |peer| async move {
            Ok(peer.handle_ping(from).await)
        })
        .await
    }

    async fn find_node(&self, to: &Contact, target: &Kuid) -> Result<NodesResponse> {
        let from = self.localhost.clone();
        let target = target.clone();
        self.deliver(CallKind::FindNode, to.contact_address(), |peer| async move {
            let nodes = peer.handle_find_node(from, &target).await?;
            Ok(NodesResponse {
                responder: peer.localhost().clone(),
                nodes,
            })
        })
        .await
    }

    async fn find_value(&self, to: &Contact, key: &Kuid) -> Result<FindValueResponse> {
        let from = self.localhost.clone();
        let key = key.clone();
        self.deliver(CallKind::FindValue, to.contact_address(), |peer| async move {
            let (value, closer) = peer.handle_find_value(from, &key).await?;
            Ok(FindValueResponse {
                responder: peer.localhost().clone(),
                value,
                closer,
            })
        })
        .await
    }

    async fn store(&self, to: &Contact, key: &Kuid, value: Bytes) -> Result<StoreResponse> {
        let from = self.localhost.clone();
        let key = key.clone();
        self.deliver(CallKind::Store, to.contact_address(), |peer| async move {
            let status = peer.handle_store(from, key, value).await?;
            Ok(StoreResponse {
                responder: peer.localhost().clone(),
                status,
            })
        })
        .await
    }
}

pub struct TestNode {
    pub node: DhtNode<MockNetwork>,
    pub network: MockNetwork,
}

impl TestNode {
    /// A node whose id is `index` in its leading bytes.
    pub fn new(registry: &NetworkRegistry, index: u32, config: DhtConfig) -> Self {
        Self::with_id(registry, make_id(index), index, config)
    }

    pub fn with_id(registry: &NetworkRegistry, id: Kuid, index: u32, config: DhtConfig) -> Self {
        init_tracing();
        let localhost = Contact::localhost(id, make_address(index));
        let network = MockNetwork::new(localhost.clone(), registry.clone());
        let node = DhtNode::new(localhost, network.clone(), config).expect("valid config");
        registry.register(&node);
        Self { node, network }
    }

    pub fn contact(&self) -> Contact {
        self.node.localhost().clone()
    }

    pub fn address(&self) -> SocketAddr {
        self.node.localhost().address()
    }

    pub fn id(&self) -> &Kuid {
        self.node.id()
    }
}

pub fn make_id(index: u32) -> Kuid {
    let mut id = [0u8; 20];
    id[..4].copy_from_slice(&index.to_be_bytes());
    Kuid::from_bytes(id.to_vec())
}

pub fn make_address(index: u32) -> SocketAddr {
    let [_, b, c, d] = index.to_be_bytes();
    SocketAddr::from(([10, b, c, d], 4000))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
