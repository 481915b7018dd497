//! Core DHT node: transport-agnostic Kademlia over a pluggable network.
//!
//! This module ties the building blocks together:
//!
//! - **Identity & Hashing**: [`derive_node_id`], [`hash_content`]
//! - **Network seam**: the [`DhtNetwork`] trait every transport implements
//! - **Node**: [`DhtNode`], which owns the routing table and value store,
//!   answers incoming requests and drives lookups, puts, bootstrap and
//!   maintenance

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use iroh_blake3::Hasher;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::{DhtConfig, LookupConfig, StoreConfig};
use crate::contact::{Contact, ContactType};
use crate::error::{DhtError, DhtResult};
use crate::kuid::{Kuid, DEFAULT_ID_BYTES};
use crate::lookup::{self, LookupKind, LookupResult};
use crate::maintenance::{self, RefreshOutcome, SyncOutcome};
use crate::operation::{with_cancel, Operation};
use crate::protocol::{FindValueResponse, NodesResponse, StoreResponse};
use crate::routing::{AddOutcome, RoutingTable, SharedRoutingTable};
use crate::storage::{MemoryStore, SharedValueStore, StoreStatus, ValueStore};
use crate::store::{self, PutOutcome, StoreOutcome, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Hashing
// ─────────────────────────────────────────────────────────────────────────────

fn blake3_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

fn truncated_digest(data: &[u8]) -> Kuid {
    let digest = blake3_digest(data);
    Kuid::from_bytes(digest[..DEFAULT_ID_BYTES].to_vec())
}

/// Derive a stable 160-bit node id by hashing key material with BLAKE3.
///
/// ```
/// let id = kdht::derive_node_id(b"example-public-key-bytes");
/// assert_eq!(id.length(), 160);
/// ```
pub fn derive_node_id(data: &[u8]) -> Kuid {
    truncated_digest(data)
}

/// Content-addressed key: the BLAKE3 hash of the bytes, truncated to 160 bits.
///
/// ```
/// use kdht::hash_content;
///
/// let key = hash_content(b"hello world");
/// assert_eq!(key, hash_content(b"hello world"));
/// ```
pub fn hash_content(data: &[u8]) -> Kuid {
    truncated_digest(data)
}

/// Check that `key` is the content hash of `value`.
///
/// ```
/// use kdht::{hash_content, verify_key_value_pair};
///
/// let key = hash_content(b"my data");
/// assert!(verify_key_value_pair(&key, b"my data"));
/// assert!(!verify_key_value_pair(&key, b"wrong data"));
/// ```
pub fn verify_key_value_pair(key: &Kuid, value: &[u8]) -> bool {
    hash_content(value) == *key
}

// ─────────────────────────────────────────────────────────────────────────────
// Network Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Network abstraction for DHT RPC operations.
///
/// Implementations own framing, encoding and socket I/O and attach the local
/// contact to every request. The node applies its own timeouts around each
/// call, so an implementation may simply wait for the reply.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// Ping whatever node listens at `to`. Returns its contact.
    async fn ping(&self, to: SocketAddr) -> Result<Contact>;

    /// Send a FIND_NODE RPC.
    async fn find_node(&self, to: &Contact, target: &Kuid) -> Result<NodesResponse>;

    /// Send a FIND_VALUE RPC: the value if `to` holds it, closer contacts otherwise.
    async fn find_value(&self, to: &Contact, key: &Kuid) -> Result<FindValueResponse>;

    /// Send a STORE RPC.
    async fn store(&self, to: &Contact, key: &Kuid, value: Bytes) -> Result<StoreResponse>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot of current node state for telemetry and debugging.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub buckets: usize,
    /// Active contacts, the local one included.
    pub active_contacts: usize,
    pub cached_contacts: usize,
    pub splits: usize,
    pub stored_keys: usize,
    pub stored_bytes: usize,
    /// Replication factor (k).
    pub replication_factor: usize,
    /// Lookup concurrency (alpha).
    pub concurrency: usize,
}

/// Result of [`DhtNode::bootstrap`].
#[derive(Clone, Debug)]
pub struct BootstrapOutcome {
    /// The seed node, as it answered the ping.
    pub seed: Contact,
    /// The lookup for the local id that populated the table.
    pub lookup: LookupResult,
}

// ─────────────────────────────────────────────────────────────────────────────
// DHT Node
// ─────────────────────────────────────────────────────────────────────────────

/// A Kademlia node.
///
/// `DhtNode` is a cheap handle: clones share the routing table, value store,
/// network and shutdown token. It is generic over the network so tests can use
/// an in-memory mock and applications [`crate::net::TcpNetwork`].
///
/// # Key Methods
///
/// * [`bootstrap`](Self::bootstrap) - join the network through a seed address
/// * [`find_node`](Self::find_node) / [`find_value`](Self::find_value) - iterative lookups
/// * [`put`](Self::put) / [`get`](Self::get) - replicate and retrieve values
/// * [`refresh`](Self::refresh) / [`sync`](Self::sync) - table and value upkeep
/// * `handle_*` - answer incoming requests
pub struct DhtNode<N: DhtNetwork> {
    localhost: Contact,
    config: Arc<DhtConfig>,
    routing: SharedRoutingTable,
    values: SharedValueStore,
    network: Arc<N>,
    /// Parent of every token handed to spawned work.
    shutdown: CancellationToken,
}

impl<N: DhtNetwork> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            localhost: self.localhost.clone(),
            config: self.config.clone(),
            routing: self.routing.clone(),
            values: self.values.clone(),
            network: self.network.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<N: DhtNetwork> DhtNode<N> {
    /// Create a node with an in-memory value store.
    pub fn new(localhost: Contact, network: N, config: DhtConfig) -> DhtResult<Self> {
        Self::with_store(localhost, network, config, MemoryStore::default())
    }

    pub fn with_store<S: ValueStore>(
        localhost: Contact,
        network: N,
        config: DhtConfig,
        store: S,
    ) -> DhtResult<Self> {
        config.validate()?;
        let localhost = localhost.with_type(ContactType::Solicited);
        let table = RoutingTable::new(localhost.clone(), config.routing.clone());
        let values: SharedValueStore = Arc::new(Mutex::new(store));
        Ok(Self {
            localhost,
            config: Arc::new(config),
            routing: SharedRoutingTable::new(table),
            values,
            network: Arc::new(network),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn localhost(&self) -> &Contact {
        &self.localhost
    }

    pub fn id(&self) -> &Kuid {
        self.localhost.id()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn routing(&self) -> &SharedRoutingTable {
        &self.routing
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    pub(crate) fn values(&self) -> &SharedValueStore {
        &self.values
    }

    /// Cancel every operation spawned from this node.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    // ── contacts ────────────────────────────────────────────────────────────

    /// Offer a contact to the routing table.
    ///
    /// If its bucket is full and cannot split, the table may nominate a stale
    /// active contact for a liveness probe, which is pinged in the background.
    pub async fn observe_contact(&self, contact: Contact) -> DhtResult<AddOutcome> {
        let outcome = self.routing.add(contact).await?;
        if let AddOutcome::Cached { probe: Some(probe) } = &outcome {
            self.spawn_probe(probe.clone());
        }
        Ok(outcome)
    }

    /// [`observe_contact`](Self::observe_contact) for contacts learned from
    /// peers, where a rejected contact is not the caller's problem.
    pub(crate) async fn observe_quietly(&self, contact: Contact) {
        let peer = contact.id().short();
        if let Err(err) = self.observe_contact(contact).await {
            debug!(peer = %peer, "ignored contact: {err}");
        }
    }

    /// Count a failed request against `contact`.
    pub(crate) async fn report_failure(&self, contact: &Contact) {
        match self
            .routing
            .on_contact_error(contact.id(), contact.contact_address())
            .await
        {
            Ok(Some(evicted)) => debug!(peer = %evicted.id().short(), "evicted unresponsive contact"),
            Ok(None) => {}
            Err(err) => debug!(peer = %contact.id().short(), "could not record failure: {err}"),
        }
    }

    /// Ping-before-evict for a full bucket.
    fn spawn_probe(&self, probe: Contact) {
        let node = self.clone();
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            let reply = tokio::select! {
                _ = token.cancelled() => return,
                reply = node.send_ping(probe.contact_address()) => reply,
            };
            let alive = match reply {
                Ok((responder, rtt)) if responder.id() == probe.id() => {
                    node.observe_quietly(
                        responder
                            .with_type(ContactType::Solicited)
                            .with_rtt(rtt)
                            .touched(),
                    )
                    .await;
                    true
                }
                Ok(_) => false,
                Err(err) => {
                    debug!(
                        peer = %probe.id().short(),
                        addr = %probe.contact_address(),
                        "probe failed: {err}"
                    );
                    false
                }
            };
            if let Err(err) = node.routing.on_probe_result(probe.id(), alive).await {
                debug!(peer = %probe.id().short(), "could not apply probe result: {err}");
            }
        });
    }

    // ── ping ────────────────────────────────────────────────────────────────

    async fn send_ping(&self, to: SocketAddr) -> DhtResult<(Contact, Duration)> {
        let timeout = self.config.ping_timeout();
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.network.ping(to)).await {
            Ok(Ok(responder)) => {
                self.localhost.id().check_length(responder.id())?;
                Ok((responder.with_remote_address(to), started.elapsed()))
            }
            Ok(Err(err)) => Err(DhtError::Network(err)),
            Err(_) => Err(DhtError::Timeout(timeout)),
        }
    }

    /// Ping the node at `address` and add it to the routing table.
    pub async fn ping(&self, address: SocketAddr) -> DhtResult<Contact> {
        let (responder, rtt) = self.send_ping(address).await?;
        let responder = responder
            .with_type(ContactType::Solicited)
            .with_rtt(rtt)
            .touched();
        self.observe_contact(responder.clone()).await?;
        Ok(responder)
    }

    /// Ping a known contact, recording the outcome in the routing table.
    pub(crate) async fn ping_contact(&self, contact: &Contact) -> DhtResult<Contact> {
        match self.send_ping(contact.contact_address()).await {
            Ok((responder, rtt)) if responder.id() == contact.id() => {
                let responder = responder
                    .with_type(ContactType::Solicited)
                    .with_rtt(rtt)
                    .touched();
                self.observe_quietly(responder.clone()).await;
                Ok(responder)
            }
            Ok((responder, _)) => {
                self.report_failure(contact).await;
                Err(DhtError::InvalidContact(format!(
                    "{} answered for {}",
                    responder.id().short(),
                    contact.id().short()
                )))
            }
            Err(err) => {
                self.report_failure(contact).await;
                Err(err)
            }
        }
    }

    // ── lookups ─────────────────────────────────────────────────────────────

    /// Iterative FIND_NODE for `target` with the node's lookup configuration.
    pub async fn find_node(&self, target: &Kuid) -> DhtResult<LookupResult> {
        let token = self.shutdown.child_token();
        self.find_node_with(target, &self.config.lookup, &token).await
    }

    pub async fn find_node_with(
        &self,
        target: &Kuid,
        config: &LookupConfig,
        cancel: &CancellationToken,
    ) -> DhtResult<LookupResult> {
        lookup::run(self, target.clone(), LookupKind::Node, config, cancel).await
    }

    /// Iterative FIND_VALUE for `key`. The result's `value` is set when a
    /// node returned it.
    pub async fn find_value(&self, key: &Kuid) -> DhtResult<LookupResult> {
        let token = self.shutdown.child_token();
        self.find_value_with(key, &self.config.lookup, &token).await
    }

    pub async fn find_value_with(
        &self,
        key: &Kuid,
        config: &LookupConfig,
        cancel: &CancellationToken,
    ) -> DhtResult<LookupResult> {
        lookup::run(self, key.clone(), LookupKind::Value, config, cancel).await
    }

    pub fn spawn_find_node(&self, target: Kuid) -> Operation<LookupResult> {
        let node = self.clone();
        Operation::spawn(&self.shutdown, move |token| async move {
            let config = node.config.lookup.clone();
            node.find_node_with(&target, &config, &token).await
        })
    }

    // ── values ──────────────────────────────────────────────────────────────

    /// Read `key` from the local store, falling back to a FIND_VALUE lookup.
    pub async fn get(&self, key: &Kuid) -> DhtResult<Option<Bytes>> {
        self.localhost.id().check_length(key)?;
        if let Some(value) = self.values.lock().await.get(key) {
            return Ok(Some(value));
        }
        let result = self.find_value(key).await?;
        Ok(result.value.map(|found| found.value))
    }

    /// Store `value` under `key` on the `k` closest nodes.
    pub async fn put(&self, key: Kuid, value: impl Into<Value>) -> DhtResult<PutOutcome> {
        let token = self.shutdown.child_token();
        self.put_with(key, value.into(), &self.config.lookup, &self.config.store, &token)
            .await
    }

    pub async fn put_with(
        &self,
        key: Kuid,
        value: Value,
        lookup_config: &LookupConfig,
        store_config: &StoreConfig,
        cancel: &CancellationToken,
    ) -> DhtResult<PutOutcome> {
        store::put(self, key, value, lookup_config, store_config, cancel).await
    }

    /// [`put`](Self::put) as a cancellable background operation.
    pub fn spawn_put(&self, key: Kuid, value: impl Into<Value>) -> Operation<PutOutcome> {
        let node = self.clone();
        let value = value.into();
        Operation::spawn(&self.shutdown, move |token| async move {
            let lookup_config = node.config.lookup.clone();
            let store_config = node.config.store.clone();
            node.put_with(key, value, &lookup_config, &store_config, &token)
                .await
        })
    }

    /// Store `value` on the given contacts without a lookup.
    pub async fn store(
        &self,
        key: Kuid,
        value: impl Into<Value>,
        destinations: Vec<Contact>,
    ) -> DhtResult<StoreOutcome> {
        let token = self.shutdown.child_token();
        store::store_to(self, key, value.into(), destinations, &self.config.store, &token).await
    }

    pub(crate) async fn store_local(&self, key: Kuid, value: Bytes) -> StoreStatus {
        let mut values = self.values.lock().await;
        values.store(key, value)
    }

    // ── bootstrap & maintenance ─────────────────────────────────────────────

    /// Join the network: ping `seed`, then look up the local id so the table
    /// fills with the nodes around it.
    pub async fn bootstrap(&self, seed: SocketAddr) -> DhtResult<BootstrapOutcome> {
        let token = self.shutdown.child_token();
        self.bootstrap_with(seed, &token).await
    }

    pub async fn bootstrap_with(
        &self,
        seed: SocketAddr,
        cancel: &CancellationToken,
    ) -> DhtResult<BootstrapOutcome> {
        let ping_token = cancel.child_token();
        let seed_contact = with_cancel(&ping_token, self.ping(seed)).await?;

        let lookup_token = cancel.child_token();
        let config = self.config.lookup.clone();
        let lookup = self
            .find_node_with(self.localhost.id(), &config, &lookup_token)
            .await?;
        info!(
            seed = %seed_contact,
            found = lookup.closest.len(),
            hops = lookup.hops,
            "bootstrap complete"
        );
        Ok(BootstrapOutcome {
            seed: seed_contact,
            lookup,
        })
    }

    pub fn spawn_bootstrap(&self, seed: SocketAddr) -> Operation<BootstrapOutcome> {
        let node = self.clone();
        Operation::spawn(&self.shutdown, move |token| async move {
            node.bootstrap_with(seed, &token).await
        })
    }

    /// One refresh round: lookups into stale buckets and pings to stale
    /// neighbours.
    pub async fn refresh(&self) -> DhtResult<RefreshOutcome> {
        let token = self.shutdown.child_token();
        self.refresh_with(&token).await
    }

    /// [`refresh`](Self::refresh) under a caller-owned token. Cancelling it
    /// drops the round's outstanding lookups and pings.
    pub async fn refresh_with(&self, cancel: &CancellationToken) -> DhtResult<RefreshOutcome> {
        maintenance::refresh(self, &self.config.maintenance, cancel).await
    }

    pub fn spawn_refresh(&self) -> Operation<RefreshOutcome> {
        let node = self.clone();
        Operation::spawn(&self.shutdown, move |token| async move {
            node.refresh_with(&token).await
        })
    }

    /// One sync round over the locally stored values.
    pub async fn sync(&self) -> DhtResult<SyncOutcome> {
        let token = self.shutdown.child_token();
        self.sync_with(&token).await
    }

    pub async fn sync_with(&self, cancel: &CancellationToken) -> DhtResult<SyncOutcome> {
        maintenance::sync(self, cancel).await
    }

    pub fn spawn_sync(&self) -> Operation<SyncOutcome> {
        let node = self.clone();
        Operation::spawn(&self.shutdown, move |token| async move {
            node.sync_with(&token).await
        })
    }

    /// Run refresh and sync every `maintenance.interval` until cancelled.
    pub fn spawn_maintenance(&self) -> Operation<()> {
        let node = self.clone();
        let config = self.config.maintenance.clone();
        Operation::spawn(&self.shutdown, move |token| {
            maintenance::run_loop(node, config, token)
        })
    }

    // ── request handlers ────────────────────────────────────────────────────

    async fn observe_sender(&self, from: Contact) {
        trace!(peer = %from.id().short(), "request from peer");
        self.observe_quietly(from.with_type(ContactType::Unsolicited).touched())
            .await;
    }

    /// Handle an incoming PING. Returns the local contact.
    pub async fn handle_ping(&self, from: Contact) -> Contact {
        self.observe_sender(from).await;
        self.localhost.clone()
    }

    /// Handle an incoming FIND_NODE: the `k` closest contacts to `target`,
    /// excluding the requester.
    pub async fn handle_find_node(&self, from: Contact, target: &Kuid) -> DhtResult<Vec<Contact>> {
        self.localhost.id().check_length(target)?;
        let requester = from.id().clone();
        self.observe_sender(from).await;
        self.closest_for(target, &requester).await
    }

    /// Handle an incoming FIND_VALUE: the value if held locally, closer
    /// contacts otherwise.
    pub async fn handle_find_value(
        &self,
        from: Contact,
        key: &Kuid,
    ) -> DhtResult<(Option<Bytes>, Vec<Contact>)> {
        self.localhost.id().check_length(key)?;
        let requester = from.id().clone();
        self.observe_sender(from).await;
        if let Some(value) = self.values.lock().await.get(key) {
            return Ok((Some(value), Vec::new()));
        }
        Ok((None, self.closest_for(key, &requester).await?))
    }

    /// Handle an incoming STORE.
    pub async fn handle_store(&self, from: Contact, key: Kuid, value: Bytes) -> DhtResult<StoreStatus> {
        self.localhost.id().check_length(&key)?;
        let peer = from.id().short();
        self.observe_sender(from).await;
        let size = value.len();
        let status = self.store_local(key.clone(), value).await;
        debug!(peer = %peer, key = %key.short(), size, ?status, "handled store");
        Ok(status)
    }

    async fn closest_for(&self, target: &Kuid, requester: &Kuid) -> DhtResult<Vec<Contact>> {
        let k = self.routing.k().await;
        let mut closest = self.routing.select(target, k + 1).await?;
        closest.retain(|c| c.id() != requester);
        closest.truncate(k);
        Ok(closest)
    }

    /// Get a snapshot of current node state for telemetry.
    pub async fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let (buckets, active_contacts, cached_contacts, splits) = self.routing.stats().await;
        let (stored_keys, stored_bytes) = {
            let values = self.values.lock().await;
            (values.len(), values.stored_bytes())
        };
        TelemetrySnapshot {
            buckets,
            active_contacts,
            cached_contacts,
            splits,
            stored_keys,
            stored_bytes,
            replication_factor: self.routing.k().await,
            concurrency: self.config.lookup.alpha,
        }
    }
}
