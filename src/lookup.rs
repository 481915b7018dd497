//! Iterative FIND_NODE / FIND_VALUE lookups.
//!
//! A lookup keeps three distance-ordered sets: every contact that answered,
//! the `k` closest of those, and the candidates still to be queried. At most
//! `alpha` requests are in flight. A new request is only sent while it can
//! still improve the result: the closest unqueried candidate must beat the
//! current k-th closest response, unless fewer than `k` responses arrived or
//! the lookup is exhaustive. Every contact is queried at most once.
//!
//! All requests of one lookup are polled from a single `FuturesUnordered`
//! inside the lookup's task, so response and timeout handling never runs
//! concurrently for the same lookup.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::LookupConfig;
use crate::contact::{Contact, ContactType};
use crate::core::{DhtNetwork, DhtNode};
use crate::error::{DhtError, DhtResult};
use crate::kuid::Kuid;

/// What a lookup is looking for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupKind {
    Node,
    Value,
}

/// A value found by a FIND_VALUE lookup.
#[derive(Clone, Debug)]
pub struct FoundValue {
    pub value: Bytes,
    /// The contact that returned it.
    pub holder: Contact,
    /// Hop at which the holder was discovered.
    pub hop: usize,
}

/// Outcome of a completed lookup.
#[derive(Clone, Debug)]
pub struct LookupResult {
    pub target: Kuid,
    /// Up to `k` responders, closest to the target first.
    pub closest: Vec<Contact>,
    /// Hop at which the closest remote responder was discovered, 0 when
    /// only the local node answered.
    pub hops: usize,
    pub elapsed: Duration,
    /// Requests sent.
    pub queried: usize,
    /// Contacts that answered, the local one included.
    pub responded: usize,
    pub timeouts: usize,
    pub failures: usize,
    /// Set when a FIND_VALUE lookup found the value.
    pub value: Option<FoundValue>,
}

impl LookupResult {
    pub fn contains(&self, id: &Kuid) -> bool {
        self.closest.iter().any(|c| c.id() == id)
    }
}

/// Per-lookup bookkeeping, independent of any I/O.
#[derive(Debug)]
pub(crate) struct LookupState {
    target: Kuid,
    localhost: Kuid,
    k: usize,
    exhaustive: bool,
    /// Every responder, keyed by distance to the target.
    responses: BTreeMap<Kuid, (Contact, usize)>,
    /// The `k` closest responders.
    closest: BTreeMap<Kuid, (Contact, usize)>,
    /// Known but not yet queried, keyed by distance.
    to_query: BTreeMap<Kuid, (Contact, usize)>,
    /// Id to the hop at which it was first seen.
    history: HashMap<Kuid, usize>,
    in_flight: usize,
    queried: usize,
    timeouts: usize,
    failures: usize,
}

impl LookupState {
    pub(crate) fn new(target: Kuid, localhost: &Contact, k: usize, exhaustive: bool) -> Self {
        Self {
            target,
            localhost: localhost.id().clone(),
            k: k.max(1),
            exhaustive,
            responses: BTreeMap::new(),
            closest: BTreeMap::new(),
            to_query: BTreeMap::new(),
            history: HashMap::new(),
            in_flight: 0,
            queried: 0,
            timeouts: 0,
            failures: 0,
        }
    }

    fn distance(&self, id: &Kuid) -> Kuid {
        id.xor_unchecked(&self.target)
    }

    /// Seed from the routing table. The local contact counts as responded.
    pub(crate) fn seed(&mut self, contacts: Vec<Contact>) {
        for contact in contacts {
            self.offer(contact, 0);
        }
    }

    /// Record a newly learned contact. Returns `false` if it was seen before.
    fn offer(&mut self, contact: Contact, hop: usize) -> bool {
        if self.history.contains_key(contact.id()) {
            return false;
        }
        self.history.insert(contact.id().clone(), hop);
        if contact.id() == &self.localhost {
            self.record_response(contact, hop);
        } else {
            let distance = self.distance(contact.id());
            self.to_query.insert(distance, (contact, hop));
        }
        true
    }

    fn record_response(&mut self, contact: Contact, hop: usize) {
        let distance = self.distance(contact.id());
        self.responses.insert(distance.clone(), (contact.clone(), hop));
        self.closest.insert(distance, (contact, hop));
        while self.closest.len() > self.k {
            self.closest.pop_last();
        }
    }

    /// Distance of the k-th closest response, if `k` responses exist.
    fn kth_distance(&self) -> Option<&Kuid> {
        if self.closest.len() < self.k {
            None
        } else {
            self.closest.keys().next_back()
        }
    }

    /// Number of to-query candidates that may still be sent, in distance order.
    fn eligible(&self) -> usize {
        if self.exhaustive {
            return self.to_query.len();
        }
        match self.kth_distance() {
            None => self.to_query.len(),
            Some(kth) => self.to_query.range(..kth.clone()).count(),
        }
    }

    /// Take the next candidate to query, chosen at random among the closest
    /// `k` eligible ones.
    pub(crate) fn next_candidate<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<(Contact, usize)> {
        let window = self.eligible().min(self.k);
        if window == 0 {
            return None;
        }
        let pick = rng.gen_range(0..window);
        let key = self.to_query.keys().nth(pick)?.clone();
        let candidate = self.to_query.remove(&key)?;
        self.in_flight += 1;
        self.queried += 1;
        Some(candidate)
    }

    /// Record a successful reply. Returns the contacts not seen before in
    /// this lookup.
    pub(crate) fn on_response(
        &mut self,
        responder: Contact,
        hop: usize,
        returned: Vec<Contact>,
    ) -> Vec<Contact> {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.record_response(responder, hop);
        returned
            .into_iter()
            .filter(|c| self.offer(c.clone(), hop + 1))
            .collect()
    }

    pub(crate) fn on_timeout(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.timeouts += 1;
    }

    pub(crate) fn on_failure(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.failures += 1;
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Nothing in flight and nothing worth sending.
    pub(crate) fn is_done(&self) -> bool {
        self.in_flight == 0 && self.eligible() == 0
    }

    pub(crate) fn hop_of(&self, id: &Kuid) -> Option<usize> {
        self.history.get(id).copied()
    }

    pub(crate) fn finish(self, started: Instant, value: Option<FoundValue>) -> LookupResult {
        let hops = self
            .closest
            .values()
            .find(|(contact, _)| contact.id() != &self.localhost)
            .map(|(_, hop)| *hop)
            .unwrap_or(0);
        LookupResult {
            target: self.target,
            closest: self.closest.into_values().map(|(c, _)| c).collect(),
            hops,
            elapsed: started.elapsed(),
            queried: self.queried,
            responded: self.responses.len(),
            timeouts: self.timeouts,
            failures: self.failures,
            value,
        }
    }
}

enum Reply {
    Nodes {
        responder: Contact,
        nodes: Vec<Contact>,
    },
    Value {
        responder: Contact,
        value: Option<Bytes>,
        closer: Vec<Contact>,
    },
    Failed(anyhow::Error),
    TimedOut,
}

struct Exchange {
    contact: Contact,
    hop: usize,
    rtt: Duration,
    reply: Reply,
}

async fn exchange<N: DhtNetwork>(
    node: DhtNode<N>,
    kind: LookupKind,
    target: Kuid,
    contact: Contact,
    hop: usize,
    timeout: Duration,
) -> Exchange {
    let started = Instant::now();
    let network = node.network();
    let reply = match kind {
        LookupKind::Node => {
            match tokio::time::timeout(timeout, network.find_node(&contact, &target)).await {
                Ok(Ok(resp)) => Reply::Nodes {
                    responder: resp.responder,
                    nodes: resp.nodes,
                },
                Ok(Err(err)) => Reply::Failed(err),
                Err(_) => Reply::TimedOut,
            }
        }
        LookupKind::Value => {
            match tokio::time::timeout(timeout, network.find_value(&contact, &target)).await {
                Ok(Ok(resp)) => Reply::Value {
                    responder: resp.responder,
                    value: resp.value,
                    closer: resp.closer,
                },
                Ok(Err(err)) => Reply::Failed(err),
                Err(_) => Reply::TimedOut,
            }
        }
    };
    Exchange {
        contact,
        hop,
        rtt: started.elapsed(),
        reply,
    }
}

/// Check that a reply is well formed for this lookup.
fn validate_reply(target: &Kuid, queried: &Contact, responder: &Contact, nodes: &[Contact]) -> DhtResult<()> {
    if responder.id() != queried.id() {
        return Err(DhtError::InvalidContact(format!(
            "{} answered for {}",
            responder.id().short(),
            queried.id().short()
        )));
    }
    for contact in nodes {
        target.check_length(contact.id())?;
    }
    Ok(())
}

/// Drive one lookup to completion.
pub(crate) async fn run<N: DhtNetwork>(
    node: &DhtNode<N>,
    target: Kuid,
    kind: LookupKind,
    config: &LookupConfig,
    cancel: &CancellationToken,
) -> DhtResult<LookupResult> {
    let localhost = node.localhost().clone();
    localhost.id().check_length(&target)?;
    let routing = node.routing();
    let k = match config.k {
        Some(k) => k,
        None => routing.k().await,
    };
    let alpha = config.alpha.max(1);
    let started = Instant::now();
    let deadline = started + config.timeout();

    let mut state = LookupState::new(target.clone(), &localhost, k, config.exhaustive);
    state.seed(routing.select(&target, k).await?);
    routing.touch_bucket(&target).await?;

    let mut rng = StdRng::from_entropy();
    let mut pending = FuturesUnordered::new();
    let mut found = None;

    loop {
        while state.in_flight() < alpha {
            let Some((contact, hop)) = state.next_candidate(&mut rng) else {
                break;
            };
            let timeout = contact.adaptive_timeout(
                config.rtt_multiplier,
                config.min_request_timeout(),
                config.request_timeout(),
            );
            trace!(target = %target.short(), peer = %contact.id().short(), hop, "lookup request");
            pending.push(exchange(
                node.clone(),
                kind,
                target.clone(),
                contact,
                hop,
                timeout,
            ));
        }
        if state.is_done() {
            break;
        }

        let done = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DhtError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                debug!(target = %target.short(), queried = state.queried, "lookup timed out");
                return Err(DhtError::Timeout(config.timeout()));
            }
            Some(done) = pending.next() => done,
        };

        let Exchange { contact, hop, rtt, reply } = done;
        let (responder, nodes, value) = match reply {
            Reply::Nodes { responder, nodes } => (responder, nodes, None),
            Reply::Value { responder, value, closer } => (responder, closer, value),
            Reply::TimedOut => {
                state.on_timeout();
                trace!(peer = %contact.id().short(), "lookup request timed out");
                node.report_failure(&contact).await;
                continue;
            }
            Reply::Failed(err) => {
                state.on_failure();
                trace!(peer = %contact.id().short(), "lookup request failed: {err:#}");
                node.report_failure(&contact).await;
                continue;
            }
        };

        if let Err(err) = validate_reply(&target, &contact, &responder, &nodes) {
            state.on_failure();
            debug!(peer = %contact.id().short(), "malformed lookup reply: {err}");
            node.report_failure(&contact).await;
            continue;
        }

        let responder = responder
            .with_type(ContactType::Solicited)
            .with_rtt(rtt)
            .with_remote_address(contact.contact_address())
            .touched();
        node.observe_quietly(responder.clone()).await;

        let fresh = state.on_response(responder.clone(), hop, nodes);
        for contact in fresh {
            if contact.id() != localhost.id() {
                node.observe_quietly(contact.with_type(ContactType::Unknown)).await;
            }
        }

        if let Some(value) = value {
            let hop = state.hop_of(responder.id()).unwrap_or(hop);
            found = Some(FoundValue {
                value,
                holder: responder,
                hop,
            });
            // Dropping `pending` abandons the outstanding requests.
            break;
        }
    }

    let result = state.finish(started, found);
    debug!(
        target = %target.short(),
        kind = ?kind,
        closest = result.closest.len(),
        hops = result.hops,
        queried = result.queried,
        timeouts = result.timeouts,
        found = result.value.is_some(),
        elapsed = ?result.elapsed,
        "lookup finished"
    );
    Ok(result)
}
