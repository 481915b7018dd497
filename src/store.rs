//! STORE replication.
//!
//! A put is a FIND_NODE lookup for the key followed by STORE requests sent in
//! parallel to the contacts it returned. The store phase collects every
//! outcome; whether enough replicas acknowledged is judged against `w` by
//! [`StoreOutcome::meets_threshold`].

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{LookupConfig, StoreConfig};
use crate::contact::{Contact, ContactType};
use crate::core::{DhtNetwork, DhtNode};
use crate::error::{DhtError, DhtResult};
use crate::kuid::Kuid;
use crate::lookup::{self, LookupKind, LookupResult};
use crate::storage::StoreStatus;

/// Payload of a put.
#[derive(Clone, Debug)]
pub enum Value {
    /// Can be transmitted any number of times.
    Repeatable(Bytes),
    /// Backed by a source that can only be read once, e.g. a drained stream.
    /// Goes to a single contact.
    Once(Bytes),
}

impl Value {
    pub fn is_repeatable(&self) -> bool {
        matches!(self, Value::Repeatable(_))
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    fn bytes(&self) -> &Bytes {
        match self {
            Value::Repeatable(bytes) | Value::Once(bytes) => bytes,
        }
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Self {
        Value::Repeatable(bytes)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Repeatable(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Value {
    fn from(bytes: &'static [u8]) -> Self {
        Value::Repeatable(Bytes::from_static(bytes))
    }
}

/// Tally of one store phase.
#[derive(Clone, Debug)]
pub struct StoreOutcome {
    pub key: Kuid,
    /// Contacts that stored the value.
    pub acknowledged: Vec<Contact>,
    /// Contacts that answered but refused the value.
    pub rejected: Vec<Contact>,
    /// Contacts that did not answer in time or failed.
    pub failed: Vec<Contact>,
    pub w: usize,
    pub elapsed: Duration,
}

impl StoreOutcome {
    /// `true` once at least `w` contacts acknowledged.
    pub fn meets_threshold(&self) -> bool {
        self.acknowledged.len() >= self.w
    }

    pub fn attempted(&self) -> usize {
        self.acknowledged.len() + self.rejected.len() + self.failed.len()
    }
}

/// Result of a full put: the lookup that located the replicas and the store.
#[derive(Clone, Debug)]
pub struct PutOutcome {
    pub lookup: LookupResult,
    pub store: StoreOutcome,
}

/// Reject a put that cannot honour its write threshold.
pub fn validate(value: &Value, config: &StoreConfig) -> DhtResult<()> {
    if config.w == 0 {
        return Err(DhtError::Validation("w must be positive".into()));
    }
    if config.w >= 2 && !value.is_repeatable() {
        return Err(DhtError::Validation(format!(
            "w = {} needs a repeatable value",
            config.w
        )));
    }
    Ok(())
}

enum Delivery {
    Stored,
    Rejected,
    Failed,
}

async fn deliver<N: DhtNetwork>(
    node: DhtNode<N>,
    contact: Contact,
    key: Kuid,
    value: Bytes,
    timeout: Duration,
) -> (Contact, Delivery) {
    if contact.id() == node.localhost().id() {
        let status = node.store_local(key, value).await;
        let delivery = if status.is_stored() {
            Delivery::Stored
        } else {
            Delivery::Rejected
        };
        return (contact, delivery);
    }

    let started = Instant::now();
    let result = tokio::time::timeout(timeout, node.network().store(&contact, &key, value)).await;
    match result {
        Ok(Ok(resp)) if resp.responder.id() == contact.id() => {
            let responder = resp
                .responder
                .with_type(ContactType::Solicited)
                .with_rtt(started.elapsed())
                .with_remote_address(contact.contact_address())
                .touched();
            node.observe_quietly(responder).await;
            match resp.status {
                StoreStatus::Stored => (contact, Delivery::Stored),
                StoreStatus::Rejected => (contact, Delivery::Rejected),
            }
        }
        Ok(Ok(resp)) => {
            debug!(
                peer = %contact.id().short(),
                responder = %resp.responder.id().short(),
                "store answered by unexpected peer"
            );
            node.report_failure(&contact).await;
            (contact, Delivery::Failed)
        }
        Ok(Err(err)) => {
            trace!(peer = %contact.id().short(), "store failed: {err:#}");
            node.report_failure(&contact).await;
            (contact, Delivery::Failed)
        }
        Err(_) => {
            trace!(peer = %contact.id().short(), "store timed out");
            node.report_failure(&contact).await;
            (contact, Delivery::Failed)
        }
    }
}

/// Send `value` to `destinations` in parallel and tally the outcomes.
///
/// `destinations` are expected closest first. A value that can only be sent
/// once goes to the first destination only.
pub(crate) async fn store_to<N: DhtNetwork>(
    node: &DhtNode<N>,
    key: Kuid,
    value: Value,
    mut destinations: Vec<Contact>,
    config: &StoreConfig,
    cancel: &CancellationToken,
) -> DhtResult<StoreOutcome> {
    validate(&value, config)?;
    node.localhost().id().check_length(&key)?;
    if !value.is_repeatable() {
        destinations.truncate(1);
    }

    let started = Instant::now();
    let deadline = started + config.timeout();
    let payload = value.bytes().clone();
    let mut pending: FuturesUnordered<_> = destinations
        .into_iter()
        .map(|contact| {
            deliver(
                node.clone(),
                contact,
                key.clone(),
                payload.clone(),
                config.request_timeout(),
            )
        })
        .collect();

    let mut outcome = StoreOutcome {
        key: key.clone(),
        acknowledged: Vec::new(),
        rejected: Vec::new(),
        failed: Vec::new(),
        w: config.w,
        elapsed: Duration::ZERO,
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DhtError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                debug!(key = %key.short(), "store timed out");
                return Err(DhtError::Timeout(config.timeout()));
            }
            next = pending.next() => next,
        };
        let Some((contact, delivery)) = next else {
            break;
        };
        match delivery {
            Delivery::Stored => outcome.acknowledged.push(contact),
            Delivery::Rejected => outcome.rejected.push(contact),
            Delivery::Failed => outcome.failed.push(contact),
        }
    }

    outcome.elapsed = started.elapsed();
    debug!(
        key = %key.short(),
        acknowledged = outcome.acknowledged.len(),
        rejected = outcome.rejected.len(),
        failed = outcome.failed.len(),
        w = outcome.w,
        "store finished"
    );
    Ok(outcome)
}

/// Locate the `k` closest contacts for `key` and store `value` on them.
///
/// Both phases run under children of `cancel`, so cancelling the put stops
/// whichever phase is running.
pub(crate) async fn put<N: DhtNetwork>(
    node: &DhtNode<N>,
    key: Kuid,
    value: Value,
    lookup_config: &LookupConfig,
    store_config: &StoreConfig,
    cancel: &CancellationToken,
) -> DhtResult<PutOutcome> {
    validate(&value, store_config)?;
    node.localhost().id().check_length(&key)?;

    let lookup_token = cancel.child_token();
    let lookup = lookup::run(node, key.clone(), LookupKind::Node, lookup_config, &lookup_token).await?;

    let store_token = cancel.child_token();
    let store = store_to(node, key, value, lookup.closest.clone(), store_config, &store_token).await?;
    Ok(PutOutcome { lookup, store })
}
