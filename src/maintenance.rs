//! Periodic table upkeep: bucket refresh and value sync.

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::MaintenanceConfig;
use crate::contact::Contact;
use crate::core::{DhtNetwork, DhtNode};
use crate::error::{DhtError, DhtResult};
use crate::lookup::{self, LookupKind};
use crate::operation::with_cancel;
use crate::store::{self, Value};

/// Counters of one refresh round.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Stale buckets refreshed with a lookup.
    pub lookups: usize,
    pub failed_lookups: usize,
    pub pings: usize,
    pub failed_pings: usize,
}

/// Counters of one sync round.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Keys inspected.
    pub examined: usize,
    /// Keys for which the local node is not among the `k` closest.
    pub not_responsible: usize,
    /// Keys left to a closer node that answered.
    pub deferred: usize,
    /// Keys re-stored to the current closest set.
    pub stored: usize,
    /// Pings sent to closer contacts.
    pub pings: usize,
}

/// Contacts among the closest to the local node that should be pinged: the
/// first `ceil(len * ping_fraction)` of them, minus those heard from within
/// `contact_timeout`.
fn ping_candidates(closest: Vec<Contact>, local: &Contact, config: &MaintenanceConfig) -> Vec<Contact> {
    let peers: Vec<Contact> = closest.into_iter().filter(|c| c.id() != local.id()).collect();
    let count = (peers.len() as f32 * config.ping_fraction).ceil() as usize;
    peers
        .into_iter()
        .take(count)
        .filter(|c| c.last_seen().elapsed() >= config.contact_timeout())
        .collect()
}

/// Refresh stale buckets and ping stale neighbours.
///
/// Every bucket that does not cover the local id and has not been touched for
/// `bucket_timeout` gets a FIND_NODE lookup for a random id inside it. In
/// parallel, a fraction of the local node's closest contacts that have been
/// silent for `contact_timeout` are pinged. Cancelling `cancel` stops all of
/// them.
pub(crate) async fn refresh<N: DhtNetwork>(
    node: &DhtNode<N>,
    config: &MaintenanceConfig,
    cancel: &CancellationToken,
) -> DhtResult<RefreshOutcome> {
    let local = node.localhost().clone();
    let routing = node.routing();
    let lookup_config = node.config().lookup.clone();

    let targets: Vec<_> = routing
        .buckets()
        .await
        .into_iter()
        .filter(|b| !b.covers(local.id()) && b.is_stale(config.bucket_timeout()))
        .map(|b| b.random_id())
        .collect();

    let k = routing.k().await;
    let stale = ping_candidates(routing.select(local.id(), k).await?, &local, config);

    let lookups = join_all(targets.into_iter().map(|target| {
        let token = cancel.child_token();
        let lookup_config = lookup_config.clone();
        async move {
            lookup::run(node, target, LookupKind::Node, &lookup_config, &token).await
        }
    }));
    let pings = join_all(stale.iter().map(|contact| node.ping_contact(contact)));

    let (lookups, pings) = with_cancel(cancel, async { Ok(tokio::join!(lookups, pings)) }).await?;

    let mut outcome = RefreshOutcome::default();
    for result in lookups {
        match result {
            Ok(_) => outcome.lookups += 1,
            Err(DhtError::Cancelled) => return Err(DhtError::Cancelled),
            Err(err) => {
                outcome.failed_lookups += 1;
                debug!("refresh lookup failed: {err}");
            }
        }
    }
    for result in pings {
        outcome.pings += 1;
        if result.is_err() {
            outcome.failed_pings += 1;
        }
    }
    debug!(
        lookups = outcome.lookups,
        failed_lookups = outcome.failed_lookups,
        pings = outcome.pings,
        failed_pings = outcome.failed_pings,
        "refresh finished"
    );
    Ok(outcome)
}

/// Re-replicate locally held values the local node is responsible for.
///
/// For each key, the current `k` closest contacts are taken from the table.
/// If the local node is not among them the key is skipped. Otherwise every
/// contact closer than the local node is pinged, and the value is stored to
/// the closest set only when all of them fail. When the local node is the
/// closest there is nobody to ping and the value is always stored.
pub(crate) async fn sync<N: DhtNetwork>(
    node: &DhtNode<N>,
    cancel: &CancellationToken,
) -> DhtResult<SyncOutcome> {
    let local = node.localhost().clone();
    let routing = node.routing();
    let store_config = node.config().store.clone();
    let k = routing.k().await;
    let keys = node.values().lock().await.keys();

    let mut outcome = SyncOutcome::default();
    for key in keys {
        if cancel.is_cancelled() {
            return Err(DhtError::Cancelled);
        }
        outcome.examined += 1;
        let closest = routing.select(&key, k).await?;
        let Some(position) = closest.iter().position(|c| c.id() == local.id()) else {
            outcome.not_responsible += 1;
            trace!(key = %key.short(), "not among the closest, skipping sync");
            continue;
        };

        if position > 0 {
            outcome.pings += position;
            let token = cancel.child_token();
            let pings = join_all(closest[..position].iter().map(|c| node.ping_contact(c)));
            let results = with_cancel(&token, async { Ok(pings.await) }).await?;
            if results.iter().any(Result::is_ok) {
                outcome.deferred += 1;
                trace!(key = %key.short(), "a closer node answered, skipping sync");
                continue;
            }
        }

        let Some(bytes) = node.values().lock().await.get(&key) else {
            continue;
        };
        let destinations: Vec<Contact> = closest.into_iter().filter(|c| c.id() != local.id()).collect();
        if destinations.is_empty() {
            continue;
        }
        let token = cancel.child_token();
        let stored = store::store_to(
            node,
            key.clone(),
            Value::Repeatable(bytes),
            destinations,
            &store_config,
            &token,
        )
        .await;
        match stored {
            Ok(result) => {
                outcome.stored += 1;
                debug!(
                    key = %key.short(),
                    position,
                    acknowledged = result.acknowledged.len(),
                    "re-stored value"
                );
            }
            Err(DhtError::Cancelled) => return Err(DhtError::Cancelled),
            Err(err) => warn!(key = %key.short(), "sync store failed: {err}"),
        }
    }
    if outcome.stored > 0 {
        info!(
            examined = outcome.examined,
            stored = outcome.stored,
            deferred = outcome.deferred,
            "sync finished"
        );
    }
    Ok(outcome)
}

/// Run refresh then sync every `interval` until `cancel` fires.
pub(crate) async fn run_loop<N: DhtNetwork>(
    node: DhtNode<N>,
    config: MaintenanceConfig,
    cancel: CancellationToken,
) -> DhtResult<()> {
    let mut ticker = tokio::time::interval(config.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        match refresh(&node, &config, &cancel).await {
            Ok(_) => {}
            Err(DhtError::Cancelled) => return Ok(()),
            Err(err) => warn!("refresh failed: {err}"),
        }
        match sync(&node, &cancel).await {
            Ok(_) => {}
            Err(DhtError::Cancelled) => return Ok(()),
            Err(err) => warn!("sync failed: {err}"),
        }
    }
}
