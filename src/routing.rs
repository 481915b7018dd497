//! Kademlia routing table organised as a binary trie of k-buckets.
//!
//! The table starts as a single bucket covering the whole id space. A full
//! bucket splits in two when it covers the local id or is still shallower
//! than `max_depth`; otherwise new contacts wait in the bucket's replacement
//! cache and the least-recently-seen active contact is reported for a
//! liveness probe.
//!
//! Buckets are leaves only. They live in a `BTreeMap` keyed by their prefix,
//! which is also the smallest id they cover, so the leaf covering an id is the
//! entry with the greatest key not above it. A split removes one entry and
//! inserts two.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::RoutingConfig;
use crate::contact::Contact;
use crate::error::{DhtError, DhtResult};
use crate::kuid::{distance_cmp, Kuid};

/// A contact plus the table's opinion of its health.
#[derive(Clone, Debug)]
struct Entry {
    contact: Contact,
    errors: u32,
}

impl Entry {
    fn new(contact: Contact) -> Self {
        Self { contact, errors: 0 }
    }
}

/// One leaf of the routing trie.
#[derive(Clone, Debug)]
pub struct Bucket {
    /// Leading `depth` bits shared by every id in this bucket, rest zero.
    prefix: Kuid,
    depth: usize,
    /// Routable contacts, at most `k`.
    active: Vec<Entry>,
    /// Recently seen contacts waiting for an active slot.
    cache: Vec<Entry>,
    created: Instant,
    touched: Instant,
    /// Active contact currently being pinged on behalf of this bucket.
    probing: Option<Kuid>,
}

impl Bucket {
    fn new(prefix: Kuid, depth: usize) -> Self {
        let now = Instant::now();
        Self {
            prefix,
            depth,
            active: Vec::new(),
            cache: Vec::new(),
            created: now,
            touched: now,
            probing: None,
        }
    }

    pub fn prefix(&self) -> &Kuid {
        &self.prefix
    }

    /// Number of significant prefix bits.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn touched(&self) -> Instant {
        self.touched
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn cache_count(&self) -> usize {
        self.cache.len()
    }

    pub fn active_contacts(&self) -> Vec<Contact> {
        self.active.iter().map(|e| e.contact.clone()).collect()
    }

    pub fn cached_contacts(&self) -> Vec<Contact> {
        self.cache.iter().map(|e| e.contact.clone()).collect()
    }

    /// Whether `id` falls into this bucket's part of the id space.
    pub fn covers(&self, id: &Kuid) -> bool {
        id.as_bytes().len() == self.prefix.as_bytes().len() && id.masked(self.depth) == self.prefix
    }

    /// Whether `id` is held in the active set or the cache.
    pub fn contains(&self, id: &Kuid) -> bool {
        self.position_active(id).is_some() || self.position_cached(id).is_some()
    }

    /// `true` if nothing happened in this bucket for `timeout`.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.touched.elapsed() >= timeout
    }

    /// A random id inside this bucket, used as a refresh lookup target.
    pub fn random_id(&self) -> Kuid {
        if self.depth == 0 {
            Kuid::random(self.prefix.as_bytes().len())
        } else {
            Kuid::random_with_prefix(&self.prefix, self.depth - 1)
        }
    }

    fn position_active(&self, id: &Kuid) -> Option<usize> {
        self.active.iter().position(|e| e.contact.id() == id)
    }

    fn position_cached(&self, id: &Kuid) -> Option<usize> {
        self.cache.iter().position(|e| e.contact.id() == id)
    }

    fn touch(&mut self) {
        self.touched = Instant::now();
    }

    /// Index of the cached entry to give up first: most errors, then least
    /// trusted type, then oldest.
    fn least_healthy_cached(&self) -> Option<usize> {
        self.cache
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.errors
                    .cmp(&b.errors)
                    .then_with(|| b.contact.contact_type().cmp(&a.contact.contact_type()))
                    .then_with(|| b.contact.last_seen().cmp(&a.contact.last_seen()))
            })
            .map(|(idx, _)| idx)
    }

    fn oldest_unverified_cached(&self) -> Option<usize> {
        self.cache
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.contact.is_active())
            .min_by_key(|(_, e)| e.contact.last_seen())
            .map(|(idx, _)| idx)
    }

    /// Index of the cached entry most worth promoting.
    fn healthiest_cached(&self) -> Option<usize> {
        self.cache
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.errors
                    .cmp(&b.errors)
                    .then_with(|| b.contact.contact_type().cmp(&a.contact.contact_type()))
                    .then_with(|| b.contact.last_seen().cmp(&a.contact.last_seen()))
            })
            .map(|(idx, _)| idx)
    }

    /// Move verified cached entries into free active slots.
    fn fill_from_cache(&mut self, k: usize) -> Vec<Contact> {
        let mut promoted = Vec::new();
        while self.active.len() < k {
            let Some(idx) = self
                .healthiest_cached()
                .filter(|&idx| self.cache[idx].contact.is_active())
            else {
                break;
            };
            let entry = self.cache.swap_remove(idx);
            promoted.push(entry.contact.clone());
            self.active.push(entry);
        }
        promoted
    }
}

/// What [`RoutingTable::add`] did with a contact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Inserted into a bucket's active set.
    Added,
    /// Merged into an existing active or cached entry.
    Updated,
    /// Merged and moved from the replacement cache into the active set.
    Promoted,
    /// Parked in the replacement cache, either because the bucket is full or
    /// because the contact is not yet verified. When `probe` is set the caller should
    /// ping that contact and report the result with
    /// [`RoutingTable::on_probe_result`].
    Cached { probe: Option<Contact> },
    /// Nothing changed: the local contact, or a second-hand sighting of a
    /// contact that is already known to be alive.
    Ignored,
}

/// The full routing structure for one local node.
#[derive(Debug)]
pub struct RoutingTable {
    localhost: Contact,
    config: RoutingConfig,
    buckets: BTreeMap<Kuid, Bucket>,
    splits: usize,
}

impl RoutingTable {
    /// Create a table holding only `localhost` in a single root bucket.
    pub fn new(localhost: Contact, config: RoutingConfig) -> Self {
        let len = localhost.id().as_bytes().len();
        let mut root = Bucket::new(Kuid::zero(len), 0);
        root.active.push(Entry::new(localhost.clone()));
        let mut buckets = BTreeMap::new();
        buckets.insert(root.prefix.clone(), root);
        Self {
            localhost,
            config,
            buckets,
            splits: 0,
        }
    }

    pub fn localhost(&self) -> &Contact {
        &self.localhost
    }

    pub fn k(&self) -> usize {
        self.config.k
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Number of splits since construction.
    pub fn split_count(&self) -> usize {
        self.splits
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Snapshot of every bucket in id order.
    pub fn buckets(&self) -> Vec<Bucket> {
        self.buckets.values().cloned().collect()
    }

    /// Total active contacts, the local contact included.
    pub fn active_count(&self) -> usize {
        self.buckets.values().map(|b| b.active.len()).sum()
    }

    pub fn cached_count(&self) -> usize {
        self.buckets.values().map(|b| b.cache.len()).sum()
    }

    /// Look up a contact in the active sets and caches.
    pub fn get(&self, id: &Kuid) -> Option<Contact> {
        let bucket = self.bucket_for(id)?;
        bucket
            .active
            .iter()
            .chain(bucket.cache.iter())
            .find(|e| e.contact.id() == id)
            .map(|e| e.contact.clone())
    }

    /// The bucket covering `id`.
    pub fn bucket(&self, id: &Kuid) -> Option<Bucket> {
        self.bucket_for(id).cloned()
    }

    fn bucket_for(&self, id: &Kuid) -> Option<&Bucket> {
        if self.localhost.id().check_length(id).is_err() {
            return None;
        }
        self.buckets.range(..=id).next_back().map(|(_, b)| b)
    }

    fn bucket_key(&self, id: &Kuid) -> DhtResult<Kuid> {
        self.localhost.id().check_length(id)?;
        self.buckets
            .range(..=id)
            .next_back()
            .map(|(key, _)| key.clone())
            .ok_or_else(|| DhtError::InvalidContact(format!("no bucket covers {id}")))
    }

    fn can_split(&self, bucket: &Bucket) -> bool {
        if bucket.depth >= bucket.prefix.length() {
            return false;
        }
        bucket.covers(self.localhost.id()) || bucket.depth < self.config.max_depth
    }

    fn split(&mut self, key: &Kuid) {
        let Some(bucket) = self.buckets.remove(key) else {
            return;
        };
        let depth = bucket.depth;
        let mut left = Bucket::new(bucket.prefix.clone(), depth + 1);
        let mut right = Bucket::new(bucket.prefix.with_bit(depth, true), depth + 1);
        for child in [&mut left, &mut right] {
            child.created = bucket.created;
            child.touched = bucket.touched;
        }

        for entry in bucket.active {
            if entry.contact.id().bit_at(depth) {
                right.active.push(entry);
            } else {
                left.active.push(entry);
            }
        }
        for entry in bucket.cache {
            if entry.contact.id().bit_at(depth) {
                right.cache.push(entry);
            } else {
                left.cache.push(entry);
            }
        }
        if let Some(probing) = bucket.probing {
            if probing.bit_at(depth) {
                right.probing = Some(probing);
            } else {
                left.probing = Some(probing);
            }
        }
        let k = self.config.k;
        left.fill_from_cache(k);
        right.fill_from_cache(k);

        debug!(
            prefix = %left.prefix.short(),
            depth = depth + 1,
            left = left.active.len(),
            right = right.active.len(),
            "split bucket"
        );
        self.buckets.insert(left.prefix.clone(), left);
        self.buckets.insert(right.prefix.clone(), right);
        self.splits += 1;
    }

    /// Insert or refresh a contact.
    ///
    /// Known ids are merged in place. New ids take a free active slot, split a
    /// full bucket when allowed, or go to the replacement cache. Contacts of
    /// type [`Unknown`](crate::ContactType::Unknown) never take an active slot: they are
    /// cached and promoted once observed alive.
    pub fn add(&mut self, contact: Contact) -> DhtResult<AddOutcome> {
        self.localhost.id().check_length(contact.id())?;
        if contact.id() == self.localhost.id() {
            if contact.instance_id() != self.localhost.instance_id() {
                return Err(DhtError::InvalidContact(format!(
                    "{} claims the local id",
                    contact.address()
                )));
            }
            return Ok(AddOutcome::Ignored);
        }

        let k = self.config.k;
        loop {
            let key = self.bucket_key(contact.id())?;
            let can_split = match self.buckets.get(&key) {
                Some(bucket) => self.can_split(bucket),
                None => false,
            };
            let probe_interval = self.config.probe_interval();
            let cache_size = self.config.cache_size;
            let Some(bucket) = self.buckets.get_mut(&key) else {
                return Err(DhtError::InvalidContact(format!("no bucket covers {}", contact.id())));
            };

            if let Some(idx) = bucket.position_active(contact.id()) {
                let existing = &mut bucket.active[idx];
                if existing.contact.is_active() && !contact.is_active() {
                    return Ok(AddOutcome::Ignored);
                }
                existing.contact = existing.contact.merge(&contact)?;
                if contact.is_active() {
                    existing.errors = 0;
                    if bucket.probing.as_ref() == Some(contact.id()) {
                        bucket.probing = None;
                    }
                }
                bucket.touch();
                trace!(peer = %contact.id().short(), "updated active contact");
                return Ok(AddOutcome::Updated);
            }

            if let Some(idx) = bucket.position_cached(contact.id()) {
                let existing = &mut bucket.cache[idx];
                if !(existing.contact.is_active() && !contact.is_active()) {
                    existing.contact = existing.contact.merge(&contact)?;
                    if contact.is_active() {
                        existing.errors = 0;
                    }
                }
                if bucket.active.len() < k && bucket.cache[idx].contact.is_active() {
                    let entry = bucket.cache.swap_remove(idx);
                    bucket.active.push(entry);
                    bucket.touch();
                    debug!(peer = %contact.id().short(), "promoted cached contact");
                    return Ok(AddOutcome::Promoted);
                }
                return Ok(AddOutcome::Updated);
            }

            // Unverified contacts wait in the cache until they answer a request.
            if !contact.is_active() {
                if bucket.cache.len() >= cache_size {
                    // Only another unverified entry makes room for this one.
                    match bucket.oldest_unverified_cached() {
                        Some(idx) => {
                            bucket.cache.swap_remove(idx);
                        }
                        None => return Ok(AddOutcome::Ignored),
                    }
                }
                bucket.cache.push(Entry::new(contact.clone()));
                trace!(peer = %contact.id().short(), "cached unverified contact");
                return Ok(AddOutcome::Cached { probe: None });
            }

            if bucket.active.len() < k {
                bucket.active.push(Entry::new(contact.clone()));
                bucket.touch();
                trace!(peer = %contact.id().short(), depth = bucket.depth, "added contact");
                return Ok(AddOutcome::Added);
            }

            if can_split {
                self.split(&key);
                continue;
            }

            if bucket.cache.len() >= cache_size {
                match bucket.least_healthy_cached() {
                    Some(idx) => {
                        bucket.cache.swap_remove(idx);
                    }
                    None => return Ok(AddOutcome::Ignored),
                }
            }
            bucket.cache.push(Entry::new(contact.clone()));

            let localhost_id = self.localhost.id();
            let probe = if bucket.probing.is_none() {
                bucket
                    .active
                    .iter()
                    .filter(|e| e.contact.id() != localhost_id)
                    .min_by_key(|e| e.contact.last_seen())
                    .filter(|e| e.contact.last_seen().elapsed() >= probe_interval)
                    .map(|e| e.contact.clone())
            } else {
                None
            };
            if let Some(probe) = &probe {
                bucket.probing = Some(probe.id().clone());
            }
            trace!(
                peer = %contact.id().short(),
                probe = probe.is_some(),
                "cached contact in full bucket"
            );
            return Ok(AddOutcome::Cached { probe });
        }
    }

    /// Up to `count` active contacts ordered by XOR distance to `target`.
    ///
    /// Buckets are visited in order of their distance to `target`, closest
    /// first, and the walk stops once enough candidates are gathered.
    pub fn select(&self, target: &Kuid, count: usize) -> DhtResult<Vec<Contact>> {
        self.localhost.id().check_length(target)?;
        let mut order: Vec<(Kuid, &Bucket)> = self
            .buckets
            .values()
            .map(|b| (b.prefix.xor_unchecked(&target.masked(b.depth)), b))
            .collect();
        order.sort_by(|a, b| a.0.cmp(&b.0));

        let mut selected: Vec<Contact> = Vec::new();
        for (_, bucket) in order {
            if selected.len() >= count {
                break;
            }
            selected.extend(bucket.active.iter().map(|e| e.contact.clone()));
        }
        selected.sort_by(|a, b| distance_cmp(a.id(), b.id(), target));
        selected.truncate(count);
        Ok(selected)
    }

    /// Every active contact, the local one included.
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .values()
            .flat_map(|b| b.active.iter().map(|e| e.contact.clone()))
            .collect()
    }

    /// Record that `id` failed to answer at `address`.
    ///
    /// Reports for an address the contact no longer uses are ignored. Once the
    /// error count reaches `max_errors` the contact is removed and, for an
    /// active contact, the healthiest cached one takes its slot. Returns the
    /// evicted contact.
    pub fn on_contact_error(&mut self, id: &Kuid, address: SocketAddr) -> DhtResult<Option<Contact>> {
        let key = self.bucket_key(id)?;
        if id == self.localhost.id() {
            return Ok(None);
        }
        let max_errors = self.config.max_errors;
        let k = self.config.k;
        let Some(bucket) = self.buckets.get_mut(&key) else {
            return Ok(None);
        };

        let same_address = |contact: &Contact| {
            contact.address() == address || contact.contact_address() == address
        };

        if let Some(idx) = bucket.position_active(id) {
            let entry = &mut bucket.active[idx];
            if !same_address(&entry.contact) {
                return Ok(None);
            }
            entry.errors += 1;
            if entry.errors < max_errors {
                return Ok(None);
            }
            let evicted = bucket.active.remove(idx).contact;
            if bucket.probing.as_ref() == Some(id) {
                bucket.probing = None;
            }
            let promoted = bucket.fill_from_cache(k);
            debug!(
                peer = %id.short(),
                promoted = promoted.len(),
                "evicted contact after repeated errors"
            );
            return Ok(Some(evicted));
        }

        if let Some(idx) = bucket.position_cached(id) {
            let entry = &mut bucket.cache[idx];
            if !same_address(&entry.contact) {
                return Ok(None);
            }
            entry.errors += 1;
            if entry.errors >= max_errors {
                let evicted = bucket.cache.swap_remove(idx).contact;
                trace!(peer = %id.short(), "dropped cached contact after repeated errors");
                return Ok(Some(evicted));
            }
        }
        Ok(None)
    }

    /// Apply the outcome of a liveness probe requested by [`AddOutcome::Cached`].
    ///
    /// A dead contact is evicted at once and replaced from the cache.
    pub fn on_probe_result(&mut self, id: &Kuid, alive: bool) -> DhtResult<Option<Contact>> {
        let key = self.bucket_key(id)?;
        let k = self.config.k;
        let Some(bucket) = self.buckets.get_mut(&key) else {
            return Ok(None);
        };
        if bucket.probing.as_ref() == Some(id) {
            bucket.probing = None;
        }
        if alive {
            return Ok(None);
        }
        let Some(idx) = bucket.position_active(id) else {
            return Ok(None);
        };
        let evicted = bucket.active.remove(idx).contact;
        let promoted = bucket.fill_from_cache(k);
        debug!(
            peer = %id.short(),
            promoted = promoted.len(),
            "evicted contact that failed its probe"
        );
        Ok(Some(evicted))
    }

    /// Mark the bucket covering `id` as recently used.
    pub fn touch_bucket(&mut self, id: &Kuid) -> DhtResult<()> {
        let key = self.bucket_key(id)?;
        if let Some(bucket) = self.buckets.get_mut(&key) {
            bucket.touch();
        }
        Ok(())
    }
}

/// Internally synchronised handle to a [`RoutingTable`].
///
/// Mutations serialise on the write lock; selections share the read lock and
/// always see the trie either before or after a split, never during.
#[derive(Clone, Debug)]
pub struct SharedRoutingTable {
    inner: Arc<RwLock<RoutingTable>>,
    localhost: Contact,
}

impl SharedRoutingTable {
    pub fn new(table: RoutingTable) -> Self {
        let localhost = table.localhost().clone();
        Self {
            inner: Arc::new(RwLock::new(table)),
            localhost,
        }
    }

    pub fn localhost(&self) -> &Contact {
        &self.localhost
    }

    pub async fn k(&self) -> usize {
        self.inner.read().await.k()
    }

    pub async fn add(&self, contact: Contact) -> DhtResult<AddOutcome> {
        self.inner.write().await.add(contact)
    }

    pub async fn select(&self, target: &Kuid, count: usize) -> DhtResult<Vec<Contact>> {
        self.inner.read().await.select(target, count)
    }

    pub async fn on_contact_error(
        &self,
        id: &Kuid,
        address: SocketAddr,
    ) -> DhtResult<Option<Contact>> {
        self.inner.write().await.on_contact_error(id, address)
    }

    pub async fn on_probe_result(&self, id: &Kuid, alive: bool) -> DhtResult<Option<Contact>> {
        self.inner.write().await.on_probe_result(id, alive)
    }

    pub async fn touch_bucket(&self, id: &Kuid) -> DhtResult<()> {
        self.inner.write().await.touch_bucket(id)
    }

    pub async fn get(&self, id: &Kuid) -> Option<Contact> {
        self.inner.read().await.get(id)
    }

    pub async fn buckets(&self) -> Vec<Bucket> {
        self.inner.read().await.buckets()
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.inner.read().await.contacts()
    }

    /// `(buckets, active, cached, splits)` counters for telemetry.
    pub async fn stats(&self) -> (usize, usize, usize, usize) {
        let table = self.inner.read().await;
        (
            table.bucket_count(),
            table.active_count(),
            table.cached_count(),
            table.split_count(),
        )
    }
}
