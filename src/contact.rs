//! Peer handles.
//!
//! A [`Contact`] is an immutable observation of a peer. Two contacts with the
//! same id are the same peer regardless of address or liveness, so equality
//! and hashing only look at the id. Newer observations are folded into older
//! ones with [`Contact::merge`].

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use crate::error::{DhtError, DhtResult};
use crate::kuid::Kuid;

/// How a contact was learned, in increasing order of trust.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContactType {
    /// Learned second-hand, e.g. from a FIND_NODE response. Not known to be alive.
    #[default]
    Unknown,
    /// The peer sent us a request.
    Unsolicited,
    /// The peer answered one of our requests.
    Solicited,
}

impl ContactType {
    pub fn is_active(self) -> bool {
        !matches!(self, ContactType::Unknown)
    }
}

/// An identified, addressable, timestamped peer.
///
/// Only the id, instance id, reported address and attributes travel over the
/// wire. Liveness, RTT and timestamps are local knowledge and reset on decode.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    id: Kuid,
    #[serde(default)]
    instance_id: u32,
    address: SocketAddr,
    #[serde(skip)]
    remote_address: Option<SocketAddr>,
    #[serde(skip)]
    contact_type: ContactType,
    #[serde(skip)]
    rtt: Option<Duration>,
    #[serde(skip, default = "Instant::now")]
    created: Instant,
    #[serde(skip, default = "Instant::now")]
    last_seen: Instant,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, String>,
}

impl Contact {
    /// A second-hand contact seen just now.
    pub fn new(id: Kuid, address: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            instance_id: 0,
            address,
            remote_address: None,
            contact_type: ContactType::Unknown,
            rtt: None,
            created: now,
            last_seen: now,
            attributes: BTreeMap::new(),
        }
    }

    /// The contact describing the local node. A fresh instance id is drawn so
    /// peers can tell restarts of the same identity apart.
    pub fn localhost(id: Kuid, address: SocketAddr) -> Self {
        Self::new(id, address)
            .with_instance_id(rand::random())
            .with_type(ContactType::Solicited)
    }

    pub fn with_type(mut self, contact_type: ContactType) -> Self {
        self.contact_type = contact_type;
        self
    }

    pub fn with_instance_id(mut self, instance_id: u32) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn with_rtt(mut self, rtt: Duration) -> Self {
        self.rtt = Some(rtt);
        self
    }

    /// Record the address traffic from this peer was actually observed from.
    pub fn with_remote_address(mut self, remote: SocketAddr) -> Self {
        self.remote_address = Some(remote);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Copy of this contact marked as seen now.
    pub fn touched(&self) -> Self {
        let mut copy = self.clone();
        copy.last_seen = Instant::now();
        copy
    }

    pub fn id(&self) -> &Kuid {
        &self.id
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    /// The address the peer reports for itself.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }

    /// Where requests for this peer should be sent. A peer that reports an
    /// unspecified IP is reached on the address we observed it from.
    pub fn contact_address(&self) -> SocketAddr {
        match self.remote_address {
            Some(remote) if self.address.ip().is_unspecified() => {
                SocketAddr::new(remote.ip(), self.address.port())
            }
            _ => self.address,
        }
    }

    pub fn contact_type(&self) -> ContactType {
        self.contact_type
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_active(&self) -> bool {
        self.contact_type.is_active()
    }

    /// Per-request timeout derived from the measured RTT:
    /// `rtt * multiplier` clamped to `[floor, default_timeout]`, or
    /// `default_timeout` when no RTT is known. A zero RTT counts as unknown.
    pub fn adaptive_timeout(&self, multiplier: u32, floor: Duration, default_timeout: Duration) -> Duration {
        self.rtt
            .filter(|rtt| !rtt.is_zero())
            .and_then(|rtt| rtt.checked_mul(multiplier))
            .map(|scaled| scaled.max(floor).min(default_timeout))
            .unwrap_or(default_timeout)
    }

    /// Fold another observation of the same peer into this one.
    ///
    /// The newer observation (by last-seen time) supplies the address,
    /// instance, type and attributes. The creation time of `self` is kept.
    pub fn merge(&self, other: &Contact) -> DhtResult<Contact> {
        if self.id != other.id {
            return Err(DhtError::InvalidContact(format!(
                "cannot merge {} into {}",
                other.id, self.id
            )));
        }
        let (newer, older) = if other.last_seen >= self.last_seen {
            (other, self)
        } else {
            (self, other)
        };
        let mut merged = newer.clone();
        merged.created = self.created;
        merged.rtt = newer.rtt.or(older.rtt);
        merged.remote_address = newer.remote_address.or(older.remote_address);
        Ok(merged)
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({:?})", self.id.short(), self.address, self.contact_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn id(byte: u8) -> Kuid {
        let mut bytes = [0u8; 20];
        bytes[0] = byte;
        Kuid::from_bytes(bytes.to_vec())
    }

    #[test]
    fn equality_and_hash_use_id_only() {
        let a = Contact::new(id(1), addr(1000));
        let b = Contact::new(id(1), addr(2000)).with_type(ContactType::Solicited);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
        assert!(set.insert(Contact::new(id(2), addr(1000))));
    }

    #[test]
    fn activity_follows_type() {
        let contact = Contact::new(id(1), addr(1));
        assert!(!contact.is_active());
        assert!(contact.clone().with_type(ContactType::Unsolicited).is_active());
        assert!(contact.with_type(ContactType::Solicited).is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn merge_adopts_newer_fields_and_keeps_creation_time() {
        let original = Contact::new(id(7), addr(1000)).with_rtt(Duration::from_millis(40));
        tokio::time::advance(Duration::from_secs(5)).await;
        let update = Contact::new(id(7), addr(2000))
            .with_type(ContactType::Solicited)
            .with_instance_id(9)
            .with_attribute("proto", "2");

        let merged = original.merge(&update).unwrap();
        assert_eq!(merged.address(), addr(2000));
        assert_eq!(merged.contact_type(), ContactType::Solicited);
        assert_eq!(merged.instance_id(), 9);
        assert_eq!(merged.attribute("proto"), Some("2"));
        assert_eq!(merged.created(), original.created());
        assert_eq!(merged.last_seen(), update.last_seen());
        assert_eq!(merged.rtt(), Some(Duration::from_millis(40)));

        // An older observation does not overwrite newer fields.
        let stale = update.merge(&original).unwrap();
        assert_eq!(stale.address(), addr(2000));
        assert_eq!(stale.created(), update.created());
    }

    #[test]
    fn merge_rejects_different_ids() {
        let a = Contact::new(id(1), addr(1));
        let b = Contact::new(id(2), addr(1));
        assert!(matches!(a.merge(&b), Err(DhtError::InvalidContact(_))));
    }

    #[test]
    fn adaptive_timeout_is_clamped() {
        let default = Duration::from_secs(3);
        let floor = Duration::from_millis(250);
        let unknown = Contact::new(id(1), addr(1));
        assert_eq!(unknown.adaptive_timeout(3, floor, default), default);

        let fast = unknown.clone().with_rtt(Duration::from_millis(100));
        assert_eq!(fast.adaptive_timeout(3, floor, default), Duration::from_millis(300));

        let slow = unknown.clone().with_rtt(Duration::from_secs(2));
        assert_eq!(slow.adaptive_timeout(3, floor, default), default);

        let loopback = unknown.clone().with_rtt(Duration::from_micros(40));
        assert_eq!(loopback.adaptive_timeout(3, floor, default), floor);

        let instant = unknown.with_rtt(Duration::ZERO);
        assert_eq!(instant.adaptive_timeout(3, floor, default), default);
    }

    #[test]
    fn wire_form_drops_local_knowledge() {
        let contact = Contact::new(id(3), addr(4000))
            .with_type(ContactType::Solicited)
            .with_rtt(Duration::from_millis(10))
            .with_instance_id(42);
        let json = serde_json::to_string(&contact).unwrap();
        let decoded: Contact = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.id(), contact.id());
        assert_eq!(decoded.instance_id(), 42);
        assert_eq!(decoded.address(), addr(4000));
        assert_eq!(decoded.contact_type(), ContactType::Unknown);
        assert_eq!(decoded.rtt(), None);
    }

    #[test]
    fn unspecified_address_uses_observed_ip() {
        let reported = SocketAddr::from(([0, 0, 0, 0], 4000));
        let contact = Contact::new(id(1), reported).with_remote_address(addr(5555));
        assert_eq!(contact.contact_address(), addr(4000));
    }
}
