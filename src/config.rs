//! Parameter structs for the node and its coordinators.
//!
//! Every struct deserializes with defaults for missing fields so a host
//! application can embed them in its own configuration file. Durations are
//! stored as milliseconds and exposed through `Duration` accessors.

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::error::{DhtError, DhtResult};

/// Default bucket size and replication factor.
pub const DEFAULT_K: usize = 20;

/// Default lookup parallelism.
pub const DEFAULT_ALPHA: usize = 4;

/// Routing table parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Maximum active contacts per bucket.
    pub k: usize,
    /// Maximum replacement-cache entries per bucket.
    pub cache_size: usize,
    /// Buckets shallower than this may split even when they do not cover
    /// the local id.
    pub max_depth: usize,
    /// Failures after which a contact is evicted.
    pub max_errors: u32,
    /// A full bucket only pings its least-recently-seen contact if that
    /// contact has been silent for at least this long.
    pub probe_interval_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            cache_size: 16,
            max_depth: 4,
            max_errors: 5,
            probe_interval_ms: 30_000,
        }
    }
}

impl RoutingConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// Parameters of one FIND_NODE / FIND_VALUE lookup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Maximum requests in flight.
    pub alpha: usize,
    /// Width of the result set. `None` uses the routing table's `k`.
    pub k: Option<usize>,
    /// Upper bound for a single request.
    pub request_timeout_ms: u64,
    /// Upper bound for the whole lookup.
    pub timeout_ms: u64,
    /// Keep querying candidates even when they cannot improve the result.
    pub exhaustive: bool,
    /// Requests to contacts with a known RTT time out after
    /// `rtt * rtt_multiplier`, capped by `request_timeout_ms`.
    pub rtt_multiplier: u32,
    /// Lower bound of an RTT-derived request timeout.
    pub min_request_timeout_ms: u64,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            k: None,
            request_timeout_ms: 3_000,
            timeout_ms: 30_000,
            exhaustive: false,
            rtt_multiplier: 3,
            min_request_timeout_ms: 500,
        }
    }
}

impl LookupConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn min_request_timeout(&self) -> Duration {
        Duration::from_millis(self.min_request_timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Parameters of the STORE phase of a put.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Minimum acknowledgements for the store to count as successful.
    pub w: usize,
    pub request_timeout_ms: u64,
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            w: 1,
            request_timeout_ms: 3_000,
            timeout_ms: 30_000,
        }
    }
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Parameters of the periodic refresh and sync rounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Pause between maintenance rounds.
    pub interval_ms: u64,
    /// Buckets untouched for this long are refreshed with a lookup.
    pub bucket_timeout_ms: u64,
    /// Contacts silent for this long are pinged.
    pub contact_timeout_ms: u64,
    /// Fraction of the k closest contacts considered for pinging.
    pub ping_fraction: f32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            bucket_timeout_ms: 30 * 60 * 1_000,
            contact_timeout_ms: 10 * 60 * 1_000,
            ping_fraction: 0.25,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn bucket_timeout(&self) -> Duration {
        Duration::from_millis(self.bucket_timeout_ms)
    }

    pub fn contact_timeout(&self) -> Duration {
        Duration::from_millis(self.contact_timeout_ms)
    }
}

/// Complete node configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub routing: RoutingConfig,
    pub lookup: LookupConfig,
    pub store: StoreConfig,
    pub maintenance: MaintenanceConfig,
    /// Timeout of standalone pings (bootstrap, liveness probes, sync).
    pub ping_timeout_ms: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            lookup: LookupConfig::default(),
            store: StoreConfig::default(),
            maintenance: MaintenanceConfig::default(),
            ping_timeout_ms: 3_000,
        }
    }
}

impl DhtConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Reject parameter combinations no coordinator can run with.
    pub fn validate(&self) -> DhtResult<()> {
        if self.routing.k == 0 {
            return Err(DhtError::Validation("routing.k must be positive".into()));
        }
        if self.lookup.alpha == 0 {
            return Err(DhtError::Validation("lookup.alpha must be positive".into()));
        }
        if self.lookup.k == Some(0) {
            return Err(DhtError::Validation("lookup.k must be positive".into()));
        }
        if self.store.w == 0 {
            return Err(DhtError::Validation("store.w must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.maintenance.ping_fraction) {
            return Err(DhtError::Validation(format!(
                "maintenance.ping_fraction {} is outside [0, 1]",
                self.maintenance.ping_fraction
            )));
        }
        Ok(())
    }
}
