//! # kdht
//!
//! A Kademlia distributed hash table node. The routing table is a binary trie
//! of k-buckets over 160-bit identifiers, lookups are iterative with bounded
//! parallelism, and values are replicated to the `k` nodes closest to their
//! key with a configurable write threshold.
//!
//! The crate is split into modules that can be reused independently:
//!
//! - [`kuid`] and [`contact`]: identifiers with the XOR metric, and peer handles.
//! - [`routing`]: the k-bucket trie with splitting, replacement caches and
//!   closest-N selection.
//! - [`lookup`], [`store`], [`maintenance`]: the FIND_NODE/FIND_VALUE, STORE
//!   and refresh/sync coordinators.
//! - [`core`]: the [`DhtNode`] that ties them together behind the
//!   transport-agnostic [`DhtNetwork`] trait.
//! - [`protocol`], [`framing`], [`net`], [`server`]: a JSON-over-TCP transport.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::net::SocketAddr;
//!
//! use kdht::{derive_node_id, spawn_server, Contact, DhtConfig, DhtNode, TcpNetwork};
//! use tokio::net::TcpListener;
//!
//! # async fn launch(seed: SocketAddr) -> anyhow::Result<()> {
//! let listener = TcpListener::bind("0.0.0.0:4000").await?;
//! let localhost = Contact::localhost(derive_node_id(b"node key"), listener.local_addr()?);
//! let node = DhtNode::new(localhost.clone(), TcpNetwork::new(localhost), DhtConfig::default())?;
//!
//! let _server = spawn_server(&node, listener);
//! node.bootstrap(seed).await?;
//! let _maintenance = node.spawn_maintenance();
//!
//! let key = kdht::hash_content(b"hello");
//! node.put(key.clone(), &b"hello"[..]).await?;
//! assert!(node.get(&key).await?.is_some());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod contact;
pub mod core;
pub mod error;
pub mod framing;
pub mod kuid;
pub mod lookup;
pub mod maintenance;
pub mod net;
pub mod operation;
pub mod protocol;
pub mod routing;
pub mod server;
pub mod storage;
pub mod store;

pub use crate::config::{DhtConfig, LookupConfig, MaintenanceConfig, RoutingConfig, StoreConfig};
pub use crate::contact::{Contact, ContactType};
pub use crate::core::{
    derive_node_id, hash_content, verify_key_value_pair, BootstrapOutcome, DhtNetwork, DhtNode,
    TelemetrySnapshot,
};
pub use crate::error::{DhtError, DhtResult};
pub use crate::kuid::Kuid;
pub use crate::lookup::{FoundValue, LookupResult};
pub use crate::maintenance::{RefreshOutcome, SyncOutcome};
pub use crate::net::TcpNetwork;
pub use crate::operation::Operation;
pub use crate::routing::{AddOutcome, Bucket, RoutingTable, SharedRoutingTable};
pub use crate::server::{handle_connection, spawn_server};
pub use crate::storage::{MemoryStore, StoreStatus, ValueStore};
pub use crate::store::{PutOutcome, StoreOutcome, Value};
