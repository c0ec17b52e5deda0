//! Serverless peer-to-peer messaging core: a long-lived cryptographic
//! identity, mDNS + Kademlia DHT discovery, NAT traversal, and a single
//! application protocol speaking single-shot, length-is-EOF messages.
//!
//! [`controller::CoreController`] is the one type an embedder constructs.

mod config;
mod content_id;
mod controller;
mod discovery;
mod error;
mod event_queue;
mod events;
mod host;
mod identity;
mod metrics;
mod peer_cache;
mod persist;
mod policy;
mod routing_snapshot;
mod serde_peer_id;
mod stream_handler;

pub use config::{NodeConfig, APPLICATION_PROTOCOL, DEFAULT_RENDEZVOUS, MDNS_SERVICE_TAG, PROTECT_TAG};
pub use content_id::{cid_for, cid_string_for, parse_cid, ContentIdError};
pub use controller::CoreController;
pub use error::{CoreError, CoreResult, StorageError};
pub use event_queue::EventQueueError;
pub use events::{
    ConnectionLimitsSnapshot, CoreEvent, NetworkStatusKind, PeerAddrInfo, RawMessage, ReconnectStats
};
pub use identity::{Identity, UserProfile};
pub use metrics::{MetricsSink, NoopMetricsSink};
pub use peer_cache::PeerCacheEntry;
pub use routing_snapshot::{RoutingSnapshotEntry, RoutingSnapshotStats};

pub use libp2p::{Multiaddr, PeerId};
pub use cid::Cid;
