use std::path::PathBuf;
use std::time::Duration;

use libp2p::Multiaddr;

/// Application protocol identifier registered on every [`crate::host::Host`].
pub const APPLICATION_PROTOCOL: &str = "/owl-whisper/1.0.0";
/// Connection-manager protect tag applied to [`crate::policy::ConnectionPolicy`] protected peers.
pub const PROTECT_TAG: &str = "owl-whisper-protected";
/// mDNS service tag used for local discovery unless overridden by `rendezvous_string`.
pub const MDNS_SERVICE_TAG: &str = "owl-whisper-mdns";
/// Default rendezvous string used for DHT advertise/find.
pub const DEFAULT_RENDEZVOUS: &str = "owl-whisper-global-rendezvous";

/// Configuration accepted by [`crate::controller::CoreController::new`].
///
/// Parsing this out of a file on disk is an embedder concern; the core only
/// ever sees the in-memory struct.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Overrides `IdentityStore::default_dir()`. `None` resolves to the
    /// platform config directory; set explicitly to run more than one node
    /// per machine (tests, multi-account embedders).
    pub data_dir: Option<PathBuf>,

    pub listen_addresses: Vec<Multiaddr>,

    pub enable_tcp: bool,
    pub enable_quic: bool,
    pub enable_websocket: bool,
    pub enable_webrtc: bool,

    pub enable_noise: bool,
    pub enable_tls: bool,

    pub enable_nat_portmap: bool,
    pub enable_hole_punching: bool,
    pub enable_autonat_v2: bool,

    pub enable_relay: bool,
    pub enable_auto_relay: bool,
    pub static_relays: Vec<Multiaddr>,
    pub use_bootstrap_as_relay: bool,
    pub auto_relay_boot_delay: Duration,
    pub auto_relay_max_candidates: usize,

    pub force_reachability_public: bool,
    pub force_reachability_private: bool,

    pub enable_mdns: bool,
    pub enable_dht: bool,
    pub rendezvous_string: String,
    pub announce_interval: Duration,
    pub custom_bootstrap_nodes: Vec<Multiaddr>,

    pub stream_creation_timeout: Duration,
    pub stream_read_timeout: Duration,
    pub stream_write_timeout: Duration,

    pub peer_cache_capacity: usize,
    pub peer_cache_ttl: Duration,

    pub connection_ceiling_infrastructure: usize,
    pub connection_ceiling_protected: usize,
    pub connection_ceiling_total: usize,

    pub reconnect_interval: Duration,
    pub reconnect_max_attempts: u32,
    pub enable_autoreconnect: bool,

    pub provide_republish_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,

            listen_addresses: default_listen_addresses(),

            enable_tcp: true,
            enable_quic: true,
            enable_websocket: true,
            enable_webrtc: true,

            enable_noise: true,
            enable_tls: true,

            enable_nat_portmap: true,
            enable_hole_punching: true,
            enable_autonat_v2: true,

            enable_relay: true,
            enable_auto_relay: true,
            static_relays: Vec::new(),
            use_bootstrap_as_relay: true,
            auto_relay_boot_delay: Duration::from_secs(2),
            auto_relay_max_candidates: 10,

            force_reachability_public: false,
            force_reachability_private: false,

            enable_mdns: true,
            enable_dht: true,
            rendezvous_string: DEFAULT_RENDEZVOUS.to_string(),
            announce_interval: Duration::from_secs(20),
            custom_bootstrap_nodes: Vec::new(),

            stream_creation_timeout: Duration::from_secs(60),
            stream_read_timeout: Duration::from_secs(30),
            stream_write_timeout: Duration::from_secs(10),

            peer_cache_capacity: 50,
            peer_cache_ttl: Duration::from_secs(24 * 60 * 60),

            connection_ceiling_infrastructure: 100,
            connection_ceiling_protected: 100,
            connection_ceiling_total: 200,

            reconnect_interval: Duration::from_secs(30),
            reconnect_max_attempts: 5,
            enable_autoreconnect: true,

            provide_republish_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// TCP, TCP+WS, QUIC, and WebRTC-direct, all on `0.0.0.0` with an ephemeral port.
fn default_listen_addresses() -> Vec<Multiaddr> {
    vec![
        "/ip4/0.0.0.0/tcp/0".parse().expect("valid multiaddr"),
        "/ip4/0.0.0.0/tcp/0/ws".parse().expect("valid multiaddr"),
        "/ip4/0.0.0.0/udp/0/quic-v1".parse().expect("valid multiaddr"),
        "/ip4/0.0.0.0/udp/0/webrtc-direct"
            .parse()
            .expect("valid multiaddr"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_ceilings() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.connection_ceiling_infrastructure, 100);
        assert_eq!(cfg.connection_ceiling_protected, 100);
        assert_eq!(cfg.connection_ceiling_total, 200);
        assert_eq!(cfg.peer_cache_capacity, 50);
        assert_eq!(cfg.reconnect_max_attempts, 5);
    }

    #[test]
    fn default_listen_addresses_cover_all_transports() {
        let addrs = default_listen_addresses();
        assert_eq!(addrs.len(), 4);
    }
}
