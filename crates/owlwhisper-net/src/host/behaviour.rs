use libp2p::{autonat, dcutr, identify, kad, mdns, relay, rendezvous, swarm::behaviour::toggle::Toggle, upnp};

use crate::config::NodeConfig;

/// The composed libp2p behaviour backing [`super::driver::HostDriver`].
///
/// Transports, NAT helpers, and discovery mechanisms are each independently
/// toggleable per spec.md 4.5/4.6; disabled behaviours are wrapped in
/// [`Toggle`] rather than `Option` so the swarm event enum stays stable
/// regardless of which `NodeConfig` flags are set.
#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct CoreBehaviour {
    pub identify:     identify::Behaviour,
    pub kad:          Toggle<kad::Behaviour<kad::store::MemoryStore>>,
    pub mdns:         Toggle<mdns::tokio::Behaviour>,
    pub rendezvous:   Toggle<rendezvous::client::Behaviour>,
    pub autonat:      Toggle<autonat::v2::client::Behaviour>,
    pub relay_client: Toggle<relay::client::Behaviour>,
    pub dcutr:        Toggle<dcutr::Behaviour>,
    pub upnp:         Toggle<upnp::tokio::Behaviour>,
    pub stream:       libp2p_stream::Behaviour
}

pub(crate) struct BehaviourParts {
    pub behaviour:    CoreBehaviour,
    pub relay_client: Option<relay::client::Transport>
}

/// Builds the behaviour set for `local_peer_id` according to `config`.
///
/// mDNS and the DHT are only wired in when their respective
/// `enable_{mdns,dht}` flags are set; the rendezvous client behaviour rides
/// along with the DHT since both are used for peer discovery only.
pub(crate) fn build(
    keypair: &libp2p::identity::Keypair,
    config: &NodeConfig
) -> Result<BehaviourParts, Box<dyn std::error::Error + Send + Sync>> {
    let local_peer_id = libp2p::PeerId::from(keypair.public());

    let identify = identify::Behaviour::new(identify::Config::new(
        crate::config::APPLICATION_PROTOCOL.to_string(),
        keypair.public()
    ));

    let kad = if config.enable_dht {
        let store = kad::store::MemoryStore::new(local_peer_id);
        let mut kad_config = kad::Config::default();
        kad_config.set_query_timeout(std::time::Duration::from_secs(30));
        Some(kad::Behaviour::with_config(local_peer_id, store, kad_config))
    } else {
        None
    };

    let mdns = if config.enable_mdns {
        Some(mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?)
    } else {
        None
    };

    let rendezvous =
        if config.enable_dht { Some(rendezvous::client::Behaviour::new(keypair.clone())) } else { None };

    // A forced reachability classification means the operator already knows
    // the answer AutoNAT would probe for, so skip the probing entirely.
    let autonat_effective =
        config.enable_autonat_v2 && !config.force_reachability_public && !config.force_reachability_private;
    let autonat = if autonat_effective {
        Some(autonat::v2::client::Behaviour::new(
            rand::thread_rng(),
            autonat::v2::client::Config::default()
        ))
    } else {
        None
    };

    let (relay_client, relay_transport) = if config.enable_relay {
        let (transport, behaviour) = relay::client::new(local_peer_id);
        (Some(behaviour), Some(transport))
    } else {
        (None, None)
    };

    let dcutr =
        if config.enable_hole_punching { Some(dcutr::Behaviour::new(local_peer_id)) } else { None };

    let upnp = if config.enable_nat_portmap { Some(upnp::tokio::Behaviour::default()) } else { None };

    let stream = libp2p_stream::Behaviour::new();

    Ok(BehaviourParts {
        behaviour: CoreBehaviour {
            identify,
            kad: kad.into(),
            mdns: mdns.into(),
            rendezvous: rendezvous.into(),
            autonat: autonat.into(),
            relay_client: relay_client.into(),
            dcutr: dcutr.into(),
            upnp: upnp.into(),
            stream
        },
        relay_client: relay_transport
    })
}
