use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cid::Cid;
use futures::StreamExt;
use libp2p::kad::{self, QueryId};
use libp2p::multiaddr::Protocol;
use libp2p::rendezvous;
use libp2p::swarm::SwarmEvent;
use libp2p::{Multiaddr, PeerId, Swarm};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::behaviour::{CoreBehaviour, CoreBehaviourEvent};
use super::HostCommand;
use crate::error::CoreError;
use crate::event_queue::EventQueueHandle;
use crate::events::{CoreEvent, NetworkStatusKind, PeerAddrInfo};
use crate::policy::ConnectionPolicy;

enum PendingQuery {
    FindPeer { target: PeerId, reply: oneshot::Sender<Result<Vec<Multiaddr>, CoreError>> },
    Provide(oneshot::Sender<Result<(), CoreError>>),
    FindProviders { reply: oneshot::Sender<Result<Vec<PeerId>, CoreError>>, found: HashSet<PeerId> }
}

/// Owns the swarm. The only task in the whole crate allowed to touch
/// `Swarm<CoreBehaviour>`, matching the teacher's `NetworkManager`.
pub(crate) struct HostDriver {
    pub(crate) swarm:            Swarm<CoreBehaviour>,
    pub(crate) commands:         mpsc::UnboundedReceiver<HostCommand>,
    pub(crate) policy:           Arc<ConnectionPolicy>,
    pub(crate) events:           EventQueueHandle,
    pub(crate) cancel:           CancellationToken,
    pub(crate) listen_addresses: Arc<RwLock<Vec<Multiaddr>>>,
    pub(crate) connected_count:  Arc<AtomicUsize>,
    pub(crate) static_relays:    Vec<Multiaddr>,
    pub(crate) pending_connects: HashMap<PeerId, oneshot::Sender<Result<(), CoreError>>>,
    pub(crate) attempted_relay:  HashSet<PeerId>,
    pub(crate) pending_queries:  HashMap<QueryId, PendingQuery>,
    /// The peer registrations/discoveries are issued against. Set to the
    /// first bootstrap peer seen, since the rendezvous protocol needs a
    /// known server peer and bootstrap entries are the only peers a node
    /// knows about ahead of any connection.
    pub(crate) rendezvous_peer:  Option<PeerId>
}

impl HostDriver {
    pub(crate) async fn run(mut self) {
        self.events.push(CoreEvent::network_status(NetworkStatusKind::ConnectingToDht, "host started"));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.events.push(CoreEvent::network_status(NetworkStatusKind::ShuttingDown, "host shutting down"));
                    break;
                }
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break
                }
            }
        }
    }

    fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Connect { peer_id, addresses, reply } => self.dial(peer_id, addresses, reply),
            HostCommand::SetProtected { peer_id, protected } => {
                tracing::debug!(peer_id = %peer_id, protected, "peer protection state updated");
            }
            HostCommand::AddBootstrapNode { address } => self.add_bootstrap_node(address),
            HostCommand::Bootstrap => {
                if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                    if let Err(e) = kad.bootstrap() {
                        tracing::debug!(error = %e, "dht bootstrap skipped: routing table is empty");
                    }
                }
            }
            HostCommand::FindPeer { peer_id, reply } => {
                let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() else {
                    let _ = reply.send(Err(CoreError::NotFound));
                    return;
                };
                let query_id = kad.get_closest_peers(peer_id);
                self.pending_queries.insert(query_id, PendingQuery::FindPeer { target: peer_id, reply });
            }
            HostCommand::Provide { cid, reply } => {
                let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() else {
                    let _ = reply.send(Err(CoreError::NotFound));
                    return;
                };
                match kad.start_providing(kad::RecordKey::new(&cid.to_bytes())) {
                    Ok(query_id) => {
                        self.pending_queries.insert(query_id, PendingQuery::Provide(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(CoreError::InvalidInput(e.to_string())));
                    }
                }
            }
            HostCommand::StopProviding { cid } => {
                if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                    kad.stop_providing(&kad::RecordKey::new(&cid.to_bytes()));
                }
            }
            HostCommand::FindProviders { cid, reply } => {
                let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() else {
                    let _ = reply.send(Err(CoreError::NotFound));
                    return;
                };
                let query_id = kad.get_providers(kad::RecordKey::new(&cid.to_bytes()));
                self.pending_queries.insert(query_id, PendingQuery::FindProviders { reply, found: HashSet::new() });
            }
            HostCommand::RendezvousRegister { namespace } => self.rendezvous_register(namespace),
            HostCommand::RendezvousDiscover { namespace } => self.rendezvous_discover(namespace),
            HostCommand::Shutdown { reply } => {
                self.cancel.cancel();
                let _ = reply.send(());
            }
        }
    }

    /// Extracts the trailing `/p2p/<peer_id>` component (if any) and adds the
    /// stripped address to the Kademlia routing table. The actual dial (with
    /// its own timeout) is driven by the Discovery Manager, which also needs
    /// the parsed `peer_id`/address pair.
    fn add_bootstrap_node(&mut self, address: Multiaddr) {
        let mut addr = address.clone();
        let Some(Protocol::P2p(peer_id)) = addr.pop() else {
            tracing::warn!(%address, "bootstrap multiaddr has no trailing /p2p/<peer_id>, ignoring");
            return;
        };

        if self.rendezvous_peer.is_none() {
            self.rendezvous_peer = Some(peer_id);
        }

        if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
            kad.add_address(&peer_id, addr);
        }
    }

    fn parse_namespace(namespace: &str) -> Option<rendezvous::Namespace> {
        match rendezvous::Namespace::new(namespace.to_string()) {
            Ok(ns) => Some(ns),
            Err(e) => {
                tracing::warn!(namespace, error = %e, "invalid rendezvous namespace, skipping");
                None
            }
        }
    }

    /// Registers with the known rendezvous peer (the first configured
    /// bootstrap node; see `rendezvous_peer`). A no-op until one is known.
    fn rendezvous_register(&mut self, namespace: String) {
        let Some(rendezvous_node) = self.rendezvous_peer else {
            tracing::debug!(namespace, "no rendezvous point known yet, skipping register");
            return;
        };
        let Some(ns) = Self::parse_namespace(&namespace) else { return };
        if let Some(rendezvous) = self.swarm.behaviour_mut().rendezvous.as_mut() {
            let _ = rendezvous.register(ns, rendezvous_node, None);
        }
    }

    /// Asks the known rendezvous peer for every registration under
    /// `namespace`; results arrive asynchronously as
    /// `rendezvous::client::Event::Discovered` and are forwarded to
    /// `ConnectionPolicy::on_discover` from `handle_behaviour_event`.
    fn rendezvous_discover(&mut self, namespace: String) {
        let Some(rendezvous_node) = self.rendezvous_peer else {
            tracing::debug!(namespace, "no rendezvous point known yet, skipping discover");
            return;
        };
        let Some(ns) = Self::parse_namespace(&namespace) else { return };
        if let Some(rendezvous) = self.swarm.behaviour_mut().rendezvous.as_mut() {
            let _ = rendezvous.discover(Some(ns), None, None, rendezvous_node);
        }
    }

    fn dial(&mut self, peer_id: PeerId, addresses: Vec<Multiaddr>, reply: oneshot::Sender<Result<(), CoreError>>) {
        if self.swarm.is_connected(&peer_id) {
            let _ = reply.send(Ok(()));
            return;
        }

        let mut opts = libp2p::swarm::dial_opts::DialOpts::peer_id(peer_id);
        if !addresses.is_empty() {
            opts = opts.addresses(addresses);
        }
        match self.swarm.dial(opts.build()) {
            Ok(()) => {
                self.pending_connects.insert(peer_id, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(CoreError::DialFailed { peer_id, reason: e.to_string() }));
            }
        }
    }

    /// Returns `true` if a relayed dial was actually issued, so the caller
    /// knows whether to wait for another `OutgoingConnectionError` or reply
    /// now.
    fn dial_via_relay(&mut self, peer_id: PeerId) -> bool {
        if self.static_relays.is_empty() || !self.attempted_relay.insert(peer_id) {
            return false;
        }
        for relay_addr in self.static_relays.clone() {
            let mut addr = relay_addr;
            addr.push(Protocol::P2pCircuit);
            let opts = libp2p::swarm::dial_opts::DialOpts::peer_id(peer_id).addresses(vec![addr]).build();
            if let Err(e) = self.swarm.dial(opts) {
                tracing::debug!(peer_id = %peer_id, error = %e, "relayed dial attempt failed to start");
            }
        }
        true
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<CoreBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(%address, "listening");
                self.listen_addresses.write().push(address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                self.connected_count.fetch_add(1, Ordering::Relaxed);
                self.attempted_relay.remove(&peer_id);
                if let Some(reply) = self.pending_connects.remove(&peer_id) {
                    let _ = reply.send(Ok(()));
                }
                self.policy.on_connect(peer_id);
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                if num_established == 0 {
                    self.connected_count.fetch_sub(1, Ordering::Relaxed);
                    self.policy.on_disconnect(peer_id);
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
                if !self.attempted_relay.contains(&peer_id) && self.dial_via_relay(peer_id) {
                    return;
                }
                if let Some(reply) = self.pending_connects.remove(&peer_id) {
                    let _ = reply.send(Err(CoreError::DialFailed { peer_id, reason: error.to_string() }));
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: CoreBehaviourEvent) {
        match event {
            CoreBehaviourEvent::Mdns(libp2p::mdns::Event::Discovered(peers)) => {
                for (peer_id, addr) in peers {
                    self.policy.on_discover(PeerAddrInfo { peer_id, addresses: vec![addr] });
                }
            }
            CoreBehaviourEvent::Mdns(libp2p::mdns::Event::Expired(peers)) => {
                for (peer_id, _) in peers {
                    tracing::trace!(peer_id = %peer_id, "mdns record expired");
                }
            }
            CoreBehaviourEvent::Identify(libp2p::identify::Event::Received { peer_id, info, .. }) => {
                if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                    for addr in info.listen_addrs {
                        kad.add_address(&peer_id, addr);
                    }
                }
            }
            CoreBehaviourEvent::Kad(kad::Event::OutboundQueryProgressed { id, result, step, .. }) => {
                self.handle_kad_progress(id, result, step.last);
            }
            CoreBehaviourEvent::Rendezvous(rendezvous::client::Event::Discovered { registrations, .. }) => {
                let local_peer_id = *self.swarm.local_peer_id();
                for registration in registrations {
                    let peer_id = registration.record.peer_id();
                    if peer_id == local_peer_id {
                        continue;
                    }
                    let addresses = registration.record.addresses().to_vec();
                    self.policy.on_discover(PeerAddrInfo { peer_id, addresses });
                }
            }
            CoreBehaviourEvent::Rendezvous(_) => {}
            CoreBehaviourEvent::Autonat(_) | CoreBehaviourEvent::Dcutr(_) | CoreBehaviourEvent::Upnp(_) => {}
            _ => {}
        }
    }

    fn handle_kad_progress(&mut self, id: QueryId, result: kad::QueryResult, last: bool) {
        match result {
            kad::QueryResult::GetClosestPeers(result) => {
                if let Some(PendingQuery::FindPeer { target, reply }) = self.pending_queries.remove(&id) {
                    let outcome = match result {
                        Ok(ok) => {
                            let addrs: Vec<Multiaddr> = ok
                                .peers
                                .into_iter()
                                .filter(|info| info.peer_id == target)
                                .flat_map(|info| info.addrs)
                                .collect();
                            if addrs.is_empty() { Err(CoreError::NotFound) } else { Ok(addrs) }
                        }
                        Err(_) => Err(CoreError::NotFound)
                    };
                    let _ = reply.send(outcome);
                }
            }
            kad::QueryResult::StartProviding(result) => {
                if let Some(PendingQuery::Provide(reply)) = self.pending_queries.remove(&id) {
                    let outcome = result
                        .map(|_| ())
                        .map_err(|e| CoreError::InvalidInput(e.to_string()));
                    let _ = reply.send(outcome);
                }
            }
            kad::QueryResult::GetProviders(result) => {
                let Some(PendingQuery::FindProviders { found, .. }) = self.pending_queries.get_mut(&id) else {
                    return;
                };
                if let Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) = result {
                    found.extend(providers);
                }
                if last {
                    if let Some(PendingQuery::FindProviders { reply, mut found }) = self.pending_queries.remove(&id) {
                        found.remove(self.swarm.local_peer_id());
                        let outcome = if found.is_empty() { Err(CoreError::NotFound) } else { Ok(found.into_iter().collect()) };
                        let _ = reply.send(outcome);
                    }
                }
            }
            _ => {}
        }
    }
}
