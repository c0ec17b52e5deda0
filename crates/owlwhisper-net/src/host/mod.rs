//! The Host component (spec.md 4.5): owns the libp2p swarm, transports, and
//! NAT/discovery behaviours, split handle/driver like the teacher's
//! `NetworkHandle`/`NetworkManager`.

mod behaviour;
mod driver;
mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use libp2p::swarm::SwarmBuilder;
use libp2p::{Multiaddr, PeerId, Swarm};
use libp2p_stream::Control;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{CoreError, CoreResult};
use crate::event_queue::EventQueueHandle;
use crate::identity::Identity;
use crate::policy::ConnectionPolicy;

use behaviour::CoreBehaviour;
use driver::HostDriver;

const DIAL_REPLY_TIMEOUT: Duration = Duration::from_secs(45);

pub(crate) enum HostCommand {
    Connect { peer_id: PeerId, addresses: Vec<Multiaddr>, reply: oneshot::Sender<CoreResult<()>> },
    SetProtected { peer_id: PeerId, protected: bool },
    AddBootstrapNode { address: Multiaddr },
    Bootstrap,
    FindPeer { peer_id: PeerId, reply: oneshot::Sender<CoreResult<Vec<Multiaddr>>> },
    Provide { cid: Cid, reply: oneshot::Sender<CoreResult<()>> },
    StopProviding { cid: Cid },
    FindProviders { cid: Cid, reply: oneshot::Sender<CoreResult<Vec<PeerId>>> },
    RendezvousRegister { namespace: String },
    RendezvousDiscover { namespace: String },
    Shutdown { reply: oneshot::Sender<()> }
}

struct HostHandleInner {
    local_peer_id:    PeerId,
    commands:         mpsc::UnboundedSender<HostCommand>,
    stream_control:   Control,
    listen_addresses: Arc<RwLock<Vec<Multiaddr>>>,
    connected_count:  Arc<AtomicUsize>
}

/// Cheap, `Clone`-able handle to a running [`HostDriver`]. This is the only
/// way anything outside `host/` touches the network.
#[derive(Clone)]
pub struct HostHandle {
    inner: Arc<HostHandleInner>
}

impl HostHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_peer_id
    }

    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.inner.listen_addresses.read().clone()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.inner.connected_count.load(Ordering::Relaxed)
    }

    /// Dials `peer_id`, trying `addresses` directly first; the driver falls
    /// back to a relayed dial through a known relay if every direct address
    /// fails and relaying is enabled.
    pub async fn connect(&self, peer_id: PeerId, addresses: Vec<Multiaddr>) -> CoreResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .commands
            .send(HostCommand::Connect { peer_id, addresses, reply: reply_tx })
            .map_err(|_| CoreError::NotRunning)?;

        tokio::time::timeout(DIAL_REPLY_TIMEOUT, reply_rx)
            .await
            .map_err(|_| CoreError::Timeout)?
            .map_err(|_| CoreError::NotRunning)?
    }

    /// Advisory only: informs the driver a peer is protected so future
    /// connection-limit enforcement can exempt it. See DESIGN.md.
    pub fn set_protected(&self, peer_id: PeerId, protected: bool) {
        let _ = self.inner.commands.send(HostCommand::SetProtected { peer_id, protected });
    }

    /// Clones the per-connection stream control so a caller can register its
    /// own accept loop (used by [`crate::stream_handler::StreamHandler`]).
    pub(crate) fn stream_control(&self) -> Control {
        self.inner.stream_control.clone()
    }

    pub async fn open_stream(&self, peer_id: PeerId, timeout: Duration) -> CoreResult<libp2p::Stream> {
        let mut control = self.inner.stream_control.clone();
        let protocol = libp2p::StreamProtocol::new(crate::config::APPLICATION_PROTOCOL);
        tokio::time::timeout(timeout, control.open_stream(peer_id, protocol))
            .await
            .map_err(|_| CoreError::Timeout)?
            .map_err(|e| CoreError::DialFailed { peer_id, reason: e.to_string() })
    }

    /// Retries `open_stream` with a linearly increasing backoff, per
    /// spec.md 4.5.
    pub async fn open_stream_with_retry(
        &self,
        peer_id: PeerId,
        attempt_timeout: Duration,
        max_attempts: u32
    ) -> CoreResult<libp2p::Stream> {
        let mut last_err = CoreError::Timeout;
        for attempt in 0..max_attempts {
            match self.open_stream(peer_id, attempt_timeout).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_err = e;
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt) + 1)).await;
                }
            }
        }
        Err(last_err)
    }

    /// Seeds the DHT routing table with a bootstrap multiaddr (expected to
    /// carry a trailing `/p2p/<peer_id>`) so a later `bootstrap()` has
    /// someone to query.
    pub fn add_bootstrap_node(&self, address: Multiaddr) {
        let _ = self.inner.commands.send(HostCommand::AddBootstrapNode { address });
    }

    pub fn bootstrap(&self) {
        let _ = self.inner.commands.send(HostCommand::Bootstrap);
    }

    pub async fn find_peer(&self, peer_id: PeerId, timeout: Duration) -> CoreResult<Vec<Multiaddr>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .commands
            .send(HostCommand::FindPeer { peer_id, reply: reply_tx })
            .map_err(|_| CoreError::NotRunning)?;
        tokio::time::timeout(timeout, reply_rx).await.map_err(|_| CoreError::Timeout)?.map_err(|_| CoreError::NotRunning)?
    }

    pub async fn provide(&self, cid: Cid, timeout: Duration) -> CoreResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .commands
            .send(HostCommand::Provide { cid, reply: reply_tx })
            .map_err(|_| CoreError::NotRunning)?;
        tokio::time::timeout(timeout, reply_rx).await.map_err(|_| CoreError::Timeout)?.map_err(|_| CoreError::NotRunning)?
    }

    pub fn stop_providing(&self, cid: Cid) {
        let _ = self.inner.commands.send(HostCommand::StopProviding { cid });
    }

    pub async fn find_providers(&self, cid: Cid, timeout: Duration) -> CoreResult<Vec<PeerId>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .commands
            .send(HostCommand::FindProviders { cid, reply: reply_tx })
            .map_err(|_| CoreError::NotRunning)?;
        tokio::time::timeout(timeout, reply_rx).await.map_err(|_| CoreError::Timeout)?.map_err(|_| CoreError::NotRunning)?
    }

    pub fn rendezvous_register(&self, namespace: String) {
        let _ = self.inner.commands.send(HostCommand::RendezvousRegister { namespace });
    }

    pub fn rendezvous_discover(&self, namespace: String) {
        let _ = self.inner.commands.send(HostCommand::RendezvousDiscover { namespace });
    }

    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.inner.commands.send(HostCommand::Shutdown { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
    }
}

/// A swarm that has been built and started listening, but whose driver loop
/// has not been spawned yet. Split out of [`Host::build`] because the
/// driver needs a [`ConnectionPolicy`], and [`ConnectionPolicy`] needs a
/// [`HostHandle`] — constructing both in one step would be circular.
pub(crate) struct PendingHost {
    swarm:            Swarm<CoreBehaviour>,
    commands_rx:      mpsc::UnboundedReceiver<HostCommand>,
    listen_addresses: Arc<RwLock<Vec<Multiaddr>>>,
    connected_count:  Arc<AtomicUsize>,
    static_relays:    Vec<Multiaddr>
}

impl PendingHost {
    pub(crate) fn spawn(
        self,
        policy: Arc<ConnectionPolicy>,
        events: EventQueueHandle,
        cancel: CancellationToken
    ) -> tokio::task::JoinHandle<()> {
        let driver = HostDriver {
            swarm: self.swarm,
            commands: self.commands_rx,
            policy,
            events,
            cancel,
            listen_addresses: self.listen_addresses,
            connected_count: self.connected_count,
            static_relays: self.static_relays,
            pending_connects: HashMap::new(),
            attempted_relay: Default::default(),
            pending_queries: HashMap::new(),
            rendezvous_peer: None
        };
        tokio::spawn(driver.run())
    }
}

pub struct Host;

impl Host {
    /// Builds the transport, behaviour, and swarm, starts listening on
    /// every configured address, and returns a ready-to-use [`HostHandle`]
    /// together with the [`PendingHost`] that must be `spawn`ed once a
    /// [`ConnectionPolicy`] exists.
    pub(crate) fn build(identity: &Identity, config: &NodeConfig) -> CoreResult<(HostHandle, PendingHost)> {
        let parts = behaviour::build(&identity.keypair, config)
            .map_err(|e| CoreError::InvalidInput(format!("failed to build behaviour set: {e}")))?;
        let transport = transport::build_transport(&identity.keypair, config, parts.relay_client)
            .map_err(|e| CoreError::InvalidInput(format!("failed to build transport: {e}")))?;

        let mut swarm = SwarmBuilder::with_existing_identity(identity.keypair.clone())
            .with_tokio()
            .with_other_transport(|_| Ok(transport))
            .map_err(|e| CoreError::InvalidInput(format!("failed to install transport: {e}")))?
            .with_behaviour(|_| parts.behaviour)
            .map_err(|e| CoreError::InvalidInput(format!("failed to install behaviour: {e}")))?
            .build();

        for addr in &config.listen_addresses {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| CoreError::InvalidInput(format!("cannot listen on {addr}: {e}")))?;
        }

        let stream_control = swarm.behaviour().stream.new_control();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let listen_addresses = Arc::new(RwLock::new(Vec::new()));
        let connected_count = Arc::new(AtomicUsize::new(0));

        let handle = HostHandle {
            inner: Arc::new(HostHandleInner {
                local_peer_id: identity.peer_id,
                commands: commands_tx,
                stream_control,
                listen_addresses: listen_addresses.clone(),
                connected_count: connected_count.clone()
            })
        };

        let pending = PendingHost {
            swarm,
            commands_rx,
            listen_addresses: listen_addresses.clone(),
            connected_count: connected_count.clone(),
            static_relays: config.static_relays.clone()
        };

        Ok((handle, pending))
    }
}
