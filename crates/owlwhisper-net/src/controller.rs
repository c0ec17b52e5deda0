use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cid::Cid;
use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::discovery::DiscoveryManager;
use crate::error::{CoreError, CoreResult};
use crate::event_queue::{EventQueue, EventQueueError};
use crate::events::{ConnectionLimitsSnapshot, CoreEvent, NetworkStatusKind, RawMessage, ReconnectStats};
use crate::host::{Host, HostHandle};
use crate::identity::{IdentityStore, UserProfile};
use crate::metrics::{MetricsSink, NoopMetricsSink};
use crate::peer_cache::{PeerCache, PeerCacheEntry};
use crate::policy::ConnectionPolicy;
use crate::routing_snapshot::{RoutingSnapshotEntry, RoutingSnapshotStats};
use crate::stream_handler::StreamHandler;

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningCore {
    my_peer_id:     PeerId,
    host:           HostHandle,
    policy:         Arc<ConnectionPolicy>,
    discovery:      Arc<DiscoveryManager>,
    stream_handler: StreamHandler,
    messages:       Arc<tokio::sync::Mutex<mpsc::Receiver<RawMessage>>>,
    cancel:         CancellationToken,
    tasks:          Vec<tokio::task::JoinHandle<()>>
}

/// Single lifecycle object the embedder holds — owns the Host, Discovery
/// Manager, Connection Policy, Stream Handler, Event Queue, and the
/// persistence stores, per spec.md 4.9.
pub struct CoreController {
    config:         NodeConfig,
    identity_store: IdentityStore,
    peer_cache:     Arc<PeerCache>,
    snapshot_store: Arc<crate::routing_snapshot::RoutingSnapshotStore>,
    events:         EventQueue,
    metrics:        Arc<dyn MetricsSink>,
    running:        Mutex<Option<RunningCore>>
}

impl CoreController {
    pub fn new(config: NodeConfig) -> Self {
        Self::new_with_metrics(config, Arc::new(NoopMetricsSink))
    }

    /// Same as [`Self::new`], but with a custom metrics sink instead of the
    /// default no-op.
    pub fn new_with_metrics(config: NodeConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let dir = config.data_dir.clone().unwrap_or_else(IdentityStore::default_dir);
        Self {
            peer_cache: Arc::new(PeerCache::new(dir.clone(), config.peer_cache_capacity, config.peer_cache_ttl)),
            snapshot_store: Arc::new(crate::routing_snapshot::RoutingSnapshotStore::new(dir.clone())),
            identity_store: IdentityStore::new(dir),
            events: EventQueue::new(),
            metrics,
            config,
            running: Mutex::new(None)
        }
    }

    /// Builds the host, registers the protocol handler, starts discovery,
    /// and starts the reconnect loop. Errors with `InvalidInput` if already
    /// running (spec.md documents this as an idempotent error, not a panic).
    pub async fn start(&self) -> CoreResult<()> {
        if self.running.lock().is_some() {
            return Err(CoreError::InvalidInput("controller is already running".to_string()));
        }

        let identity = self.identity_store.load_or_create_identity()?;
        let (host, pending) = Host::build(&identity, &self.config)?;
        let events_handle = self.events.handle();

        let policy = ConnectionPolicy::new(
            self.config.clone(),
            host.clone(),
            events_handle.clone(),
            self.peer_cache.clone(),
            self.metrics.clone()
        );
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        tasks.push(pending.spawn(policy.clone(), events_handle.clone(), cancel.clone()));
        tasks.push(tokio::spawn(policy.clone().run_reconnect_loop(cancel.clone())));

        let discovery = DiscoveryManager::new(
            host.clone(),
            self.snapshot_store.clone(),
            self.config.rendezvous_string.clone(),
            self.config.provide_republish_interval,
            self.config.announce_interval,
            self.config.custom_bootstrap_nodes.clone()
        );
        discovery.start(cancel.clone()).await;

        let parts = StreamHandler::new(host.clone(), events_handle.clone(), self.metrics.clone());
        tasks.push(parts.handler.spawn_accept_loop(self.config.stream_read_timeout, cancel.clone()));

        events_handle.push(CoreEvent::network_status(NetworkStatusKind::NetworkReady, "controller started"));

        *self.running.lock() = Some(RunningCore {
            my_peer_id: identity.peer_id,
            host,
            policy,
            discovery,
            stream_handler: parts.handler,
            messages: Arc::new(tokio::sync::Mutex::new(parts.messages)),
            cancel,
            tasks
        });
        Ok(())
    }

    /// Saves a routing snapshot, cancels every background task (bounded to
    /// `SHUTDOWN_JOIN_TIMEOUT`), and stops the event queue.
    pub async fn stop(&self) -> CoreResult<()> {
        let running = self.running.lock().take().ok_or(CoreError::NotRunning)?;

        let live_peers = self.live_peers_with_addresses(running.policy.connected_peers());
        if let Err(e) = running.discovery.checkpoint(live_peers) {
            tracing::warn!(error = %e, "failed to persist routing snapshot on shutdown");
        }

        running.cancel.cancel();
        running.host.shutdown().await;
        for task in running.tasks {
            let _ = tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, task).await;
        }

        self.events.stop();
        Ok(())
    }

    fn live_peers_with_addresses(&self, peers: Vec<PeerId>) -> Vec<(PeerId, Vec<libp2p::Multiaddr>)> {
        peers
            .into_iter()
            .map(|peer_id| {
                let addresses = self.peer_cache.load(peer_id).ok().flatten().map(|e| e.addresses).unwrap_or_default();
                (peer_id, addresses)
            })
            .collect()
    }

    fn handles(&self) -> CoreResult<(HostHandle, Arc<ConnectionPolicy>, Arc<DiscoveryManager>, StreamHandler, PeerId)> {
        let guard = self.running.lock();
        let running = guard.as_ref().ok_or(CoreError::NotRunning)?;
        Ok((
            running.host.clone(),
            running.policy.clone(),
            running.discovery.clone(),
            running.stream_handler.clone(),
            running.my_peer_id
        ))
    }

    pub async fn send(&self, peer_id: PeerId, bytes: Bytes) -> CoreResult<()> {
        let (_, policy, _, stream_handler, _) = self.handles()?;
        if !policy.connected_peers().contains(&peer_id) {
            return Err(CoreError::NotConnected(peer_id));
        }
        stream_handler
            .send(peer_id, bytes, self.config.stream_creation_timeout, self.config.stream_write_timeout)
            .await
    }

    pub async fn broadcast(&self, bytes: Bytes) -> CoreResult<()> {
        let (_, policy, _, stream_handler, _) = self.handles()?;
        stream_handler
            .broadcast(
                policy.connected_peers(),
                bytes,
                self.config.stream_creation_timeout,
                self.config.stream_write_timeout
            )
            .await
    }

    pub fn connected_peers(&self) -> CoreResult<Vec<PeerId>> {
        let (_, policy, ..) = self.handles()?;
        Ok(policy.connected_peers())
    }

    /// Consumer handle for inbound application payloads; waits for the next
    /// message with no internal timeout (mirrors an owned `Receiver`).
    pub async fn recv_message(&self) -> CoreResult<RawMessage> {
        let messages = {
            let guard = self.running.lock();
            let running = guard.as_ref().ok_or(CoreError::NotRunning)?;
            running.messages.clone()
        };
        let mut rx = messages.lock().await;
        rx.recv().await.ok_or(CoreError::NotRunning)
    }

    pub async fn next_event(&self, timeout: Duration) -> CoreResult<CoreEvent> {
        if self.running.lock().is_none() {
            return Err(CoreError::NotRunning);
        }
        self.events.next(timeout).await.map_err(|e| match e {
            EventQueueError::Timeout => CoreError::Timeout,
            EventQueueError::Stopped => CoreError::NotRunning
        })
    }

    pub fn my_peer_id(&self) -> CoreResult<PeerId> {
        let (.., peer_id) = self.handles()?;
        Ok(peer_id)
    }

    pub fn listen_addresses(&self) -> CoreResult<Vec<libp2p::Multiaddr>> {
        let (host, ..) = self.handles()?;
        Ok(host.listen_addresses())
    }

    pub async fn find_peer(&self, peer_id: PeerId) -> CoreResult<Vec<libp2p::Multiaddr>> {
        let (_, _, discovery, ..) = self.handles()?;
        discovery.find_peer(peer_id).await
    }

    pub async fn find_providers(&self, cid: Cid) -> CoreResult<Vec<PeerId>> {
        let (_, _, discovery, ..) = self.handles()?;
        discovery.find_providers(cid).await
    }

    /// Starts (or keeps alive) the 5-minute periodic republish loop for `cid`.
    pub async fn provide(&self, cid: Cid) -> CoreResult<()> {
        let (_, _, discovery, ..) = self.handles()?;
        discovery.provide(cid).await
    }

    pub fn protect(&self, peer_id: PeerId) -> CoreResult<()> {
        let (_, policy, ..) = self.handles()?;
        policy.protect(peer_id);
        Ok(())
    }

    pub fn unprotect(&self, peer_id: PeerId) -> CoreResult<()> {
        let (_, policy, ..) = self.handles()?;
        policy.unprotect(peer_id);
        Ok(())
    }

    pub fn is_protected(&self, peer_id: PeerId) -> CoreResult<bool> {
        let (_, policy, ..) = self.handles()?;
        Ok(policy.is_protected(peer_id))
    }

    pub fn protected_peers(&self) -> CoreResult<Vec<PeerId>> {
        let (_, policy, ..) = self.handles()?;
        Ok(policy.protected_peers())
    }

    pub fn connection_limits(&self) -> CoreResult<ConnectionLimitsSnapshot> {
        let (_, policy, ..) = self.handles()?;
        Ok(policy.connection_limits())
    }

    pub fn enable_autoreconnect(&self) -> CoreResult<()> {
        let (_, policy, ..) = self.handles()?;
        policy.enable_autoreconnect();
        Ok(())
    }

    pub fn disable_autoreconnect(&self) -> CoreResult<()> {
        let (_, policy, ..) = self.handles()?;
        policy.disable_autoreconnect();
        Ok(())
    }

    pub fn reconnect_attempts(&self, peer_id: PeerId) -> CoreResult<ReconnectStats> {
        let (_, policy, ..) = self.handles()?;
        Ok(policy.reconnect_attempts(peer_id))
    }

    pub fn save_peer_to_cache(&self, peer_id: PeerId, addresses: Vec<libp2p::Multiaddr>, healthy: bool) -> CoreResult<()> {
        self.handles()?;
        Ok(self.peer_cache.save(peer_id, addresses, healthy)?)
    }

    pub fn load_peer_from_cache(&self, peer_id: PeerId) -> CoreResult<Option<PeerCacheEntry>> {
        self.handles()?;
        Ok(self.peer_cache.load(peer_id)?)
    }

    pub fn remove_peer_from_cache(&self, peer_id: PeerId) -> CoreResult<()> {
        self.handles()?;
        Ok(self.peer_cache.remove(peer_id)?)
    }

    pub fn load_profile(&self) -> CoreResult<UserProfile> {
        Ok(self.identity_store.load_profile()?)
    }

    pub fn save_profile(&self, profile: UserProfile) -> CoreResult<()> {
        Ok(self.identity_store.save_profile(profile)?)
    }

    /// On-demand checkpoint of the current live-peer view; `stop()` also
    /// does this automatically, so most embedders never need to call it.
    pub fn save_routing_snapshot(&self) -> CoreResult<()> {
        let (_, policy, discovery, ..) = self.handles()?;
        let live_peers = self.live_peers_with_addresses(policy.connected_peers());
        discovery.checkpoint(live_peers)
    }

    pub fn load_routing_snapshot(&self) -> CoreResult<Vec<RoutingSnapshotEntry>> {
        self.handles()?;
        Ok(self.snapshot_store.load_snapshot()?)
    }

    pub fn routing_stats(&self) -> CoreResult<RoutingSnapshotStats> {
        self.handles()?;
        Ok(self.snapshot_store.stats())
    }

    /// Approximated as the live-set size; the DHT's internal bucket count is
    /// not otherwise exposed by `libp2p::kad`.
    pub fn dht_size(&self) -> CoreResult<usize> {
        let (_, policy, ..) = self.handles()?;
        Ok(policy.connected_peers().len())
    }
}
