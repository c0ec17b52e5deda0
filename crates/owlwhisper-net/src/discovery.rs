use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use futures::future::join_all;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CoreResult;
use crate::host::HostHandle;
use crate::routing_snapshot::{RoutingSnapshotEntry, RoutingSnapshotStore};

const FIND_PEER_TIMEOUT: Duration = Duration::from_secs(20);
const FIND_PROVIDERS_TIMEOUT: Duration = Duration::from_secs(20);
const PROVIDE_TIMEOUT: Duration = Duration::from_secs(20);
const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const BOOTSTRAP_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Drives DHT bootstrap/advertise/find and rendezvous advertise/find, tracks
/// N concurrent `provide()` republish loops, and checkpoints the routing
/// table on start/stop.
///
/// mDNS discovery and rendezvous-discovered peers are wired directly from
/// the Host driver straight into
/// [`crate::policy::ConnectionPolicy::on_discover`] as they arrive (no DHT
/// bookkeeping needed); this manager owns the periodic loops that trigger
/// those discoveries (`bootstrap()`, `rendezvous_register`,
/// `rendezvous_discover`) plus everything that does need bookkeeping
/// (`find_peer`/`find_providers`/`provide`).
pub struct DiscoveryManager {
    host:               HostHandle,
    snapshot:           Arc<RoutingSnapshotStore>,
    rendezvous_string:  String,
    republish_interval: Duration,
    announce_interval:  Duration,
    bootstrap_nodes:    Vec<Multiaddr>,
    republishing:       Mutex<HashMap<Cid, JoinHandle<()>>>
}

impl DiscoveryManager {
    pub fn new(
        host: HostHandle,
        snapshot: Arc<RoutingSnapshotStore>,
        rendezvous_string: String,
        republish_interval: Duration,
        announce_interval: Duration,
        bootstrap_nodes: Vec<Multiaddr>
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            snapshot,
            rendezvous_string,
            republish_interval,
            announce_interval,
            bootstrap_nodes,
            republishing: Mutex::new(HashMap::new())
        })
    }

    /// Seeds the DHT with `custom_bootstrap_nodes`, dialing every bootstrap
    /// entry in parallel under a per-dial timeout, loads the last routing
    /// snapshot (a set of addresses worth dialing to rejoin the DHT), and
    /// kicks off the periodic bootstrap/advertise/find loops.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let dial_targets: Vec<(PeerId, Multiaddr)> = self
            .bootstrap_nodes
            .iter()
            .filter_map(|address| {
                self.host.add_bootstrap_node(address.clone());
                let mut addr = address.clone();
                match addr.pop() {
                    Some(Protocol::P2p(peer_id)) => Some((peer_id, addr)),
                    _ => None
                }
            })
            .collect();

        join_all(dial_targets.into_iter().map(|(peer_id, addr)| {
            let host = self.host.clone();
            async move {
                if tokio::time::timeout(BOOTSTRAP_DIAL_TIMEOUT, host.connect(peer_id, vec![addr])).await.is_err() {
                    tracing::debug!(peer_id = %peer_id, "bootstrap dial timed out after 15s");
                }
            }
        }))
        .await;

        if let Ok(entries) = self.snapshot.load_snapshot() {
            for entry in entries {
                let host = self.host.clone();
                tokio::spawn(async move {
                    let _ = host.connect(entry.peer_id, entry.addresses).await;
                });
            }
        }

        self.host.bootstrap();
        self.host.rendezvous_register(self.rendezvous_string.clone());
        self.host.rendezvous_discover(self.rendezvous_string.clone());

        let this = self.clone();
        let bootstrap_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BOOTSTRAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = bootstrap_cancel.cancelled() => return,
                    _ = ticker.tick() => this.host.bootstrap()
                }
            }
        });

        let this = self.clone();
        let register_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.announce_interval);
            loop {
                tokio::select! {
                    _ = register_cancel.cancelled() => return,
                    _ = ticker.tick() => this.host.rendezvous_register(this.rendezvous_string.clone())
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.announce_interval * 2);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => this.host.rendezvous_discover(this.rendezvous_string.clone())
                }
            }
        });
    }

    /// Persists the current live-peer view as a routing snapshot; called on
    /// controller shutdown per spec.md scenario 5.
    pub fn checkpoint(&self, live_peers: Vec<(PeerId, Vec<Multiaddr>)>) -> CoreResult<()> {
        let entries = live_peers
            .into_iter()
            .map(|(peer_id, addresses)| RoutingSnapshotEntry { peer_id, addresses })
            .collect();
        self.snapshot.save_snapshot(&entries)?;
        Ok(())
    }

    pub async fn find_peer(&self, peer_id: PeerId) -> CoreResult<Vec<Multiaddr>> {
        self.host.find_peer(peer_id, FIND_PEER_TIMEOUT).await
    }

    pub async fn find_providers(&self, cid: Cid) -> CoreResult<Vec<PeerId>> {
        self.host.find_providers(cid, FIND_PROVIDERS_TIMEOUT).await
    }

    /// Announces `cid` once, then keeps re-announcing it on
    /// `republish_interval` until [`Self::stop_providing`] is called. Each
    /// `cid` gets its own republish task so concurrent `provide()` calls for
    /// distinct content never interfere (spec.md 9's open question).
    pub async fn provide(self: &Arc<Self>, cid: Cid) -> CoreResult<()> {
        self.host.provide(cid, PROVIDE_TIMEOUT).await?;

        let mut tasks = self.republishing.lock();
        if let Some(old) = tasks.insert(cid, self.spawn_republish(cid)) {
            old.abort();
        }
        Ok(())
    }

    pub fn stop_providing(&self, cid: Cid) {
        self.host.stop_providing(cid);
        if let Some(task) = self.republishing.lock().remove(&cid) {
            task.abort();
        }
    }

    fn spawn_republish(self: &Arc<Self>, cid: Cid) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.republish_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = this.host.provide(cid, PROVIDE_TIMEOUT).await {
                    tracing::warn!(%cid, error = %e, "provider republish failed");
                }
            }
        })
    }
}

impl Drop for DiscoveryManager {
    fn drop(&mut self) {
        for (_, task) in self.republishing.lock().drain() {
            task.abort();
        }
    }
}
