use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libp2p::PeerId;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::event_queue::EventQueueHandle;
use crate::events::{CoreEvent, ConnectionLimitsSnapshot, PeerAddrInfo, ReconnectStats};
use crate::host::HostHandle;
use crate::metrics::MetricsSink;
use crate::peer_cache::PeerCache;

#[derive(Default)]
struct ConnectionBudget {
    infrastructure: AtomicUsize,
    protected:      AtomicUsize,
    total:          AtomicUsize
}

struct ReconnectState {
    attempts:     u32,
    last_attempt: Option<DateTime<Utc>>
}

/// Tracks infrastructure vs. protected connections against the ceilings in
/// `NodeConfig`, and drives the reconnect loop for protected peers.
///
/// State transitions (`Unknown -> Live -> Dropped`, orthogonal
/// `Protected`/`Unprotected`) are driven only by Host notifications,
/// Discovery callbacks, and explicit `protect`/`unprotect` calls.
pub struct ConnectionPolicy {
    config:         NodeConfig,
    host:           HostHandle,
    events:         EventQueueHandle,
    peer_cache:     Arc<PeerCache>,
    metrics:        Arc<dyn MetricsSink>,
    live:           RwLock<HashSet<PeerId>>,
    protected:      RwLock<HashSet<PeerId>>,
    reconnect:      RwLock<HashMap<PeerId, ReconnectState>>,
    budget:         ConnectionBudget,
    autoreconnect:  std::sync::atomic::AtomicBool
}

impl ConnectionPolicy {
    pub fn new(
        config: NodeConfig,
        host: HostHandle,
        events: EventQueueHandle,
        peer_cache: Arc<PeerCache>,
        metrics: Arc<dyn MetricsSink>
    ) -> Arc<Self> {
        let autoreconnect = config.enable_autoreconnect;
        Arc::new(Self {
            config,
            host,
            events,
            peer_cache,
            metrics,
            live: RwLock::new(HashSet::new()),
            protected: RwLock::new(HashSet::new()),
            reconnect: RwLock::new(HashMap::new()),
            budget: ConnectionBudget::default(),
            autoreconnect: std::sync::atomic::AtomicBool::new(autoreconnect)
        })
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.live.read().iter().copied().collect()
    }

    pub fn protected_peers(&self) -> Vec<PeerId> {
        self.protected.read().iter().copied().collect()
    }

    pub fn is_protected(&self, peer_id: PeerId) -> bool {
        self.protected.read().contains(&peer_id)
    }

    pub fn connection_limits(&self) -> ConnectionLimitsSnapshot {
        ConnectionLimitsSnapshot {
            infrastructure:            self.budget.infrastructure.load(Ordering::Relaxed),
            infrastructure_ceiling:    self.config.connection_ceiling_infrastructure,
            protected:                 self.budget.protected.load(Ordering::Relaxed),
            protected_ceiling:         self.config.connection_ceiling_protected,
            total:                     self.budget.total.load(Ordering::Relaxed),
            total_ceiling:             self.config.connection_ceiling_total
        }
    }

    pub fn reconnect_attempts(&self, peer_id: PeerId) -> ReconnectStats {
        self.reconnect
            .read()
            .get(&peer_id)
            .map(|s| ReconnectStats { attempts: s.attempts, last_attempt: s.last_attempt })
            .unwrap_or_default()
    }

    pub fn enable_autoreconnect(&self) {
        self.autoreconnect.store(true, Ordering::Relaxed);
    }

    pub fn disable_autoreconnect(&self) {
        self.autoreconnect.store(false, Ordering::Relaxed);
    }

    /// Discovery callback: a new peer was found and is not yet Live.
    pub fn on_discover(&self, info: PeerAddrInfo) {
        if self.live.read().contains(&info.peer_id) {
            return;
        }
        if self.budget.infrastructure.load(Ordering::Relaxed) >= self.config.connection_ceiling_infrastructure {
            return;
        }
        if self.budget.total.load(Ordering::Relaxed) >= self.config.connection_ceiling_total {
            return;
        }

        self.mark_live(info.peer_id, info.addresses.clone());

        let host = self.host.clone();
        let peer_id = info.peer_id;
        let addresses = info.addresses;
        tokio::spawn(async move {
            if let Err(e) = host.connect(peer_id, addresses).await {
                tracing::debug!(peer_id = %peer_id, error = %e, "background dial from discovery failed");
            }
        });
    }

    fn mark_live(&self, peer_id: PeerId, addresses: Vec<libp2p::Multiaddr>) {
        self.budget.infrastructure.fetch_add(1, Ordering::Relaxed);
        self.budget.total.fetch_add(1, Ordering::Relaxed);
        self.live.write().insert(peer_id);

        if let Err(e) = self.peer_cache.save(peer_id, addresses, false) {
            tracing::warn!(peer_id = %peer_id, error = %e, "failed to save peer to cache");
        }
    }

    /// Host notification: a connection (inbound or outbound) was established.
    /// The transport connection already exists, so this registers the peer
    /// as live unconditionally — ceilings gate new dials, not connections
    /// libp2p already accepted or that finished dialing.
    pub fn on_connect(&self, peer_id: PeerId) {
        if !self.live.read().contains(&peer_id) {
            let addresses = self.peer_cache.load(peer_id).ok().flatten().map(|e| e.addresses).unwrap_or_default();
            self.mark_live(peer_id, addresses);
        }

        if let Some(state) = self.reconnect.write().get_mut(&peer_id) {
            state.attempts = 0;
        }

        self.metrics.peer_connected(peer_id);
        self.events.push(CoreEvent::peer_connected(peer_id));
    }

    /// Host notification: a connection was closed.
    pub fn on_disconnect(&self, peer_id: PeerId) {
        if self.live.write().remove(&peer_id) {
            self.budget.infrastructure.fetch_sub(1, Ordering::Relaxed);
            self.budget.total.fetch_sub(1, Ordering::Relaxed);
            self.metrics.peer_disconnected(peer_id);
        }
        self.events.push(CoreEvent::peer_disconnected(peer_id));
    }

    pub fn protect(&self, peer_id: PeerId) {
        if self.protected.write().insert(peer_id) {
            self.budget.protected.fetch_add(1, Ordering::Relaxed);
        }
        self.host.set_protected(peer_id, true);
        let addresses = self.peer_cache.load(peer_id).ok().flatten().map(|e| e.addresses).unwrap_or_default();
        if let Err(e) = self.peer_cache.save(peer_id, addresses, true) {
            tracing::warn!(peer_id = %peer_id, error = %e, "failed to mark peer healthy in cache");
        }
    }

    pub fn unprotect(&self, peer_id: PeerId) {
        if self.protected.write().remove(&peer_id) {
            self.budget.protected.fetch_sub(1, Ordering::Relaxed);
        }
        self.host.set_protected(peer_id, false);
    }

    /// One background task, interval `config.reconnect_interval`, that
    /// re-dials any protected peer that has dropped off the live set.
    pub async fn run_reconnect_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reconnect_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !self.autoreconnect.load(Ordering::Relaxed) {
                continue;
            }

            let candidates: Vec<PeerId> = self
                .protected
                .read()
                .iter()
                .filter(|p| !self.live.read().contains(*p))
                .copied()
                .collect();

            for peer_id in candidates {
                let attempts = {
                    let mut map = self.reconnect.write();
                    let state = map.entry(peer_id).or_insert(ReconnectState { attempts: 0, last_attempt: None });
                    state.attempts += 1;
                    state.last_attempt = Some(Utc::now());
                    state.attempts
                };

                if attempts > self.config.reconnect_max_attempts {
                    tracing::warn!(peer_id = %peer_id, attempts, "giving up reconnect attempts for protected peer");
                    continue;
                }

                let addresses =
                    self.peer_cache.load(peer_id).ok().flatten().map(|e| e.addresses).unwrap_or_default();
                let host = self.host.clone();
                tokio::spawn(async move {
                    if let Err(e) = host.connect(peer_id, addresses).await {
                        tracing::debug!(peer_id = %peer_id, error = %e, "reconnect attempt failed");
                    }
                });
            }
        }
    }
}
