use bytes::Bytes;
use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};

/// Events emitted by the core that are of interest to any embedder.
///
/// `NewMessage` is never ordered with respect to `PeerConnected`/
/// `PeerDisconnected`; events for the same `peer_id` are totally ordered.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    NewMessage {
        sender:    PeerId,
        bytes:     Bytes,
        timestamp: DateTime<Utc>
    },
    PeerConnected {
        peer_id:   PeerId,
        timestamp: DateTime<Utc>
    },
    PeerDisconnected {
        peer_id:   PeerId,
        timestamp: DateTime<Utc>
    },
    NetworkStatus {
        status:    NetworkStatusKind,
        message:   String,
        timestamp: DateTime<Utc>
    }
}

impl CoreEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CoreEvent::NewMessage { timestamp, .. }
            | CoreEvent::PeerConnected { timestamp, .. }
            | CoreEvent::PeerDisconnected { timestamp, .. }
            | CoreEvent::NetworkStatus { timestamp, .. } => *timestamp
        }
    }

    pub(crate) fn new_message(sender: PeerId, bytes: Bytes) -> Self {
        CoreEvent::NewMessage { sender, bytes, timestamp: Utc::now() }
    }

    pub(crate) fn peer_connected(peer_id: PeerId) -> Self {
        CoreEvent::PeerConnected { peer_id, timestamp: Utc::now() }
    }

    pub(crate) fn peer_disconnected(peer_id: PeerId) -> Self {
        CoreEvent::PeerDisconnected { peer_id, timestamp: Utc::now() }
    }

    pub(crate) fn network_status(status: NetworkStatusKind, message: impl Into<String>) -> Self {
        CoreEvent::NetworkStatus { status, message: message.into(), timestamp: Utc::now() }
    }
}

/// The "etc." in spec.md's `NetworkStatus` event description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatusKind {
    ConnectingToDht,
    NetworkReady,
    Degraded,
    ShuttingDown
}

/// Produced exactly once per inbound application stream.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub sender: PeerId,
    pub bytes:  Bytes
}

/// Discovery-callback payload: a peer together with the addresses it was found at.
#[derive(Debug, Clone)]
pub struct PeerAddrInfo {
    pub peer_id:   PeerId,
    pub addresses: Vec<Multiaddr>
}

/// Snapshot of the three connection-budget counters and their ceilings.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimitsSnapshot {
    pub infrastructure:       usize,
    pub infrastructure_ceiling: usize,
    pub protected:            usize,
    pub protected_ceiling:    usize,
    pub total:                usize,
    pub total_ceiling:        usize
}

/// Returned by `reconnect_attempts(peer_id)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconnectStats {
    pub attempts:     u32,
    pub last_attempt: Option<DateTime<Utc>>
}
