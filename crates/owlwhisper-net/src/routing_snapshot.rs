use std::path::PathBuf;

use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::persist::write_atomic;

const ROUTING_SNAPSHOT_FILE: &str = "routing.snapshot";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSnapshotEntry {
    #[serde(with = "crate::serde_peer_id")]
    pub peer_id:   PeerId,
    pub addresses: Vec<Multiaddr>
}

#[derive(Debug, Clone, Copy)]
pub struct RoutingSnapshotStats {
    pub size:       usize,
    pub last_saved: Option<DateTime<Utc>>
}

/// Captures a subset of well-connected DHT peers before shutdown so the node
/// re-enters the overlay quickly on restart. Read once at startup, discarded
/// thereafter.
pub struct RoutingSnapshotStore {
    path:       PathBuf,
    last_saved: Mutex<Option<DateTime<Utc>>>
}

impl RoutingSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join(ROUTING_SNAPSHOT_FILE),
            last_saved: Mutex::new(None)
        }
    }

    pub fn save_snapshot(&self, entries: &[RoutingSnapshotEntry]) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        write_atomic(&self.path, &bytes, 0o600)?;
        *self.last_saved.lock() = Some(Utc::now());
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Vec<RoutingSnapshotEntry>, StorageError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&self.path).map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source
        })?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn stats(&self) -> RoutingSnapshotStats {
        let size = self
            .path
            .metadata()
            .map(|m| m.len() as usize)
            .unwrap_or(0);
        RoutingSnapshotStats { size, last_saved: *self.last_saved.lock() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RoutingSnapshotStore::new(dir.path());
        assert!(store.load_snapshot().unwrap().is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RoutingSnapshotStore::new(dir.path());
        let entries = vec![RoutingSnapshotEntry { peer_id: PeerId::random(), addresses: vec![] }];

        store.save_snapshot(&entries).unwrap();
        let loaded = store.load_snapshot().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].peer_id, entries[0].peer_id);
        assert!(store.stats().last_saved.is_some());
    }
}
