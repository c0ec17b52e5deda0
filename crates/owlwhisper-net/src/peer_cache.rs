use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::persist::write_atomic;

const PEER_CACHE_FILE: &str = "peer.cache";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerCacheEntry {
    #[serde(with = "crate::serde_peer_id")]
    pub peer_id:   PeerId,
    pub addresses: Vec<Multiaddr>,
    pub last_seen: DateTime<Utc>,
    pub healthy:   bool
}

/// Append-through map of `peer_id -> PeerCacheEntry`, persisted as a single
/// JSON object. At most `capacity` entries; entries older than `ttl` are
/// pruned on every read and write.
pub struct PeerCache {
    path:     PathBuf,
    capacity: usize,
    ttl:      Duration,
    inner:    Mutex<()>
}

impl PeerCache {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize, ttl: Duration) -> Self {
        Self { path: dir.into().join(PEER_CACHE_FILE), capacity, ttl, inner: Mutex::new(()) }
    }

    pub fn save(
        &self,
        peer_id: PeerId,
        addresses: Vec<Multiaddr>,
        healthy: bool
    ) -> Result<(), StorageError> {
        let _guard = self.inner.lock();
        let mut map = self.read_raw()?;
        map.insert(peer_id, PeerCacheEntry { peer_id, addresses, last_seen: Utc::now(), healthy });
        self.prune_and_write(&mut map)
    }

    pub fn load(&self, peer_id: PeerId) -> Result<Option<PeerCacheEntry>, StorageError> {
        let _guard = self.inner.lock();
        let mut map = self.read_raw()?;
        let expired = map
            .get(&peer_id)
            .map(|entry| is_expired(entry, self.ttl))
            .unwrap_or(false);
        if expired {
            map.remove(&peer_id);
            self.write_raw(&map)?;
            return Ok(None);
        }
        Ok(map.get(&peer_id).cloned())
    }

    pub fn list_all(&self) -> Result<Vec<PeerCacheEntry>, StorageError> {
        let _guard = self.inner.lock();
        let mut map = self.read_raw()?;
        self.prune_and_write(&mut map)?;
        Ok(map.into_values().collect())
    }

    pub fn list_healthy(&self) -> Result<Vec<PeerCacheEntry>, StorageError> {
        Ok(self.list_all()?.into_iter().filter(|e| e.healthy).collect())
    }

    pub fn remove(&self, peer_id: PeerId) -> Result<(), StorageError> {
        let _guard = self.inner.lock();
        let mut map = self.read_raw()?;
        map.remove(&peer_id);
        self.write_raw(&map)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.inner.lock();
        self.write_raw(&HashMap::new())
    }

    fn read_raw(&self) -> Result<HashMap<PeerId, PeerCacheEntry>, StorageError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = std::fs::read(&self.path).map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source
        })?;
        if bytes.is_empty() {
            return Ok(HashMap::new());
        }
        let raw: HashMap<String, PeerCacheEntry> = serde_json::from_slice(&bytes)?;
        Ok(raw.into_values().map(|e| (e.peer_id, e)).collect())
    }

    fn write_raw(&self, map: &HashMap<PeerId, PeerCacheEntry>) -> Result<(), StorageError> {
        let raw: HashMap<String, &PeerCacheEntry> =
            map.iter().map(|(id, e)| (id.to_base58(), e)).collect();
        let bytes = serde_json::to_vec_pretty(&raw)?;
        write_atomic(&self.path, &bytes, 0o600)
    }

    /// Prunes expired entries, then evicts the oldest-`last_seen` entries
    /// until at most `capacity` remain, then rewrites the whole file.
    fn prune_and_write(
        &self,
        map: &mut HashMap<PeerId, PeerCacheEntry>
    ) -> Result<(), StorageError> {
        map.retain(|_, entry| !is_expired(entry, self.ttl));

        if map.len() > self.capacity {
            let mut by_age: Vec<_> = map.values().map(|e| (e.peer_id, e.last_seen)).collect();
            by_age.sort_by_key(|(_, last_seen)| *last_seen);
            let overflow = map.len() - self.capacity;
            for (peer_id, _) in by_age.into_iter().take(overflow) {
                map.remove(&peer_id);
            }
        }

        self.write_raw(map)
    }
}

fn is_expired(entry: &PeerCacheEntry, ttl: Duration) -> bool {
    Utc::now().signed_duration_since(entry.last_seen).to_std().unwrap_or_default() > ttl
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(dir: &tempfile::TempDir) -> PeerCache {
        PeerCache::new(dir.path(), 50, Duration::from_secs(24 * 60 * 60))
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir);
        let peer = PeerId::random();

        cache.save(peer, vec![], true).unwrap();
        let loaded = cache.load(peer).unwrap().unwrap();
        assert_eq!(loaded.peer_id, peer);
        assert!(loaded.healthy);
    }

    #[test]
    fn never_exceeds_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PeerCache::new(dir.path(), 3, Duration::from_secs(60));

        for _ in 0..5 {
            cache.save(PeerId::random(), vec![], false).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        assert_eq!(cache.list_all().unwrap().len(), 3);
    }

    #[test]
    fn ttl_prunes_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PeerCache::new(dir.path(), 50, Duration::from_millis(10));
        let peer = PeerId::random();
        cache.save(peer, vec![], true).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(cache.load(peer).unwrap().is_none());
        assert!(cache.list_all().unwrap().is_empty());
    }

    #[test]
    fn remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir);
        let peer = PeerId::random();
        cache.save(peer, vec![], true).unwrap();

        cache.remove(peer).unwrap();
        assert!(cache.load(peer).unwrap().is_none());

        cache.save(PeerId::random(), vec![], true).unwrap();
        cache.clear().unwrap();
        assert!(cache.list_all().unwrap().is_empty());
    }
}
