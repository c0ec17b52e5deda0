use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use libp2p::{identity::Keypair, PeerId};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::persist::write_atomic;

const IDENTITY_FILE: &str = "identity.key";
const PROFILE_FILE: &str = "profile.json";

/// `(private_key, public_key, peer_id)`. Loaded once at startup, never mutates.
#[derive(Clone)]
pub struct Identity {
    pub keypair: Keypair,
    pub peer_id: PeerId
}

impl Identity {
    fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = PeerId::from(keypair.public());
        Self { keypair, peer_id }
    }

    /// Decodes a base58-supplied private key before reconstructing the pair,
    /// per spec.md 4.1's closing paragraph.
    pub fn from_base58(encoded: &str) -> Result<Self, StorageError> {
        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| StorageError::Corrupt(format!("invalid base58 identity: {e}")))?;
        let keypair = Keypair::from_protobuf_encoding(&bytes)
            .map_err(|e| StorageError::Corrupt(format!("malformed identity key: {e}")))?;
        Ok(Self::from_keypair(keypair))
    }
}

/// `(nickname, display_name, created_at, updated_at)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub nickname:     String,
    pub display_name: String,
    pub created_at:   DateTime<Utc>,
    pub updated_at:   DateTime<Utc>
}

impl UserProfile {
    fn anonymous() -> Self {
        let now = Utc::now();
        Self {
            nickname: "Anonymous".to_string(),
            display_name: "Anonymous".to_string(),
            created_at: now,
            updated_at: now
        }
    }
}

/// Persists the node's private key and user profile on disk under the
/// platform application-config directory.
pub struct IdentityStore {
    dir: PathBuf
}

impl IdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolves `$HOME/.config/owlwhisper` (or the platform equivalent).
    pub fn default_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "owlwhisper")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".owlwhisper"))
    }

    fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE)
    }

    fn profile_path(&self) -> PathBuf {
        self.dir.join(PROFILE_FILE)
    }

    /// Loads the persisted identity, or generates and persists a new Ed25519
    /// key pair on first launch.
    pub fn load_or_create_identity(&self) -> Result<Identity, StorageError> {
        let path = self.identity_path();
        if path.exists() {
            let bytes = std::fs::read(&path).map_err(|source| StorageError::Io {
                path: path.clone(),
                source
            })?;
            let keypair = Keypair::from_protobuf_encoding(&bytes)
                .map_err(|e| StorageError::Corrupt(format!("malformed identity.key: {e}")))?;
            return Ok(Identity::from_keypair(keypair));
        }

        let keypair = Keypair::generate_ed25519();
        let bytes = keypair
            .to_protobuf_encoding()
            .map_err(|e| StorageError::Corrupt(format!("failed to encode new identity: {e}")))?;
        write_atomic(&path, &bytes, 0o600)?;
        tracing::info!(path = %path.display(), "generated new node identity");
        Ok(Identity::from_keypair(keypair))
    }

    pub fn load_profile(&self) -> Result<UserProfile, StorageError> {
        let path = self.profile_path();
        if !path.exists() {
            return Ok(UserProfile::anonymous());
        }
        read_json(&path)
    }

    pub fn save_profile(&self, mut profile: UserProfile) -> Result<(), StorageError> {
        profile.updated_at = Utc::now();
        if profile.created_at == DateTime::<Utc>::default() {
            profile.created_at = profile.updated_at;
        }
        let bytes = serde_json::to_vec_pretty(&profile)?;
        write_atomic(&self.profile_path(), &bytes, 0o600)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StorageError> {
    let bytes = std::fs::read(path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());

        let first = store.load_or_create_identity().unwrap();
        let second = store.load_or_create_identity().unwrap();
        assert_eq!(first.peer_id, second.peer_id);
    }

    #[test]
    fn profile_defaults_to_anonymous_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());

        let profile = store.load_profile().unwrap();
        assert_eq!(profile.nickname, "Anonymous");
        assert!(!dir.path().join(PROFILE_FILE).exists());
    }

    #[test]
    fn save_profile_sets_created_at_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());

        let mut profile = UserProfile::anonymous();
        profile.created_at = DateTime::<Utc>::default();
        store.save_profile(profile).unwrap();

        let saved = store.load_profile().unwrap();
        assert_ne!(saved.created_at, DateTime::<Utc>::default());
    }
}
