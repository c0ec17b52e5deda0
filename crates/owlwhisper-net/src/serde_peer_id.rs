//! (De)serializes `libp2p::PeerId` as its base58 textual form, since the
//! `libp2p-identity` `serde` feature is not part of our dependency surface.

use libp2p::PeerId;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

pub fn serialize<S: Serializer>(peer_id: &PeerId, serializer: S) -> Result<S::Ok, S::Error> {
    peer_id.to_base58().serialize(serializer)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PeerId, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    encoded.parse().map_err(|e| D::Error::custom(format!("invalid peer id: {e}")))
}
