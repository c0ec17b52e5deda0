//! Content-id construction used by `provide`/`find_providers`.
//!
//! SHA-256 over UTF-8 bytes -> self-describing multihash (code 0x12,
//! sha2-256) -> self-describing CIDv1 with the raw codec (0x55). The
//! textual form is the standard base32 (multibase `b...`) encoding `cid`
//! produces by default.

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};

const SHA2_256_CODE: u64 = 0x12;
const RAW_CODEC: u64 = 0x55;

#[derive(Debug, thiserror::Error)]
pub enum ContentIdError {
    #[error("invalid content id: {0}")]
    Invalid(String)
}

/// Derives the content-id for a human-readable handle such as `nickname#discriminator`.
pub fn cid_for(input: &str) -> Cid {
    let digest = Sha256::digest(input.as_bytes());
    let multihash = Multihash::wrap(SHA2_256_CODE, &digest).expect("sha2-256 digest fits");
    Cid::new_v1(RAW_CODEC, multihash)
}

/// Textual (base32) form of [`cid_for`].
pub fn cid_string_for(input: &str) -> String {
    cid_for(input).to_string()
}

/// Decodes the textual form produced by [`cid_string_for`] back into a [`Cid`].
pub fn parse_cid(text: &str) -> Result<Cid, ContentIdError> {
    text.parse().map_err(|e| ContentIdError::Invalid(format!("{text}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_produce_equal_cids() {
        assert_eq!(cid_for("alice#42"), cid_for("alice#42"));
    }

    #[test]
    fn distinct_inputs_produce_distinct_cids() {
        assert_ne!(cid_for("alice#42"), cid_for("bob#7"));
    }

    #[test]
    fn textual_round_trip() {
        let text = cid_string_for("alice#42");
        let parsed = parse_cid(&text).unwrap();
        assert_eq!(parsed, cid_for("alice#42"));
    }
}
