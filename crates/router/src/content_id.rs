//! Content key to content identifier mapping.

use cid::Cid;
use multihash::Multihash;
use sha2::Digest as _;

const RAW_CODEC: u64 = 0x55;
const SHA2_256: u64 = 0x12;

/// Compute the content identifier for a routable key: CIDv1, raw codec,
/// SHA2-256 multihash over the key bytes. Every node computes this
/// identically; it is the only point at which keys are hashed.
pub fn content_id(key: &str) -> Cid {
    let digest = sha2::Sha256::digest(key.as_bytes());
    let hash = Multihash::<64>::wrap(SHA2_256, &digest)
        .expect("sha256 digest always fits a 64 byte multihash");
    Cid::new_v1(RAW_CODEC, hash)
}

/// The DHT provider key for a content key: the multihash bytes of the
/// content identifier, matching how go-libp2p keys provider records.
pub fn provider_key(key: &str) -> Vec<u8> {
    content_id(key).hash().to_bytes()
}
