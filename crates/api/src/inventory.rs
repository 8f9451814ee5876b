//! Inventory records gossiped between peers over the key-exchange
//! protocol.

use serde::{Deserialize, Serialize};

/// Advisory description of one locally held image, shared with peers so
/// they can prefetch layers without blind DHT walks. The wire format is
/// a UTF-8 JSON array of these objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayers {
    /// Full image reference, e.g. `docker.io/library/nginx:1.27`.
    pub image_name: String,
    /// Origin registry.
    pub registry: String,
    /// Image tag, empty for digest-only references.
    #[serde(default)]
    pub tag: String,
    /// The image manifest digest.
    pub digest: String,
    /// Every digest reachable from the manifest, manifest included.
    pub layer_keys: Vec<String>,
}

/// A peer that claims to hold a digest we are missing, with enough image
/// context to construct the blob request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySource {
    /// Address of the peer's front listener.
    pub peer: std::net::SocketAddr,
    /// Image the digest belongs to, e.g. `docker.io/library/nginx:1.27`.
    pub image_name: String,
    /// Origin registry, forwarded as the `ns` query parameter.
    pub registry: String,
}
