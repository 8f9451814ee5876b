#![deny(missing_docs)]
//! The clyde content router.
//!
//! [P2pRouter] maintains membership in a Kademlia DHT and provides
//! content discovery and announcement for the artifact handlers and the
//! state tracker. Content transfer never flows through the router; the
//! only peer-to-peer payload it carries is the small inventory blob
//! exchanged over the key-exchange side channel.

use std::time::Duration;

/// Provider records published into the DHT expire after this long.
/// The state tracker republishes more frequently than this, so live
/// content never drops out of the index.
pub const KEY_TTL: Duration = Duration::from_secs(2 * 60);

/// Protocol identifier of the inventory key-exchange side channel.
pub const KEY_EXCHANGE_PROTOCOL: &str = "/clyde/keys/1.0.0";

/// Kademlia protocol identifier; the `/spegel` prefix keeps clyde nodes
/// wire compatible with existing deployments.
pub const DHT_PROTOCOL: &str = "/spegel/kad/1.0.0";

mod content_id;
pub use content_id::*;

mod identity;
pub use identity::*;

pub mod bootstrap;
pub use bootstrap::{
    Bootstrapper, DnsBootstrapper, DynBootstrapper, HttpBootstrapper,
    PeerAddr, StaticBootstrapper,
};

mod p2p;
pub use p2p::*;

mod mem;
pub use mem::*;
