//! The content routing trait implemented by the p2p router.

use crate::{BoxFut, ClydeResult};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

/// Router implements the discovery of content.
///
/// Handlers depend on this trait; the router knows nothing about
/// handlers. The memory implementation in `clyde_router` substitutes the
/// DHT in tests.
pub trait Router: 'static + Send + Sync + std::fmt::Debug {
    /// Returns true when the router is ready to serve lookups: at least
    /// one non-self bootstrap peer is reachable, or the routing table is
    /// already populated.
    fn ready(&self) -> BoxFut<'_, ClydeResult<bool>>;

    /// Asynchronously discover addresses that can serve the content
    /// named by `key`. Yields up to `count` peer addresses; `count == 0`
    /// means no limit. The channel closes when the lookup completes, so
    /// callers bound the wait with their own timeout.
    fn resolve(
        &self,
        key: &str,
        count: usize,
    ) -> BoxFut<'_, ClydeResult<tokio::sync::mpsc::Receiver<SocketAddr>>>;

    /// Broadcast that this node can serve the content named by each key.
    /// Keys are published sequentially; the first failure aborts the
    /// remainder (the tracker cycle provides the retry).
    fn advertise(&self, keys: Vec<String>) -> BoxFut<'_, ClydeResult<()>>;

    /// Install the inventory blob served to peers over the key-exchange
    /// protocol. Overwrites any previously installed blob.
    fn serve_keys(&self, data: Bytes) -> BoxFut<'_, ClydeResult<()>>;

    /// Fetch the inventory blob from a peer previously discovered via
    /// `resolve(PEER_INDEX_KEY, ..)`.
    fn fetch_peer_keys(
        &self,
        peer: SocketAddr,
    ) -> BoxFut<'_, ClydeResult<Bytes>>;
}

/// Trait-object [Router].
pub type DynRouter = Arc<dyn Router>;
