//! An in-memory [Router] for tests and single-node development.

use bytes::Bytes;
use clyde_api::*;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

/// In-memory [Router]: resolves from a static table, records
/// advertisements, and short-circuits the key exchange.
#[derive(Debug, Default)]
pub struct MemoryRouter {
    resolver: Mutex<HashMap<String, Vec<SocketAddr>>>,
    advertised: Mutex<Vec<String>>,
    resolved: Mutex<Vec<String>>,
    local_keys: Mutex<Bytes>,
    peer_keys: Mutex<HashMap<SocketAddr, Bytes>>,
    self_addr: Option<SocketAddr>,
}

impl MemoryRouter {
    /// Construct with a static resolve table. When `self_addr` is set,
    /// advertised keys become resolvable at that address, mimicking a
    /// single-node cluster.
    pub fn new(
        resolver: HashMap<String, Vec<SocketAddr>>,
        self_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            resolver: Mutex::new(resolver),
            self_addr,
            ..Default::default()
        }
    }

    /// Map a key to an additional peer address.
    pub fn add(&self, key: impl Into<String>, addr: SocketAddr) {
        self.resolver
            .lock()
            .unwrap()
            .entry(key.into())
            .or_default()
            .push(addr);
    }

    /// Keys advertised so far, in call order.
    pub fn advertised(&self) -> Vec<String> {
        self.advertised.lock().unwrap().clone()
    }

    /// Keys passed to [Router::resolve] so far, in call order.
    pub fn resolved(&self) -> Vec<String> {
        self.resolved.lock().unwrap().clone()
    }

    /// Install the inventory blob returned for a peer address.
    pub fn set_peer_keys(&self, peer: SocketAddr, data: impl Into<Bytes>) {
        self.peer_keys.lock().unwrap().insert(peer, data.into());
    }

    /// The blob most recently installed through [Router::serve_keys].
    pub fn local_keys(&self) -> Bytes {
        self.local_keys.lock().unwrap().clone()
    }
}

impl Router for MemoryRouter {
    fn ready(&self) -> BoxFut<'_, ClydeResult<bool>> {
        Box::pin(async { Ok(true) })
    }

    fn resolve(
        &self,
        key: &str,
        count: usize,
    ) -> BoxFut<'_, ClydeResult<tokio::sync::mpsc::Receiver<SocketAddr>>> {
        let key = key.to_string();
        Box::pin(async move {
            self.resolved.lock().unwrap().push(key.clone());
            let buffer = if count == 0 { 20 } else { count };
            let (tx, rx) = tokio::sync::mpsc::channel(buffer);
            let peers = self
                .resolver
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .unwrap_or_default();
            let limit = if count == 0 { usize::MAX } else { count };
            for peer in peers.into_iter().take(limit) {
                // Mirrors the p2p router: candidates beyond the buffer
                // are dropped, not waited for.
                let _ = tx.try_send(peer);
            }
            Ok(rx)
        })
    }

    fn advertise(&self, keys: Vec<String>) -> BoxFut<'_, ClydeResult<()>> {
        Box::pin(async move {
            let mut advertised = self.advertised.lock().unwrap();
            let mut resolver = self.resolver.lock().unwrap();
            for key in keys {
                if let Some(self_addr) = self.self_addr {
                    let entry = resolver.entry(key.clone()).or_default();
                    if !entry.contains(&self_addr) {
                        entry.push(self_addr);
                    }
                }
                advertised.push(key);
            }
            Ok(())
        })
    }

    fn serve_keys(&self, data: Bytes) -> BoxFut<'_, ClydeResult<()>> {
        Box::pin(async move {
            *self.local_keys.lock().unwrap() = data;
            Ok(())
        })
    }

    fn fetch_peer_keys(
        &self,
        peer: SocketAddr,
    ) -> BoxFut<'_, ClydeResult<Bytes>> {
        Box::pin(async move {
            self.peer_keys
                .lock()
                .unwrap()
                .get(&peer)
                .cloned()
                .ok_or_else(|| {
                    ClydeError::transport(format!(
                        "no inventory installed for peer {peer}"
                    ))
                })
        })
    }
}
