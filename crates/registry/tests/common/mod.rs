//! Shared fixtures for front-listener integration tests.
#![allow(dead_code)]

use clyde_api::*;
use clyde_registry::{Registry, RegistryConfig};
use clyde_router::MemoryRouter;
use clyde_store::MemStore;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct Harness {
    pub addr: SocketAddr,
    pub store: Arc<MemStore>,
    pub router: Arc<MemoryRouter>,
    pub client: reqwest::Client,
}

/// Run the front listener on an ephemeral port over a fresh in-memory
/// store and router.
pub async fn spawn_registry(config: RegistryConfig) -> Harness {
    let store = Arc::new(MemStore::new());
    let router = Arc::new(MemoryRouter::default());
    let registry = Registry::new(
        store.clone() as DynContentStore,
        router.clone() as DynRouter,
        config,
    )
    .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::task::spawn(axum::serve(listener, registry.app()).into_future());

    Harness {
        addr,
        store,
        router,
        client: reqwest::Client::new(),
    }
}

/// Spawn a bare HTTP server answering every request with a fixed body;
/// stands in for a peer or an upstream origin.
pub async fn spawn_fixed_server(body: &'static str) -> SocketAddr {
    let app = axum::Router::new().fallback(move || async move { body });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::task::spawn(axum::serve(listener, app).into_future());
    addr
}

/// Wait for a file to appear and carry the expected content; streamed
/// cache writes finish slightly after the response body does.
pub async fn await_file(path: &std::path::Path, expected: &str) {
    for _ in 0..100 {
        if let Ok(content) = tokio::fs::read_to_string(path).await {
            if content == expected {
                return;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("file {} never reached expected content", path.display());
}

/// Wait until the router has recorded an advertisement for the key.
pub async fn await_advertised(router: &MemoryRouter, key: &str) {
    for _ in 0..100 {
        if router.advertised().iter().any(|k| k == key) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("key {key} was never advertised");
}
