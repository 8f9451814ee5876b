//! Model plane end-to-end behavior against fake peers and upstreams.

mod common;

use clyde_registry::{HfConfig, RegistryConfig};
use common::*;
use std::path::Path;

fn hf_config(cache_dir: &Path, base_url: impl Into<String>) -> RegistryConfig {
    let mut hf = HfConfig::new(cache_dir);
    hf.base_url = base_url.into();
    hf.resolve_timeout = std::time::Duration::from_secs(3);
    hf.resolve_retries = 1;
    RegistryConfig {
        hf: Some(hf),
        ..Default::default()
    }
}

async fn seed_ref(cache_dir: &Path, sha: &str) -> std::path::PathBuf {
    let model_dir = cache_dir.join("models--org--model");
    tokio::fs::create_dir_all(model_dir.join("refs"))
        .await
        .unwrap();
    tokio::fs::write(model_dir.join("refs/main"), sha)
        .await
        .unwrap();
    let snapshot_dir = model_dir.join("snapshots").join(sha);
    tokio::fs::create_dir_all(&snapshot_dir).await.unwrap();
    snapshot_dir
}

#[tokio::test]
async fn local_snapshot_hit_serves_file_without_router() {
    let tmp = tempfile::tempdir().unwrap();
    let snapshot_dir = seed_ref(tmp.path(), "abc123").await;
    tokio::fs::write(snapshot_dir.join("LICENSE"), "hello-license")
        .await
        .unwrap();

    let h = spawn_registry(hf_config(tmp.path(), "http://invalid-upstream"))
        .await;
    let resp = h
        .client
        .get(format!(
            "http://{}/huggingface/org/model/resolve/main/LICENSE",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    assert_eq!("hello-license", resp.text().await.unwrap());
    assert!(h.router.resolved().is_empty());
}

#[tokio::test]
async fn peer_hit_streams_and_caches() {
    let tmp = tempfile::tempdir().unwrap();
    let snapshot_dir = seed_ref(tmp.path(), "abc123def456").await;

    let peer = spawn_fixed_server("peer-content").await;
    let h = spawn_registry(hf_config(tmp.path(), "http://invalid-upstream"))
        .await;
    h.router.add(
        "hf:/huggingface/org/model/resolve/main/model.bin",
        peer,
    );

    let resp = h
        .client
        .get(format!(
            "http://{}/huggingface/org/model/resolve/main/model.bin",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    assert_eq!("peer-content", resp.text().await.unwrap());
    await_file(&snapshot_dir.join("model.bin"), "peer-content").await;
    await_advertised(
        &h.router,
        "hf:/huggingface/org/model/resolve/main/model.bin",
    )
    .await;
}

#[tokio::test]
async fn upstream_fallback_caches_and_advertises_once() {
    let tmp = tempfile::tempdir().unwrap();
    let snapshot_dir = seed_ref(tmp.path(), "abc123def456").await;

    let upstream = spawn_fixed_server("upstream-content").await;
    let h =
        spawn_registry(hf_config(tmp.path(), format!("http://{upstream}")))
            .await;

    let key = "hf:/huggingface/org/model/resolve/main/model.bin";
    let resp = h
        .client
        .get(format!(
            "http://{}/huggingface/org/model/resolve/main/model.bin",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    assert_eq!("upstream-content", resp.text().await.unwrap());
    await_file(&snapshot_dir.join("model.bin"), "upstream-content").await;
    await_advertised(&h.router, key).await;
    assert_eq!(
        1,
        h.router.advertised().iter().filter(|k| *k == key).count()
    );
}

#[tokio::test]
async fn small_files_skip_peer_resolution() {
    let tmp = tempfile::tempdir().unwrap();
    seed_ref(tmp.path(), "abc123").await;

    let upstream = spawn_fixed_server("tokenizer-bytes").await;
    let h =
        spawn_registry(hf_config(tmp.path(), format!("http://{upstream}")))
            .await;
    // A peer exists for the key; it must not be consulted.
    let peer = spawn_fixed_server("wrong-content").await;
    h.router
        .add("hf:/huggingface/org/model/resolve/main/tokenizer.json", peer);

    let resp = h
        .client
        .get(format!(
            "http://{}/huggingface/org/model/resolve/main/tokenizer.json",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    assert_eq!("tokenizer-bytes", resp.text().await.unwrap());
    assert!(h.router.resolved().is_empty());
}

#[tokio::test]
async fn api_requests_fall_through_to_upstream() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = spawn_fixed_server("api-response").await;
    let h =
        spawn_registry(hf_config(tmp.path(), format!("http://{upstream}")))
            .await;

    let resp = h
        .client
        .get(format!(
            "http://{}/huggingface/api/models/org/model",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    assert_eq!("api-response", resp.text().await.unwrap());
}

#[tokio::test]
async fn unsupported_path_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let h = spawn_registry(hf_config(tmp.path(), "http://invalid-upstream"))
        .await;

    let resp = h
        .client
        .get(format!("http://{}/huggingface/invalid/path", h.addr))
        .send()
        .await
        .unwrap();

    assert_eq!(400, resp.status().as_u16());
}

#[tokio::test]
async fn mirrored_request_never_resolves_peers() {
    let tmp = tempfile::tempdir().unwrap();
    seed_ref(tmp.path(), "abc123").await;
    let h = spawn_registry(hf_config(tmp.path(), "http://invalid-upstream"))
        .await;
    let peer = spawn_fixed_server("wrong-content").await;
    h.router
        .add("hf:/huggingface/org/model/resolve/main/model.bin", peer);

    let resp = h
        .client
        .get(format!(
            "http://{}/huggingface/org/model/resolve/main/model.bin",
            h.addr
        ))
        .header(clyde_api::MIRRORED_HEADER, "true")
        .send()
        .await
        .unwrap();

    assert_eq!(404, resp.status().as_u16());
    assert!(h.router.resolved().is_empty());
}
