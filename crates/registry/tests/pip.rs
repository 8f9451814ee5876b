//! Wheel plane end-to-end behavior against fake peers and upstreams.

mod common;

use clyde_registry::{PipConfig, RegistryConfig};
use common::*;
use std::future::IntoFuture;
use std::path::Path;

fn pip_config(cache_dir: &Path, fallback: impl Into<String>) -> RegistryConfig {
    let mut pip = PipConfig::new(cache_dir);
    pip.fallback_index = fallback.into();
    pip.resolve_timeout = std::time::Duration::from_secs(3);
    pip.resolve_retries = 1;
    RegistryConfig {
        pip: Some(pip),
        ..Default::default()
    }
}

#[tokio::test]
async fn root_index_serves_marker() {
    let tmp = tempfile::tempdir().unwrap();
    let h = spawn_registry(pip_config(tmp.path(), "http://invalid")).await;

    for path in ["/simple", "/simple/"] {
        let resp = h
            .client
            .get(format!("http://{}{path}", h.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(200, resp.status().as_u16());
        assert_eq!("clyde pip simple index", resp.text().await.unwrap());
    }
}

#[tokio::test]
async fn cached_wheel_is_served_from_disk() {
    let tmp = tempfile::tempdir().unwrap();
    tokio::fs::write(
        tmp.path().join("testpkg-1.0.0-py3-none-any.whl"),
        "cached wheel content",
    )
    .await
    .unwrap();

    let h = spawn_registry(pip_config(tmp.path(), "http://invalid")).await;
    let resp = h
        .client
        .get(format!(
            "http://{}/packages/testpkg-1.0.0-py3-none-any.whl",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    assert_eq!("cached wheel content", resp.text().await.unwrap());
    assert!(h.router.resolved().is_empty());
}

#[tokio::test]
async fn peer_hit_streams_persists_and_advertises() {
    let tmp = tempfile::tempdir().unwrap();
    let peer = spawn_fixed_server("peer wheel content").await;

    let h = spawn_registry(pip_config(tmp.path(), "http://invalid")).await;
    h.router
        .add("pip:peerpkg-1.0.0-py3-none-any.whl", peer);

    let resp = h
        .client
        .get(format!(
            "http://{}/packages/peerpkg-1.0.0-py3-none-any.whl",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    assert_eq!("peer wheel content", resp.text().await.unwrap());
    await_file(
        &tmp.path().join("peerpkg-1.0.0-py3-none-any.whl"),
        "peer wheel content",
    )
    .await;
    await_advertised(&h.router, "pip:peerpkg-1.0.0-py3-none-any.whl").await;
}

#[tokio::test]
async fn key_derivation_lowercases_names() {
    let tmp = tempfile::tempdir().unwrap();
    let peer = spawn_fixed_server("mixed case wheel").await;
    let h = spawn_registry(pip_config(tmp.path(), "http://invalid")).await;
    // Key space is lower-cased even when the request is not.
    h.router.add("pip:mixed-1.0.0-py3-none-any.whl", peer);

    let resp = h
        .client
        .get(format!(
            "http://{}/packages/Mixed-1.0.0-py3-none-any.whl",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    assert_eq!("mixed case wheel", resp.text().await.unwrap());
}

#[tokio::test]
async fn upstream_index_is_rewritten_and_cached() {
    let tmp = tempfile::tempdir().unwrap();

    let index_body = concat!(
        r#"<a href="https://files.pythonhosted.org/packages/ab/cd/testpkg-1.0.0-py3-none-any.whl">testpkg-1.0.0-py3-none-any.whl</a>"#,
        "\n",
        r#"<a href="https://pypi.org/simple/other/">other</a>"#,
    );
    let upstream = axum::Router::new().fallback(move || async move {
        axum::response::Html(index_body)
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    tokio::task::spawn(axum::serve(listener, upstream).into_future());

    let h = spawn_registry(pip_config(
        tmp.path(),
        format!("http://{upstream_addr}"),
    ))
    .await;

    let resp = h
        .client
        .get(format!("http://{}/simple/testpkg/", h.addr))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    let body = resp.text().await.unwrap();
    assert!(body.contains(r#"href="/packages/ab/cd/testpkg-1.0.0-py3-none-any.whl""#));
    assert!(body.contains(r#"href="/simple/other/""#));
    assert!(!body.contains("pythonhosted.org"));

    let expected = index_body
        .replace("https://files.pythonhosted.org/packages/", "/packages/")
        .replace("https://pypi.org/simple/", "/simple/");
    await_file(&tmp.path().join("testpkg.html"), &expected).await;
    await_advertised(&h.router, "pip:testpkg").await;
}

#[tokio::test]
async fn head_request_to_peer_is_not_cached() {
    let tmp = tempfile::tempdir().unwrap();
    let peer = spawn_fixed_server("peer wheel content").await;
    let h = spawn_registry(pip_config(tmp.path(), "http://invalid")).await;
    h.router.add("pip:headpkg-1.0.0-py3-none-any.whl", peer);

    let resp = h
        .client
        .head(format!(
            "http://{}/packages/headpkg-1.0.0-py3-none-any.whl",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    // A HEAD has no body to tee; nothing may land in the cache.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!tmp
        .path()
        .join("headpkg-1.0.0-py3-none-any.whl")
        .exists());
}

#[tokio::test]
async fn mirrored_request_is_local_only() {
    let tmp = tempfile::tempdir().unwrap();
    let peer = spawn_fixed_server("wrong").await;
    let h = spawn_registry(pip_config(tmp.path(), "http://invalid")).await;
    h.router.add("pip:pkg-1.0.0-py3-none-any.whl", peer);

    let resp = h
        .client
        .get(format!(
            "http://{}/packages/pkg-1.0.0-py3-none-any.whl",
            h.addr
        ))
        .header(clyde_api::MIRRORED_HEADER, "true")
        .send()
        .await
        .unwrap();

    assert_eq!(404, resp.status().as_u16());
    assert!(h.router.resolved().is_empty());
}
