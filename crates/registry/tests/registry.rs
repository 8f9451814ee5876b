//! Container plane and front-listener behavior.

mod common;

use clyde_api::*;
use clyde_registry::{OciConfig, RegistryConfig};
use common::*;

const MANIFEST: &str = r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"digest":"sha256:1111111111111111111111111111111111111111111111111111111111111111"},"layers":[]}"#;

fn seed_manifest(h: &Harness) -> (Image, Digest) {
    let digest = Digest::sha256_of(MANIFEST.as_bytes());
    h.store.add_blob(digest.clone(), MANIFEST.as_bytes().to_vec());
    let image = Image::new(
        "docker.io",
        "library/nginx",
        Some("1.27".to_string()),
        digest.clone(),
    )
    .unwrap();
    h.store.add_image(image.clone());
    (image, digest)
}

#[tokio::test]
async fn healthz_reflects_router_readiness() {
    let h = spawn_registry(RegistryConfig::default()).await;
    let resp = h
        .client
        .get(format!("http://{}/healthz", h.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(200, resp.status().as_u16());
}

#[tokio::test]
async fn v2_root_confirms_api_support() {
    let h = spawn_registry(RegistryConfig::default()).await;
    let resp = h
        .client
        .get(format!("http://{}/v2/", h.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(200, resp.status().as_u16());
}

#[tokio::test]
async fn local_manifest_served_with_distribution_headers() {
    let h = spawn_registry(RegistryConfig::default()).await;
    let (_, digest) = seed_manifest(&h);

    let resp = h
        .client
        .get(format!(
            "http://{}/v2/library/nginx/manifests/1.27?ns=docker.io",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    assert_eq!(
        "application/vnd.oci.image.manifest.v1+json",
        resp.headers().get("content-type").unwrap()
    );
    assert_eq!(
        digest.to_string(),
        resp.headers()
            .get("docker-content-digest")
            .unwrap()
            .to_str()
            .unwrap()
    );
    assert_eq!(MANIFEST, resp.text().await.unwrap());
}

#[tokio::test]
async fn head_manifest_returns_headers_only() {
    let h = spawn_registry(RegistryConfig::default()).await;
    seed_manifest(&h);

    let resp = h
        .client
        .head(format!(
            "http://{}/v2/library/nginx/manifests/1.27?ns=docker.io",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    assert_eq!(
        MANIFEST.len().to_string(),
        resp.headers()
            .get("content-length")
            .unwrap()
            .to_str()
            .unwrap()
    );
}

#[tokio::test]
async fn blob_supports_range_requests() {
    let h = spawn_registry(RegistryConfig::default()).await;
    let data = b"0123456789".to_vec();
    let digest = Digest::sha256_of(&data);
    h.store.add_blob(digest.clone(), data);

    let url = format!(
        "http://{}/v2/library/nginx/blobs/{digest}?ns=docker.io",
        h.addr
    );

    let resp = h
        .client
        .get(&url)
        .header(clyde_api::MIRRORED_HEADER, "true")
        .send()
        .await
        .unwrap();
    assert_eq!(200, resp.status().as_u16());
    assert_eq!("bytes", resp.headers().get("accept-ranges").unwrap());
    assert_eq!("0123456789", resp.text().await.unwrap());

    let resp = h
        .client
        .get(&url)
        .header(clyde_api::MIRRORED_HEADER, "true")
        .header("range", "bytes=2-4")
        .send()
        .await
        .unwrap();
    assert_eq!(206, resp.status().as_u16());
    assert_eq!(
        "bytes 2-4/10",
        resp.headers().get("content-range").unwrap()
    );
    assert_eq!("234", resp.text().await.unwrap());
}

#[tokio::test]
async fn mirror_request_streams_from_peer() {
    let peer = spawn_fixed_server("layer-bytes").await;
    let h = spawn_registry(RegistryConfig::default()).await;
    let digest = Digest::sha256_of(b"layer-bytes");
    h.router.add(digest.to_string(), peer);

    let resp = h
        .client
        .get(format!(
            "http://{}/v2/library/nginx/blobs/{digest}?ns=docker.io",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    assert_eq!("layer-bytes", resp.text().await.unwrap());
}

#[tokio::test]
async fn mirrored_request_missing_manifest_is_404_without_resolve() {
    let h = spawn_registry(RegistryConfig::default()).await;
    let peer = spawn_fixed_server("wrong").await;
    h.router.add("docker.io/library/nginx:1.27", peer);

    let resp = h
        .client
        .get(format!(
            "http://{}/v2/library/nginx/manifests/1.27?ns=docker.io",
            h.addr
        ))
        .header(clyde_api::MIRRORED_HEADER, "true")
        .send()
        .await
        .unwrap();

    assert_eq!(404, resp.status().as_u16());
    assert!(h.router.resolved().is_empty());
}

#[tokio::test]
async fn latest_tag_skips_mirror_when_disabled() {
    let peer = spawn_fixed_server("should-not-serve").await;
    let config = RegistryConfig {
        oci: OciConfig {
            resolve_latest_tag: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let h = spawn_registry(config).await;
    h.router.add("docker.io/library/nginx:latest", peer);

    let resp = h
        .client
        .get(format!(
            "http://{}/v2/library/nginx/manifests/latest?ns=docker.io",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(404, resp.status().as_u16());
    assert!(h.router.resolved().is_empty());
}

#[tokio::test]
async fn mirror_fails_over_to_next_peer() {
    // First candidate refuses connections; the second serves.
    let dead: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
    let alive = spawn_fixed_server("from-second-peer").await;
    let h = spawn_registry(RegistryConfig::default()).await;
    let digest = Digest::sha256_of(b"from-second-peer");
    h.router.add(digest.to_string(), dead);
    h.router.add(digest.to_string(), alive);

    let resp = h
        .client
        .get(format!(
            "http://{}/v2/library/nginx/blobs/{digest}?ns=docker.io",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(200, resp.status().as_u16());
    assert_eq!("from-second-peer", resp.text().await.unwrap());
}

#[tokio::test]
async fn exhausted_mirrors_return_not_found() {
    let h = spawn_registry(RegistryConfig::default()).await;
    let digest = Digest::sha256_of(b"nowhere");

    let resp = h
        .client
        .get(format!(
            "http://{}/v2/library/nginx/blobs/{digest}?ns=docker.io",
            h.addr
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(404, resp.status().as_u16());
}

#[tokio::test]
async fn basic_auth_gates_v2_only() {
    let config = RegistryConfig {
        basic_auth: Some(("user".to_string(), "pass".to_string())),
        ..Default::default()
    };
    let h = spawn_registry(config).await;
    seed_manifest(&h);

    let url = format!(
        "http://{}/v2/library/nginx/manifests/1.27?ns=docker.io",
        h.addr
    );
    let resp = h.client.get(&url).send().await.unwrap();
    assert_eq!(401, resp.status().as_u16());

    let resp = h
        .client
        .get(&url)
        .basic_auth("user", Some("pass"))
        .send()
        .await
        .unwrap();
    assert_eq!(200, resp.status().as_u16());

    // The health probe stays open.
    let resp = h
        .client
        .get(format!("http://{}/healthz", h.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(200, resp.status().as_u16());
}
