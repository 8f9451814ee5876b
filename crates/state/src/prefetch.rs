//! Parallel prefetch of container blobs discovered on peers.

use clyde_api::*;
use rand::Rng;
use sha2::Digest as _;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Fetch every missing digest, each on its own task; workers join only
/// after all of them have been spawned. A failed digest stays missing
/// and is retried on the next cycle.
pub async fn prefetch_missing(
    client: &reqwest::Client,
    content_path: &Path,
    missing: HashMap<String, Vec<KeySource>>,
) {
    let mut workers = tokio::task::JoinSet::new();
    for (key, sources) in missing {
        let client = client.clone();
        let content_path = content_path.to_path_buf();
        workers.spawn(async move {
            if let Err(err) =
                fetch_one(&client, &content_path, &key, &sources).await
            {
                tracing::warn!(key, "could not prefetch blob: {err}");
            }
        });
    }
    workers.join_all().await;
}

async fn fetch_one(
    client: &reqwest::Client,
    content_path: &Path,
    key: &str,
    sources: &[KeySource],
) -> ClydeResult<()> {
    let Some(source) = pick_source(sources) else {
        return Ok(());
    };

    let digest = Digest::parse(key)?;
    if blob_path(content_path, &digest).exists() {
        tracing::debug!(key, "blob already exists, skipping fetch");
        return Ok(());
    }

    tracing::info!(
        key,
        peer = %source.peer,
        image = source.image_name,
        "fetching missing blob from peer"
    );
    let started = std::time::Instant::now();
    let response = client
        .get(blob_url(source, &digest))
        .header(PREFETCH_HEADER, "true")
        .send()
        .await
        .map_err(|e| {
            ClydeError::transport_src(format!("peer {}", source.peer), e)
        })?;
    if response.status() != reqwest::StatusCode::OK {
        return Err(ClydeError::transport(format!(
            "peer {} answered {}",
            source.peer,
            response.status()
        )));
    }

    write_blob(content_path, &digest, response).await?;
    tracing::info!(
        key,
        peer = %source.peer,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "blob successfully stored"
    );
    Ok(())
}

/// One source peer, picked uniformly at random from the candidates.
fn pick_source(sources: &[KeySource]) -> Option<&KeySource> {
    match sources.len() {
        0 => None,
        1 => Some(&sources[0]),
        n => Some(&sources[rand::rng().random_range(0..n)]),
    }
}

/// `GET http://<peer>/v2/<repo>/blobs/<digest>?ns=<registry>`; the repo
/// is the image name with tag and digest suffixes stripped.
fn blob_url(source: &KeySource, digest: &Digest) -> String {
    let repo = repository_of(&source.image_name);
    format!(
        "http://{}/v2/{}/blobs/{}?ns={}",
        source.peer, repo, digest, source.registry
    )
}

fn repository_of(image_name: &str) -> &str {
    let without_digest =
        image_name.split('@').next().unwrap_or(image_name);
    match without_digest.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => repo,
        _ => without_digest,
    }
}

/// The content-store location of a blob.
pub fn blob_path(content_path: &Path, digest: &Digest) -> PathBuf {
    content_path
        .join("blobs")
        .join(digest.algorithm())
        .join(digest.encoded())
}

/// Stream a peer response into the content store's blob layout,
/// verifying the digest as the bytes pass through. A mismatch discards
/// the temp file; a compromised or buggy peer must not poison the
/// cache.
async fn write_blob(
    content_path: &Path,
    digest: &Digest,
    mut response: reqwest::Response,
) -> ClydeResult<()> {
    let dst = blob_path(content_path, digest);
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            ClydeError::other_src("could not create blob directory", e)
        })?;
    }

    let tmp = dst.with_extension("tmp");
    let result = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| ClydeError::other_src("create tmp", e))?;
        let mut hasher = sha2::Sha256::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ClydeError::transport_src("read blob", e))?
        {
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| ClydeError::other_src("write blob", e))?;
        }
        file.sync_all()
            .await
            .map_err(|e| ClydeError::other_src("sync blob", e))?;

        let actual = hex::encode(hasher.finalize());
        if digest.algorithm() == "sha256" && actual != digest.encoded() {
            return Err(ClydeError::transport(format!(
                "digest mismatch from peer: expected {} got sha256:{actual}",
                digest
            )));
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => tokio::fs::rename(&tmp, &dst)
            .await
            .map_err(|e| ClydeError::other_src("rename blob", e)),
        Err(err) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn repository_strips_tag_and_digest() {
        assert_eq!(
            "docker.io/library/nginx",
            repository_of("docker.io/library/nginx:1.27")
        );
        assert_eq!(
            "docker.io/library/nginx",
            repository_of("docker.io/library/nginx:1.27@sha256:abcd")
        );
        assert_eq!(
            "docker.io/library/nginx",
            repository_of("docker.io/library/nginx")
        );
    }

    #[test]
    fn blob_url_carries_namespace_and_sentinel_target() {
        let source = KeySource {
            peer: "10.0.0.2:5000".parse().unwrap(),
            image_name: "docker.io/library/nginx:1.27".to_string(),
            registry: "docker.io".to_string(),
        };
        let digest = Digest::parse(
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
        )
        .unwrap();
        assert_eq!(
            "http://10.0.0.2:5000/v2/docker.io/library/nginx/blobs/sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9?ns=docker.io",
            blob_url(&source, &digest)
        );
    }

    #[test]
    fn blob_path_layout() {
        let digest = Digest::parse(
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
        )
        .unwrap();
        assert_eq!(
            PathBuf::from("/var/lib/containerd/content/blobs/sha256/b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"),
            blob_path(Path::new("/var/lib/containerd/content"), &digest)
        );
    }

    #[test]
    fn pick_source_handles_empty_and_single() {
        assert!(pick_source(&[]).is_none());
        let source = KeySource {
            peer: "10.0.0.2:5000".parse().unwrap(),
            image_name: "img:1".to_string(),
            registry: "docker.io".to_string(),
        };
        assert_eq!(Some(&source), pick_source(std::slice::from_ref(&source)));
    }
}
