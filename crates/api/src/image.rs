//! Container image references and OCI distribution request paths.

use crate::{ClydeError, ClydeResult, Digest};

/// A container image known to the local content store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Registry host the image originates from, e.g. `docker.io`.
    pub registry: String,
    /// Repository within the registry, e.g. `library/nginx`.
    pub repository: String,
    /// Tag, if the image was pulled by tag. Digest-only references have
    /// no tag.
    pub tag: Option<String>,
    /// The manifest digest of the image.
    pub digest: Digest,
}

impl Image {
    /// Construct an image reference, validating its parts.
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        tag: Option<String>,
        digest: Digest,
    ) -> ClydeResult<Self> {
        let registry = registry.into();
        let repository = repository.into();
        if registry.is_empty() || repository.is_empty() {
            return Err(ClydeError::other(
                "image requires both registry and repository",
            ));
        }
        if let Some(tag) = &tag {
            if tag.is_empty() {
                return Err(ClydeError::other("image tag may not be empty"));
            }
        }
        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The routable tag key `<registry>/<repo>:<tag>`, if this image has
    /// a tag.
    pub fn tag_name(&self) -> Option<String> {
        self.tag
            .as_ref()
            .map(|tag| format!("{}/{}:{}", self.registry, self.repository, tag))
    }

    /// True when the tag is exactly `latest`.
    pub fn is_latest_tag(&self) -> bool {
        self.tag.as_deref() == Some("latest")
    }
}

impl std::fmt::Display for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.tag {
            Some(tag) => {
                write!(f, "{}/{}:{}", self.registry, self.repository, tag)
            }
            None => {
                write!(f, "{}/{}@{}", self.registry, self.repository, self.digest)
            }
        }
    }
}

/// Whether a distribution request addresses a manifest or a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionKind {
    /// `/v2/<name>/manifests/<reference>`
    Manifest,
    /// `/v2/<name>/blobs/<digest>`
    Blob,
}

/// A parsed OCI distribution request path.
///
/// The mirrored registry is carried in the `ns` query parameter, the way
/// containerd addresses mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionPath {
    /// Manifest or blob.
    pub kind: DistributionKind,
    /// Origin registry, from the `ns` query parameter.
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag reference, when the request addressed a manifest by tag.
    pub tag: Option<String>,
    /// Digest, when the request addressed content by digest.
    pub digest: Option<Digest>,
}

impl DistributionPath {
    /// Parse a request path plus query string according to the OCI
    /// distribution spec subset clyde serves.
    pub fn parse(path: &str, query: Option<&str>) -> ClydeResult<Self> {
        let registry = query
            .and_then(|q| {
                q.split('&')
                    .find_map(|kv| kv.strip_prefix("ns="))
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let segments: Vec<&str> =
            path.trim_matches('/').split('/').collect();
        if segments.len() < 4 || segments[0] != "v2" {
            return Err(ClydeError::not_found(format!(
                "not a distribution path: {path}"
            )));
        }

        let reference = segments[segments.len() - 1];
        let kind_seg = segments[segments.len() - 2];
        let repository = segments[1..segments.len() - 2].join("/");
        if repository.is_empty() {
            return Err(ClydeError::not_found(format!(
                "missing repository name in {path}"
            )));
        }

        match kind_seg {
            "manifests" => {
                let (tag, digest) = match Digest::parse(reference) {
                    Ok(digest) => (None, Some(digest)),
                    Err(_) => (Some(reference.to_string()), None),
                };
                Ok(Self {
                    kind: DistributionKind::Manifest,
                    registry,
                    repository,
                    tag,
                    digest,
                })
            }
            "blobs" => {
                let digest = Digest::parse(reference)?;
                Ok(Self {
                    kind: DistributionKind::Blob,
                    registry,
                    repository,
                    tag: None,
                    digest: Some(digest),
                })
            }
            _ => Err(ClydeError::not_found(format!(
                "unknown distribution path kind in {path}"
            ))),
        }
    }

    /// The content key this request routes on: the digest when present,
    /// otherwise the tag key `<registry>/<repo>:<tag>`.
    pub fn key(&self) -> String {
        match &self.digest {
            Some(digest) => digest.to_string(),
            None => format!(
                "{}/{}:{}",
                self.registry,
                self.repository,
                self.tag.as_deref().unwrap_or_default()
            ),
        }
    }

    /// True when the request addressed the mutable `latest` tag.
    pub fn is_latest_tag(&self) -> bool {
        self.tag.as_deref() == Some("latest")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const HEX: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn parse_manifest_tag() {
        let dist = DistributionPath::parse(
            "/v2/library/nginx/manifests/1.27",
            Some("ns=docker.io"),
        )
        .unwrap();
        assert_eq!(DistributionKind::Manifest, dist.kind);
        assert_eq!("docker.io", dist.registry);
        assert_eq!("library/nginx", dist.repository);
        assert_eq!(Some("1.27".to_string()), dist.tag);
        assert_eq!("docker.io/library/nginx:1.27", dist.key());
    }

    #[test]
    fn parse_manifest_digest() {
        let dist = DistributionPath::parse(
            &format!("/v2/library/nginx/manifests/sha256:{HEX}"),
            Some("ns=docker.io"),
        )
        .unwrap();
        assert_eq!(None, dist.tag);
        assert_eq!(format!("sha256:{HEX}"), dist.key());
    }

    #[test]
    fn parse_blob() {
        let dist = DistributionPath::parse(
            &format!("/v2/org/app/blobs/sha256:{HEX}"),
            Some("ns=ghcr.io"),
        )
        .unwrap();
        assert_eq!(DistributionKind::Blob, dist.kind);
        assert_eq!("org/app", dist.repository);
        assert_eq!(format!("sha256:{HEX}"), dist.key());
    }

    #[test]
    fn parse_nested_repository() {
        let dist = DistributionPath::parse(
            "/v2/a/b/c/manifests/stable",
            Some("ns=quay.io"),
        )
        .unwrap();
        assert_eq!("a/b/c", dist.repository);
    }

    #[test]
    fn reject_blob_tag_reference() {
        assert!(DistributionPath::parse(
            "/v2/library/nginx/blobs/not-a-digest",
            None,
        )
        .is_err());
    }

    #[test]
    fn reject_non_distribution_path() {
        assert!(DistributionPath::parse("/v3/foo/manifests/bar", None).is_err());
        assert!(DistributionPath::parse("/v2/", None).is_err());
    }

    #[test]
    fn latest_tag_detection() {
        let dist = DistributionPath::parse(
            "/v2/library/nginx/manifests/latest",
            Some("ns=docker.io"),
        )
        .unwrap();
        assert!(dist.is_latest_tag());
    }

    #[test]
    fn image_display_and_tag_name() {
        let digest = Digest::parse(&format!("sha256:{HEX}")).unwrap();
        let img = Image::new(
            "docker.io",
            "library/nginx",
            Some("1.27".into()),
            digest.clone(),
        )
        .unwrap();
        assert_eq!("docker.io/library/nginx:1.27", img.to_string());
        assert_eq!(
            Some("docker.io/library/nginx:1.27".to_string()),
            img.tag_name()
        );
        assert!(!img.is_latest_tag());

        let img = Image::new("docker.io", "library/nginx", None, digest)
            .unwrap();
        assert_eq!(
            format!("docker.io/library/nginx@sha256:{HEX}"),
            img.to_string()
        );
        assert_eq!(None, img.tag_name());
    }
}
