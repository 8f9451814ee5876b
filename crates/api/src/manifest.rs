//! OCI manifest inspection: media type detection and manifest graph
//! walking.

use crate::{
    ClydeError, ClydeResult, Digest, DynContentStore, Image,
};

/// OCI image index media type.
pub const MEDIA_TYPE_OCI_INDEX: &str =
    "application/vnd.oci.image.index.v1+json";
/// OCI image manifest media type.
pub const MEDIA_TYPE_OCI_MANIFEST: &str =
    "application/vnd.oci.image.manifest.v1+json";
/// Docker schema 2 manifest list media type.
pub const MEDIA_TYPE_DOCKER_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// Docker schema 2 manifest media type.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Detect the media type of manifest bytes. Prefers the embedded
/// `mediaType` field and falls back to structural inference, since older
/// manifests omit the field.
pub fn determine_media_type(data: &[u8]) -> ClydeResult<String> {
    let value: serde_json::Value = serde_json::from_slice(data)
        .map_err(|e| ClydeError::other_src("could not parse manifest", e))?;
    if let Some(mt) = value.get("mediaType").and_then(|v| v.as_str()) {
        return Ok(mt.to_string());
    }
    if value.get("manifests").is_some() {
        return Ok(MEDIA_TYPE_OCI_INDEX.to_string());
    }
    if value.get("config").is_some() && value.get("layers").is_some() {
        return Ok(MEDIA_TYPE_OCI_MANIFEST.to_string());
    }
    Err(ClydeError::other(
        "could not determine media type of manifest",
    ))
}

fn is_index_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_LIST
}

fn descriptor_digests(value: &serde_json::Value, field: &str) -> Vec<String> {
    value
        .get(field)
        .and_then(|v| v.as_array())
        .map(|descs| {
            descs
                .iter()
                .filter_map(|d| d.get("digest").and_then(|v| v.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Walk the manifest graph of an image, collecting every referenced
/// digest: the manifest digest itself, nested platform manifests, config
/// and layer digests. Platform manifests missing from the local store
/// are skipped; the root manifest must be present.
pub async fn walk_image(
    store: &DynContentStore,
    image: &Image,
) -> ClydeResult<Vec<String>> {
    let mut digests = Vec::new();
    let mut queue = vec![(image.digest.clone(), true)];
    while let Some((digest, root)) = queue.pop() {
        let (data, media_type) = match store.get_manifest(&digest).await {
            Ok(found) => found,
            Err(err) if !root && err.is_not_found() => continue,
            Err(err) => {
                return Err(ClydeError::other_src(
                    format!("could not walk image {image}"),
                    err,
                ))
            }
        };
        digests.push(digest.to_string());

        let value: serde_json::Value = serde_json::from_slice(&data)
            .map_err(|e| {
                ClydeError::other_src(
                    format!("invalid manifest {digest} for image {image}"),
                    e,
                )
            })?;

        if is_index_type(&media_type) {
            for child in descriptor_digests(&value, "manifests") {
                queue.push((Digest::parse(&child)?, false));
            }
        } else {
            if let Some(config) = value
                .get("config")
                .and_then(|c| c.get("digest"))
                .and_then(|v| v.as_str())
            {
                digests.push(config.to_string());
            }
            digests.extend(descriptor_digests(&value, "layers"));
        }
    }
    Ok(digests)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn media_type_from_field() {
        let data = format!(r#"{{"mediaType":"{MEDIA_TYPE_DOCKER_MANIFEST}"}}"#);
        assert_eq!(
            MEDIA_TYPE_DOCKER_MANIFEST,
            determine_media_type(data.as_bytes()).unwrap()
        );
    }

    #[test]
    fn media_type_inferred_index() {
        let data = br#"{"schemaVersion":2,"manifests":[]}"#;
        assert_eq!(MEDIA_TYPE_OCI_INDEX, determine_media_type(data).unwrap());
    }

    #[test]
    fn media_type_inferred_manifest() {
        let data = br#"{"schemaVersion":2,"config":{},"layers":[]}"#;
        assert_eq!(
            MEDIA_TYPE_OCI_MANIFEST,
            determine_media_type(data).unwrap()
        );
    }

    #[test]
    fn media_type_undeterminable() {
        assert!(determine_media_type(br#"{"foo":"bar"}"#).is_err());
        assert!(determine_media_type(b"not json").is_err());
    }
}
