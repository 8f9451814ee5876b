//! Local inventory collection for the key-exchange gossip.

use bytes::Bytes;
use clyde_api::*;
use std::collections::HashSet;

/// The local node's gossipable inventory: the serialised JSON blob
/// installed into the key exchange, plus the flat key set used to diff
/// peer inventories.
pub struct LocalInventory {
    /// UTF-8 JSON array of [ImageLayers] records.
    pub json: Bytes,
    /// Every digest appearing in `json`.
    pub keys: HashSet<String>,
}

impl LocalInventory {
    /// Walk all local images and build the inventory, limited to images
    /// matching the inclusion list. An empty list gossips nothing; the
    /// blob is then the empty JSON array.
    pub async fn collect(
        store: &DynContentStore,
        include_images: &[String],
    ) -> ClydeResult<Self> {
        let images = store.list_images().await?;

        let mut records = Vec::new();
        for image in images {
            let name = image.to_string();
            if !is_included(&name, include_images) {
                tracing::debug!(image = name, "excluding image from inventory");
                continue;
            }
            let digests = match manifest::walk_image(store, &image).await {
                Ok(digests) => digests,
                Err(err) => {
                    tracing::warn!(image = name, "could not walk image: {err}");
                    continue;
                }
            };
            records.push(ImageLayers {
                image_name: name,
                registry: image.registry.clone(),
                tag: image.tag.clone().unwrap_or_default(),
                digest: image.digest.to_string(),
                layer_keys: digests,
            });
        }

        let keys = records
            .iter()
            .flat_map(|r| r.layer_keys.iter().cloned())
            .collect();
        let json = serde_json::to_vec(&records).map_err(|e| {
            ClydeError::other_src("failed to serialise inventory", e)
        })?;
        Ok(Self {
            json: json.into(),
            keys,
        })
    }
}

/// Substring match against `<registry>/<repo>:<tag>`. An empty
/// inclusion list matches nothing.
pub fn is_included(image_name: &str, include_images: &[String]) -> bool {
    include_images
        .iter()
        .any(|needle| image_name.contains(needle.as_str()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_inclusion_list_matches_nothing() {
        assert!(!is_included("docker.io/library/nginx:1.27", &[]));
    }

    #[test]
    fn inclusion_is_substring_match() {
        let list = vec!["nginx".to_string()];
        assert!(is_included("docker.io/library/nginx:1.27", &list));
        assert!(!is_included("docker.io/library/redis:7", &list));
    }
}
