#![deny(missing_docs)]
//! The state tracker.
//!
//! A single-writer actor reconciles local inventory with the cluster:
//! on every tick it advertises all local container, wheel, and model
//! keys, publishes the inventory blob for the key exchange, discovers
//! peers through the peer index, diffs their inventories against local
//! content, and prefetches missing container layers in parallel. Image
//! change events from the content store trigger targeted advertisement
//! between ticks.
//!
//! Because one task handles both trigger sources, a tick cycle and an
//! image event can never run concurrently; events simply queue while a
//! cycle runs.

use clyde_api::*;
use clyde_router::KEY_TTL;
use std::time::Duration;

mod inventory;
pub use inventory::*;

mod prefetch;
pub use prefetch::*;

mod walk;
pub use walk::*;

/// Configuration for [track].
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// When false, `latest` tags are never advertised.
    pub resolve_latest_tag: bool,
    /// Substring filters selecting which images are gossiped to peers
    /// and prefetched from them. Empty means gossip nothing.
    pub include_images: Vec<String>,
    /// The containerd content store path; prefetched blobs are written
    /// under its `blobs/<algo>/<hex>` layout.
    pub content_path: std::path::PathBuf,
    /// Wheel cache directory to advertise from, if the pip plane runs.
    pub pip_cache_dir: Option<std::path::PathBuf>,
    /// Model cache directory to advertise from, if the model plane
    /// runs.
    pub hf_cache_dir: Option<std::path::PathBuf>,
}

/// Run the tracker until the content store's event stream closes.
/// Reconciliation errors are logged, never raised; only losing the
/// event subscription ends the loop.
pub async fn track(
    store: DynContentStore,
    router: DynRouter,
    config: TrackerConfig,
) -> ClydeResult<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|e| ClydeError::init_src("could not build http client", e))?;

    let mut events = store.subscribe().await?;
    // Re-advertisement has to outpace provider record expiry.
    let mut ticker = tokio::time::interval(KEY_TTL - Duration::from_secs(60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tracing::info!("running scheduled state update");
                run_cycle(&store, &router, &client, &config).await;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Err(ClydeError::other("image event channel closed"));
                };
                tracing::info!(image = %event.image, kind = ?event.kind, "received image event");
                if let Err(err) =
                    advertise_image(&store, &router, &event, false, config.resolve_latest_tag).await
                {
                    tracing::warn!("could not update image advertisement: {err}");
                }
            }
        }
    }
}

async fn run_cycle(
    store: &DynContentStore,
    router: &DynRouter,
    client: &reqwest::Client,
    config: &TrackerConfig,
) {
    if let Err(err) =
        advertise_all(store, router, config.resolve_latest_tag).await
    {
        tracing::warn!("received errors when updating all images: {err}");
    }

    if let Err(err) = synchronise(store, router, client, config).await {
        tracing::warn!("peer sync failed: {err}");
    }

    if let Some(dir) = &config.pip_cache_dir {
        if let Err(err) = sync_pip(router, dir).await {
            tracing::warn!("errors during pip resync: {err}");
        }
    }

    if let Some(dir) = &config.hf_cache_dir {
        if let Err(err) = sync_hf(router, dir).await {
            tracing::warn!("errors during hf resync: {err}");
        }
    }
}

/// Advertise every image in the store and reset the advertisement
/// gauges to match.
pub async fn advertise_all(
    store: &DynContentStore,
    router: &DynRouter,
    resolve_latest_tag: bool,
) -> ClydeResult<()> {
    let metrics = clyde_metrics::metrics();
    metrics.advertised_keys.reset();
    metrics.advertised_images.reset();
    metrics.advertised_image_tags.reset();
    metrics.advertised_image_digests.reset();

    let images = store.list_images().await?;
    let mut errs = Vec::new();
    let mut seen_digests = std::collections::HashSet::new();
    for image in images {
        // The list may name one digest under several tags; walk each
        // manifest graph once.
        let skip_digests = !seen_digests.insert(image.digest.clone());
        let event = ImageEvent {
            image: image.clone(),
            kind: EventKind::Update,
        };
        let count = match advertise_image(
            store,
            router,
            &event,
            skip_digests,
            resolve_latest_tag,
        )
        .await
        {
            Ok(count) => count,
            Err(err) => {
                errs.push(err.to_string());
                continue;
            }
        };
        metrics
            .advertised_keys
            .with_label_values(&[image.registry.as_str()])
            .add(count as f64);
        metrics
            .advertised_images
            .with_label_values(&[image.registry.as_str()])
            .add(1.0);
        if image.tag.is_none() {
            metrics
                .advertised_image_digests
                .with_label_values(&[image.registry.as_str()])
                .add(1.0);
        } else {
            metrics
                .advertised_image_tags
                .with_label_values(&[image.registry.as_str()])
                .add(1.0);
        }
    }
    if errs.is_empty() {
        Ok(())
    } else {
        Err(ClydeError::other(errs.join("; ")))
    }
}

/// Advertise the keys of a single image: its tag (subject to the
/// latest-tag policy) plus every digest in its manifest graph.
pub async fn advertise_image(
    store: &DynContentStore,
    router: &DynRouter,
    event: &ImageEvent,
    skip_digests: bool,
    resolve_latest_tag: bool,
) -> ClydeResult<usize> {
    let metrics = clyde_metrics::metrics();
    let image = &event.image;
    let mut keys = Vec::new();

    if resolve_latest_tag || !image.is_latest_tag() {
        if let Some(tag_name) = image.tag_name() {
            keys.push(tag_name);
        }
    }

    if event.kind == EventKind::Delete {
        metrics
            .advertised_images
            .with_label_values(&[image.registry.as_str()])
            .sub(1.0);
        tracing::debug!(image = %image, "delete event, skipping digest advertisement");
        return Ok(0);
    }

    if !skip_digests {
        let digests =
            manifest::walk_image(store, image).await.map_err(|err| {
                ClydeError::other_src(
                    format!("could not get digests for image {image}"),
                    err,
                )
            })?;
        keys.extend(digests);
    }

    let count = keys.len();
    if !keys.is_empty() {
        router.advertise(keys).await.map_err(|err| {
            ClydeError::other_src(
                format!("could not advertise image keys for image {image}"),
                err,
            )
        })?;
        tracing::debug!(image = %image, count, "advertised image keys");
    }

    if event.kind == EventKind::Create {
        metrics
            .advertised_images
            .with_label_values(&[image.registry.as_str()])
            .add(1.0);
        if image.tag.is_none() {
            metrics
                .advertised_image_digests
                .with_label_values(&[image.registry.as_str()])
                .add(1.0);
        } else {
            metrics
                .advertised_image_tags
                .with_label_values(&[image.registry.as_str()])
                .add(1.0);
        }
    }

    Ok(count)
}

/// One peer-synchronisation pass: publish the local inventory, discover
/// peers, diff their inventories, and prefetch missing blobs.
pub async fn synchronise(
    store: &DynContentStore,
    router: &DynRouter,
    client: &reqwest::Client,
    config: &TrackerConfig,
) -> ClydeResult<()> {
    let local = LocalInventory::collect(store, &config.include_images).await?;

    router.serve_keys(local.json.clone()).await?;
    router.advertise(vec![PEER_INDEX_KEY.to_string()]).await?;

    let missing = discover_missing(router, &local).await?;
    if missing.is_empty() {
        tracing::info!("no missing keys found from peers");
        return Ok(());
    }
    tracing::info!(count = missing.len(), "found potential keys to fetch");
    prefetch_missing(client, &config.content_path, missing).await;
    Ok(())
}

/// Walk the peer index, pull every peer's inventory, and return the
/// digests they hold that the local node does not. A peer with a broken
/// inventory is skipped; it costs the cycle nothing.
async fn discover_missing(
    router: &DynRouter,
    local: &LocalInventory,
) -> ClydeResult<std::collections::HashMap<String, Vec<KeySource>>> {
    let mut missing: std::collections::HashMap<String, Vec<KeySource>> =
        std::collections::HashMap::new();

    let mut peers = router.resolve(PEER_INDEX_KEY, 0).await?;
    while let Some(peer) = peers.recv().await {
        let data = match router.fetch_peer_keys(peer).await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(%peer, "could not fetch keys from peer: {err}");
                continue;
            }
        };
        if data.is_empty() {
            continue;
        }
        let inventories: Vec<ImageLayers> = match serde_json::from_slice(&data)
        {
            Ok(inventories) => inventories,
            Err(err) => {
                tracing::warn!(%peer, "failed to parse inventory from peer: {err}");
                continue;
            }
        };

        for inventory in inventories {
            tracing::debug!(
                %peer,
                image = inventory.image_name,
                layer_count = inventory.layer_keys.len(),
                "discovered image from peer"
            );
            for layer in &inventory.layer_keys {
                if local.keys.contains(layer) {
                    continue;
                }
                let source = KeySource {
                    peer,
                    image_name: inventory.image_name.clone(),
                    registry: inventory.registry.clone(),
                };
                let sources = missing.entry(layer.clone()).or_default();
                if !sources.contains(&source) {
                    sources.push(source);
                }
            }
        }
    }

    Ok(missing)
}
