#![deny(missing_docs)]
//! An in-memory [ContentStore] implementation.
//!
//! Serves as the content-store stand-in wherever the runtime-native
//! store is not wired up, and as the fixture for handler and tracker
//! tests. Guarded by a conventional mutex; call volume here is far too
//! low for anything fancier.

use bytes::Bytes;
use clyde_api::*;
use std::collections::HashMap;
use std::sync::Mutex;

struct Inner {
    images: Vec<Image>,
    tags: HashMap<String, Digest>,
    blobs: HashMap<Digest, Bytes>,
    subscribers: Vec<tokio::sync::mpsc::Sender<ImageEvent>>,
}

/// In-memory [ContentStore].
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore").finish()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Construct a new empty MemStore.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                images: Vec::new(),
                tags: HashMap::new(),
                blobs: HashMap::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Add an image and notify subscribers. The tag mapping is updated
    /// when the image carries a tag.
    pub fn add_image(&self, image: Image) {
        let senders = {
            let mut inner = self.inner.lock().unwrap();
            inner.images.push(image.clone());
            if let Some(tag_name) = image.tag_name() {
                inner.tags.insert(tag_name, image.digest.clone());
            }
            inner.subscribers.clone()
        };
        for sender in senders {
            let event = ImageEvent {
                image: image.clone(),
                kind: EventKind::Create,
            };
            if sender.try_send(event).is_err() {
                tracing::warn!("image event subscriber lagging, dropped event");
            }
        }
    }

    /// Add raw content under a digest. Manifests and blobs share the
    /// same keyed byte space, just as in the runtime-native store.
    pub fn add_blob(&self, digest: Digest, data: impl Into<Bytes>) {
        self.inner.lock().unwrap().blobs.insert(digest, data.into());
    }
}

impl ContentStore for MemStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn verify(&self) -> BoxFut<'_, ClydeResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn subscribe(
        &self,
    ) -> BoxFut<'_, ClydeResult<tokio::sync::mpsc::Receiver<ImageEvent>>>
    {
        Box::pin(async {
            let (tx, rx) = tokio::sync::mpsc::channel(64);
            self.inner.lock().unwrap().subscribers.push(tx);
            Ok(rx)
        })
    }

    fn list_images(&self) -> BoxFut<'_, ClydeResult<Vec<Image>>> {
        Box::pin(async { Ok(self.inner.lock().unwrap().images.clone()) })
    }

    fn resolve(&self, reference: &str) -> BoxFut<'_, ClydeResult<Digest>> {
        let reference = reference.to_string();
        Box::pin(async move {
            self.inner
                .lock()
                .unwrap()
                .tags
                .get(&reference)
                .cloned()
                .ok_or_else(|| {
                    ClydeError::not_found(format!(
                        "could not resolve tag {reference} to a digest"
                    ))
                })
        })
    }

    fn size(&self, digest: &Digest) -> BoxFut<'_, ClydeResult<u64>> {
        let digest = digest.clone();
        Box::pin(async move {
            self.inner
                .lock()
                .unwrap()
                .blobs
                .get(&digest)
                .map(|b| b.len() as u64)
                .ok_or_else(|| {
                    ClydeError::not_found(format!(
                        "size information for digest {digest} not found"
                    ))
                })
        })
    }

    fn get_manifest(
        &self,
        digest: &Digest,
    ) -> BoxFut<'_, ClydeResult<(Bytes, String)>> {
        let digest = digest.clone();
        Box::pin(async move {
            let data = self
                .inner
                .lock()
                .unwrap()
                .blobs
                .get(&digest)
                .cloned()
                .ok_or_else(|| {
                    ClydeError::not_found(format!(
                        "manifest with digest {digest} not found"
                    ))
                })?;
            let media_type = manifest::determine_media_type(&data)?;
            Ok((data, media_type))
        })
    }

    fn get_blob(&self, digest: &Digest) -> BoxFut<'_, ClydeResult<Bytes>> {
        let digest = digest.clone();
        Box::pin(async move {
            self.inner
                .lock()
                .unwrap()
                .blobs
                .get(&digest)
                .cloned()
                .ok_or_else(|| {
                    ClydeError::not_found(format!(
                        "blob with digest {digest} not found"
                    ))
                })
        })
    }
}
