//! The read-only view of the container runtime's content store.

use crate::{BoxFut, ClydeResult, Digest, Image};
use bytes::Bytes;
use std::sync::Arc;

/// What happened to an image in the runtime's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The image appeared.
    Create,
    /// The image was re-tagged or otherwise updated.
    Update,
    /// The image was removed.
    Delete,
}

/// A change event emitted by the content store subscription.
#[derive(Debug, Clone)]
pub struct ImageEvent {
    /// The image the event concerns.
    pub image: Image,
    /// The kind of change.
    pub kind: EventKind,
}

/// Read-only interface to the container runtime's local blob and
/// manifest store. The router and handlers never write through this
/// interface; the runtime owns persistence.
pub trait ContentStore: 'static + Send + Sync + std::fmt::Debug {
    /// A short name identifying the store implementation.
    fn name(&self) -> &'static str;

    /// Check that the store is reachable and usable. Called once at
    /// startup; a failure here is fatal.
    fn verify(&self) -> BoxFut<'_, ClydeResult<()>>;

    /// Subscribe to image change events. The receiver stays open for the
    /// lifetime of the store.
    fn subscribe(
        &self,
    ) -> BoxFut<'_, ClydeResult<tokio::sync::mpsc::Receiver<ImageEvent>>>;

    /// List all images currently present in the store.
    fn list_images(&self) -> BoxFut<'_, ClydeResult<Vec<Image>>>;

    /// Resolve a tag reference (`<registry>/<repo>:<tag>`) to the digest
    /// it currently points at.
    fn resolve(&self, reference: &str) -> BoxFut<'_, ClydeResult<Digest>>;

    /// The size in bytes of the content stored under a digest.
    fn size(&self, digest: &Digest) -> BoxFut<'_, ClydeResult<u64>>;

    /// Fetch manifest bytes plus the detected media type.
    fn get_manifest(
        &self,
        digest: &Digest,
    ) -> BoxFut<'_, ClydeResult<(Bytes, String)>>;

    /// Fetch blob bytes.
    fn get_blob(&self, digest: &Digest) -> BoxFut<'_, ClydeResult<Bytes>>;
}

/// Trait-object [ContentStore].
pub type DynContentStore = Arc<dyn ContentStore>;
