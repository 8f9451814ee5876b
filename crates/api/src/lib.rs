#![deny(missing_docs)]
//! Clyde API contains the module traits and the basic types required to
//! define the api of those traits.
//!
//! If you want to run the Clyde node itself, please see the clyde crate.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

mod error;
pub use error::*;

pub mod key;
pub use key::*;

mod digest;
pub use digest::*;

pub mod image;
pub use image::{DistributionKind, DistributionPath, Image};

pub mod manifest;

mod inventory;
pub use inventory::*;

pub mod router;
pub use router::{DynRouter, Router};

pub mod content_store;
pub use content_store::{
    ContentStore, DynContentStore, EventKind, ImageEvent,
};
