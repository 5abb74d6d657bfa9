//! A3S Delta Core - Foundational Types and Abstractions
//!
//! Digests, image metadata, store capability traits, configuration and the
//! error taxonomy shared by the image delta engine.

pub mod config;
pub mod digest;
pub mod error;
pub mod image;
pub mod log;
pub mod store;

// Re-export commonly used types
pub use config::{CodecConfig, DeltaConfig, LogLevel};
pub use digest::{Digest, DigestWriter};
pub use error::{DeltaError, Result};
pub use image::{Image, ImageConfig, ImageId, Platform, RootFs};
pub use store::{
    ImageStore, LayerInfo, LayerReader, LayerStore, LayerStores, ReferenceStore, RegisteredLayer,
};

/// A3S Delta version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
