//! A3S Delta Runtime - image delta engine implementation.
//!
//! Layer chain resolution and matching, the binary patch codec, artifact
//! streaming, delta application, and in-memory and on-disk stores.

#![allow(clippy::result_large_err)]

pub mod delta;
pub mod metrics;
pub mod store;

// Re-export common types
pub use delta::{
    ApplyContext, BuildContext, DeltaEngine, DeltaManifest, DeltaOptions, DeltaReport,
    ManifestEntry, MatchResult, PatchCodec,
};
pub use metrics::{DeltaMetrics, MetricsCollector};
pub use store::{
    DiskImageStore, DiskLayerStore, DiskReferenceStore, MemoryImageStore, MemoryLayerStore,
    MemoryReferenceStore,
};

/// A3S Delta Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
