//! Image, layer and reference store implementations.

mod disk;
mod memory;

pub use disk::{DiskImageStore, DiskLayerStore, DiskReferenceStore, LayerMeta};
pub use memory::{MemoryImageStore, MemoryLayerStore, MemoryReferenceStore};
