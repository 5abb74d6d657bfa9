//! In-memory store implementations.
//!
//! Used by tests and by embedders that keep images in process. Each store
//! guards its maps with a single lock, so every call is atomic.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use a3s_delta_core::error::{DeltaError, Result};
use a3s_delta_core::{
    Digest, Image, ImageId, ImageStore, LayerInfo, LayerReader, LayerStore, ReferenceStore,
    RegisteredLayer,
};
use async_trait::async_trait;
use parking_lot::RwLock;

#[derive(Default)]
struct ImageTable {
    images: HashMap<ImageId, Image>,
    parents: HashMap<ImageId, ImageId>,
}

/// Image store backed by a hash map.
#[derive(Default)]
pub struct MemoryImageStore {
    inner: RwLock<ImageTable>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.inner.read().images.contains_key(id)
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn get(&self, id: &ImageId) -> Result<Image> {
        self.inner
            .read()
            .images
            .get(id)
            .cloned()
            .ok_or_else(|| DeltaError::NotFound(format!("image {}", id)))
    }

    async fn create(&self, config: &[u8]) -> Result<ImageId> {
        let image = Image::from_config(config)?;
        let id = image.id().clone();
        self.inner.write().images.entry(id.clone()).or_insert(image);
        Ok(id)
    }

    async fn set_parent(&self, id: &ImageId, parent: &ImageId) -> Result<()> {
        let mut table = self.inner.write();
        for known in [id, parent] {
            if !table.images.contains_key(known) {
                return Err(DeltaError::NotFound(format!("image {}", known)));
            }
        }
        table.parents.insert(id.clone(), parent.clone());
        Ok(())
    }

    async fn parent(&self, id: &ImageId) -> Result<Option<ImageId>> {
        Ok(self.inner.read().parents.get(id).cloned())
    }

    async fn children(&self, id: &ImageId) -> Result<Vec<ImageId>> {
        let table = self.inner.read();
        let mut children: Vec<ImageId> = table
            .parents
            .iter()
            .filter(|(_, parent)| *parent == id)
            .map(|(child, _)| child.clone())
            .collect();
        children.sort();
        Ok(children)
    }
}

struct StoredLayer {
    bytes: Arc<[u8]>,
    references: u32,
}

/// Layer store holding raw layer bytes in memory.
#[derive(Default)]
pub struct MemoryLayerStore {
    layers: RwLock<HashMap<Digest, StoredLayer>>,
}

impl MemoryLayerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, diff_id: &Digest) -> bool {
        self.layers.read().contains_key(diff_id)
    }

    /// Copy of a layer's bytes.
    pub fn bytes(&self, diff_id: &Digest) -> Option<Vec<u8>> {
        self.layers.read().get(diff_id).map(|l| l.bytes.to_vec())
    }

    /// References currently held on a layer; zero when absent.
    pub fn references(&self, diff_id: &Digest) -> u32 {
        self.layers
            .read()
            .get(diff_id)
            .map_or(0, |l| l.references)
    }
}

#[async_trait]
impl LayerStore for MemoryLayerStore {
    async fn get(&self, diff_id: &Digest) -> Result<Option<LayerInfo>> {
        Ok(self.layers.read().get(diff_id).map(|l| LayerInfo {
            diff_id: diff_id.clone(),
            size: l.bytes.len() as u64,
        }))
    }

    async fn open(&self, diff_id: &Digest) -> Result<Box<dyn LayerReader>> {
        let bytes = self
            .layers
            .read()
            .get(diff_id)
            .map(|l| l.bytes.clone())
            .ok_or_else(|| DeltaError::NotFound(format!("layer {}", diff_id)))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn register(&self, data: Vec<u8>) -> Result<RegisteredLayer> {
        let diff_id = Digest::sha256(&data);
        let size = data.len() as u64;
        let mut layers = self.layers.write();
        let created = !layers.contains_key(&diff_id);
        let layer = layers.entry(diff_id.clone()).or_insert_with(|| StoredLayer {
            bytes: Arc::from(data),
            references: 0,
        });
        layer.references += 1;
        Ok(RegisteredLayer {
            info: LayerInfo { diff_id, size },
            created,
            references: layer.references,
        })
    }

    async fn release(&self, diff_id: &Digest) -> Result<()> {
        let mut layers = self.layers.write();
        if let Some(layer) = layers.get_mut(diff_id) {
            layer.references = layer.references.saturating_sub(1);
            if layer.references == 0 {
                layers.remove(diff_id);
            }
        }
        Ok(())
    }
}

/// Name → id map.
#[derive(Default)]
pub struct MemoryReferenceStore {
    tags: RwLock<HashMap<String, ImageId>>,
}

impl MemoryReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReferenceStore for MemoryReferenceStore {
    async fn get(&self, name: &str) -> Result<ImageId> {
        self.tags
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DeltaError::NotFound(format!("reference {}", name)))
    }

    async fn add_tag(&self, name: &str, id: &ImageId) -> Result<()> {
        self.tags.write().insert(name.to_string(), id.clone());
        Ok(())
    }
}
