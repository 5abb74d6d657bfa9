//! Store capabilities consumed by the delta engine.
//!
//! The engine never owns image, layer or reference storage. It talks to
//! these traits, and each implementation is responsible for serializing its
//! own writes: every call is treated as atomic on return.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Seek};
use std::sync::Arc;

use async_trait::async_trait;

use crate::digest::Digest;
use crate::error::{DeltaError, Result};
use crate::image::{Image, ImageId, Platform};

/// Seekable reader over raw layer content.
pub trait LayerReader: Read + Seek + Send {}

impl<T: Read + Seek + Send> LayerReader for T {}

/// Layer as reported by a layer store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub diff_id: Digest,
    pub size: u64,
}

/// Outcome of registering layer content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredLayer {
    pub info: LayerInfo,
    /// `false` when the store already held identical content.
    pub created: bool,
    /// References held on the layer after this registration
    pub references: u32,
}

/// Image metadata storage.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Look up an image; unknown ids fail with `NotFound`.
    async fn get(&self, id: &ImageId) -> Result<Image>;

    /// Register an image from raw config bytes, returning its id.
    ///
    /// Either the whole image becomes visible or nothing does. Creating an
    /// image that already exists returns the existing id.
    async fn create(&self, config: &[u8]) -> Result<ImageId>;

    async fn set_parent(&self, id: &ImageId, parent: &ImageId) -> Result<()>;

    async fn parent(&self, id: &ImageId) -> Result<Option<ImageId>>;

    async fn children(&self, id: &ImageId) -> Result<Vec<ImageId>>;
}

/// Content-addressed layer storage for a single platform.
#[async_trait]
pub trait LayerStore: Send + Sync {
    /// Look up a layer by diffID; `None` when absent.
    async fn get(&self, diff_id: &Digest) -> Result<Option<LayerInfo>>;

    /// Open a layer's raw content; absent layers fail with `NotFound`.
    async fn open(&self, diff_id: &Digest) -> Result<Box<dyn LayerReader>>;

    /// Store raw layer bytes, returning the diffID they hash to.
    ///
    /// Every successful call takes one reference on the layer, whether or not
    /// the content was already present.
    async fn register(&self, data: Vec<u8>) -> Result<RegisteredLayer>;

    /// Drop one reference taken by [`register`](Self::register).
    ///
    /// The content is removed only when its last reference goes. Releasing an
    /// absent layer is a no-op.
    async fn release(&self, diff_id: &Digest) -> Result<()>;
}

/// Name → image id mapping.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Resolve a name; unknown names fail with `NotFound`.
    async fn get(&self, name: &str) -> Result<ImageId>;

    /// Point `name` at `id`, replacing any previous association.
    async fn add_tag(&self, name: &str, id: &ImageId) -> Result<()>;
}

/// Per-platform layer store selection, passed explicitly into each call.
#[derive(Clone, Default)]
pub struct LayerStores {
    stores: HashMap<Platform, Arc<dyn LayerStore>>,
}

impl LayerStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, platform: Platform, store: Arc<dyn LayerStore>) -> Self {
        self.insert(platform, store);
        self
    }

    pub fn insert(&mut self, platform: Platform, store: Arc<dyn LayerStore>) {
        self.stores.insert(platform.store_key(), store);
    }

    pub fn get(&self, platform: &Platform) -> Option<Arc<dyn LayerStore>> {
        self.stores.get(&platform.store_key()).cloned()
    }

    /// Like [`get`](Self::get) but a missing store is an error.
    pub fn require(&self, platform: &Platform) -> Result<Arc<dyn LayerStore>> {
        self.get(platform)
            .ok_or_else(|| DeltaError::NotFound(format!("no layer store for platform {}", platform)))
    }

    pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
        self.stores.keys()
    }
}

impl fmt::Debug for LayerStores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerStores")
            .field("platforms", &self.stores.keys().collect::<Vec<_>>())
            .finish()
    }
}
