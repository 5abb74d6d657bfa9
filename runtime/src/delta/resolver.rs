//! Image → layer chain resolution.

use a3s_delta_core::error::{DeltaError, Result};
use a3s_delta_core::{Digest, Image, ImageId, ImageStore, LayerStore, Platform, ReferenceStore};
use serde::Serialize;

/// One layer of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerRef {
    /// Content digest (diffID)
    pub digest: Digest,
    /// Raw byte size; `None` when resolved without a layer store
    pub size: Option<u64>,
    /// Zero-based position, root first
    pub position: usize,
}

/// Ordered layers of one image, root first.
///
/// Order comes from the image config and cannot be changed after resolution.
#[derive(Debug, Clone)]
pub struct LayerChain {
    image: ImageId,
    platform: Platform,
    layers: Vec<LayerRef>,
}

impl LayerChain {
    fn from_image(image: &Image) -> Self {
        let layers = image
            .diff_ids()
            .iter()
            .enumerate()
            .map(|(position, digest)| LayerRef {
                digest: digest.clone(),
                size: None,
                position,
            })
            .collect();

        Self {
            image: image.id().clone(),
            platform: image.platform().clone(),
            layers,
        }
    }

    pub fn image_id(&self) -> &ImageId {
        &self.image
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn layers(&self) -> &[LayerRef] {
        &self.layers
    }

    pub fn get(&self, position: usize) -> Option<&LayerRef> {
        self.layers.get(position)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Sum of layer sizes, if every size is known.
    pub fn total_size(&self) -> Option<u64> {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Resolves image ids to layer chains through an image store.
pub struct ChainResolver<'a> {
    images: &'a dyn ImageStore,
}

impl<'a> ChainResolver<'a> {
    pub fn new(images: &'a dyn ImageStore) -> Self {
        Self { images }
    }

    /// Resolve an image's chain from metadata alone; layer sizes stay unset.
    pub async fn resolve(&self, id: &ImageId) -> Result<LayerChain> {
        let image = self.images.get(id).await?;
        Ok(LayerChain::from_image(&image))
    }

    /// Resolve a chain and fill in sizes from `layers`.
    ///
    /// Layers the store does not hold keep `size = None`; presence is only
    /// enforced where content is actually needed.
    pub async fn resolve_sized(&self, id: &ImageId, layers: &dyn LayerStore) -> Result<LayerChain> {
        let mut chain = self.resolve(id).await?;
        for layer in &mut chain.layers {
            layer.size = layers.get(&layer.digest).await?.map(|info| info.size);
        }
        Ok(chain)
    }

    /// Resolve source and target, refusing to pair different platforms.
    pub async fn resolve_pair(
        &self,
        source: &ImageId,
        target: &ImageId,
    ) -> Result<(LayerChain, LayerChain)> {
        let source_chain = self.resolve(source).await?;
        let target_chain = self.resolve(target).await?;

        if !source_chain
            .platform()
            .shares_store_with(target_chain.platform())
        {
            return Err(DeltaError::UnsupportedPlatform {
                base: source_chain.platform().to_string(),
                target: target_chain.platform().to_string(),
            });
        }

        tracing::debug!(
            source = %source,
            target = %target,
            source_layers = source_chain.len(),
            target_layers = target_chain.len(),
            platform = %target_chain.platform(),
            "Resolved layer chains"
        );

        Ok((source_chain, target_chain))
    }
}

/// Turn a user-facing identifier into an image id.
///
/// Names are looked up first; an unknown name that parses as a digest is
/// taken as an image id as-is.
pub async fn resolve_reference(refs: &dyn ReferenceStore, name: &str) -> Result<ImageId> {
    match refs.get(name).await {
        Ok(id) => Ok(id),
        Err(DeltaError::NotFound(_)) => {
            Digest::parse(name).map_err(|_| DeltaError::NotFound(format!("reference {}", name)))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryImageStore, MemoryLayerStore, MemoryReferenceStore};

    fn config(os: &str, arch: &str, diff_ids: &[Digest]) -> Vec<u8> {
        serde_json::json!({
            "os": os,
            "architecture": arch,
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_resolve_keeps_config_order() {
        let images = MemoryImageStore::new();
        let a = Digest::sha256(b"a");
        let b = Digest::sha256(b"b");
        let id = images
            .create(&config("linux", "amd64", &[b.clone(), a.clone()]))
            .await
            .unwrap();

        let chain = ChainResolver::new(&images).resolve(&id).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.layers()[0].digest, b);
        assert_eq!(chain.layers()[1].digest, a);
        assert_eq!(chain.layers()[1].position, 1);
        assert_eq!(chain.total_size(), None);
    }

    #[tokio::test]
    async fn test_resolve_unknown_image() {
        let images = MemoryImageStore::new();
        let err = ChainResolver::new(&images)
            .resolve(&Digest::sha256(b"missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeltaError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_resolve_sized_reads_layer_store() {
        let images = MemoryImageStore::new();
        let layers = MemoryLayerStore::new();
        let present = layers.register(vec![1u8; 42]).await.unwrap().info.diff_id;
        let absent = Digest::sha256(b"not stored");
        let id = images
            .create(&config("linux", "amd64", &[present, absent]))
            .await
            .unwrap();

        let chain = ChainResolver::new(&images)
            .resolve_sized(&id, &layers)
            .await
            .unwrap();
        assert_eq!(chain.layers()[0].size, Some(42));
        assert_eq!(chain.layers()[1].size, None);
    }

    #[tokio::test]
    async fn test_resolve_pair_rejects_cross_platform() {
        let images = MemoryImageStore::new();
        let amd = images.create(&config("linux", "amd64", &[])).await.unwrap();
        let arm = images.create(&config("linux", "arm64", &[])).await.unwrap();

        let err = ChainResolver::new(&images)
            .resolve_pair(&amd, &arm)
            .await
            .unwrap_err();
        assert!(matches!(err, DeltaError::UnsupportedPlatform { .. }));
    }

    #[tokio::test]
    async fn test_resolve_pair_missing_target() {
        let images = MemoryImageStore::new();
        let amd = images.create(&config("linux", "amd64", &[])).await.unwrap();
        let err = ChainResolver::new(&images)
            .resolve_pair(&amd, &Digest::sha256(b"nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeltaError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_resolve_reference() {
        let refs = MemoryReferenceStore::new();
        let id = Digest::sha256(b"image");
        refs.add_tag("busybox:1.29", &id).await.unwrap();

        assert_eq!(resolve_reference(&refs, "busybox:1.29").await.unwrap(), id);
        assert_eq!(resolve_reference(&refs, &id.to_string()).await.unwrap(), id);
        let err = resolve_reference(&refs, "busybox:1.24").await.unwrap_err();
        assert!(err.to_string().contains("busybox:1.24"));
    }
}
