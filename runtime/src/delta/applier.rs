//! Rebuilding a target image from a delta artifact.
//!
//! The local store is assumed, not trusted, to hold the base image: every
//! reused layer and every patch source is checked before use. Each layer the
//! artifact carries is registered as its entry is processed, taking a
//! reference on it. A failing apply drops exactly the references it took, so
//! a layer another apply registered meanwhile stays in place. The image
//! itself is created only after the trailer has been verified.

use std::sync::Arc;

use a3s_delta_core::error::{DeltaError, Result};
use a3s_delta_core::{Digest, Image, ImageId, LayerStore};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use super::artifact::{ArtifactReader, BlobFrame, DeltaManifest, ManifestEntry};
use super::codec::PatchCodec;
use super::ApplyContext;

fn corrupt(msg: impl Into<String>) -> DeltaError {
    DeltaError::CorruptArtifact(msg.into())
}

/// Check the shipped config against the manifest before touching any store.
fn validate(manifest: &DeltaManifest, config: &[u8]) -> Result<Image> {
    let image = Image::from_config(config)
        .map_err(|e| corrupt(format!("invalid image config: {}", e)))?;

    if image.id() != &manifest.target {
        return Err(corrupt(format!(
            "config hashes to {}, manifest names {}",
            image.id(),
            manifest.target
        )));
    }
    if !image.diff_ids().iter().eq(manifest.diff_ids()) {
        return Err(corrupt("config layers do not match manifest entries"));
    }
    if !image.platform().shares_store_with(&manifest.platform) {
        return Err(corrupt(format!(
            "config platform {} does not match manifest platform {}",
            image.platform(),
            manifest.platform
        )));
    }
    Ok(image)
}

struct LayerApplier<'a> {
    store: Arc<dyn LayerStore>,
    codec: &'a PatchCodec,
    cancel: &'a CancellationToken,
    /// References this apply holds, in registration order
    registered: Vec<Digest>,
}

impl LayerApplier<'_> {
    async fn require_local(&self, digest: &Digest) -> Result<()> {
        match self.store.get(digest).await? {
            Some(_) => Ok(()),
            None => Err(DeltaError::MissingBaseLayer(digest.to_string())),
        }
    }

    async fn register(&mut self, data: Vec<u8>, expected: &Digest) -> Result<()> {
        let registered = self.store.register(data).await?;
        self.registered.push(registered.info.diff_id.clone());
        if &registered.info.diff_id != expected {
            return Err(corrupt(format!(
                "layer content hashes to {}, expected {}",
                registered.info.diff_id, expected
            )));
        }
        Ok(())
    }

    async fn apply_entry<R: AsyncRead + Unpin>(
        &mut self,
        entry: &ManifestEntry,
        reader: &mut ArtifactReader<R>,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DeltaError::Cancelled);
        }

        match entry {
            ManifestEntry::ReusedRef { digest } => self.require_local(digest).await,
            ManifestEntry::PatchBlob {
                digest,
                source,
                size,
            } => {
                let patch = match reader.next_blob().await? {
                    BlobFrame::Patch(patch) => patch,
                    BlobFrame::Full { .. } => {
                        return Err(corrupt(format!("expected patch frame for {}", digest)))
                    }
                };
                let header = &patch.header;
                if &header.target_digest != digest
                    || &header.source_digest != source
                    || header.target_size != *size
                {
                    return Err(corrupt(format!(
                        "patch frame does not match manifest entry {}",
                        digest
                    )));
                }

                self.require_local(source).await?;
                let source_reader = self.store.open(source).await?;
                let codec = self.codec.clone();
                let cancel = self.cancel.clone();
                let data = tokio::task::spawn_blocking(move || {
                    codec.decode_to_vec(&patch, source_reader, &cancel)
                })
                .await??;

                tracing::debug!(source = %source, digest = %digest, size_bytes = data.len(), "Applied layer patch");
                self.register(data, digest).await
            }
            ManifestEntry::FullBlob { digest, size } => {
                let (frame_digest, data) = match reader.next_blob().await? {
                    BlobFrame::Full { digest, data } => (digest, data),
                    BlobFrame::Patch(_) => {
                        return Err(corrupt(format!("expected full frame for {}", digest)))
                    }
                };
                if &frame_digest != digest || data.len() as u64 != *size {
                    return Err(corrupt(format!(
                        "full frame does not match manifest entry {}",
                        digest
                    )));
                }

                tracing::debug!(digest = %digest, size_bytes = size, "Registering full layer");
                self.register(data, digest).await
            }
        }
    }

    /// Drop every reference this apply took, newest first.
    async fn rollback(&mut self) {
        while let Some(digest) = self.registered.pop() {
            if let Err(e) = self.store.release(&digest).await {
                tracing::warn!(digest = %digest, error = %e, "Failed to release layer during rollback");
            }
        }
    }
}

/// Consume `artifact` and register the target image it describes.
pub(crate) async fn apply<R: AsyncRead + Unpin + Send>(
    ctx: &ApplyContext<'_>,
    codec: &PatchCodec,
    artifact: R,
    cancel: &CancellationToken,
) -> Result<ImageId> {
    let mut reader = ArtifactReader::open(artifact).await?;
    let manifest = reader.manifest().clone();
    let image = validate(&manifest, reader.config())?;
    let store = ctx.layer_stores.require(image.platform())?;

    let mut layers = LayerApplier {
        store,
        codec,
        cancel,
        registered: Vec::new(),
    };

    let mut outcome = Ok(());
    for entry in &manifest.entries {
        outcome = layers.apply_entry(entry, &mut reader).await;
        if outcome.is_err() {
            break;
        }
    }
    if outcome.is_ok() {
        outcome = reader.finish().await.map(|_| ());
    }
    let id = match outcome {
        Ok(()) => ctx.images.create(image.raw_config()).await,
        Err(e) => Err(e),
    };

    let id = match id {
        Ok(id) => id,
        Err(e) => {
            layers.rollback().await;
            return Err(e);
        }
    };

    // The parent link is informational; the image is complete without it.
    if ctx.images.get(&manifest.base).await.is_ok() {
        if let Err(e) = ctx.images.set_parent(&id, &manifest.base).await {
            tracing::warn!(image = %id, base = %manifest.base, error = %e, "Failed to record image parent");
        }
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use a3s_delta_core::Platform;

    fn manifest_for(config: &[u8], entries: Vec<ManifestEntry>) -> DeltaManifest {
        DeltaManifest {
            base: Digest::sha256(b"base"),
            target: Digest::sha256(config),
            platform: Platform::new("linux", "amd64"),
            entries,
        }
    }

    fn config(diff_ids: &[&str]) -> Vec<u8> {
        serde_json::json!({
            "os": "linux",
            "architecture": "amd64",
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_validate_accepts_consistent_manifest() {
        let raw = config(&["faked:a"]);
        let m = manifest_for(
            &raw,
            vec![ManifestEntry::ReusedRef {
                digest: Digest::parse("faked:a").unwrap(),
            }],
        );
        assert!(validate(&m, &raw).is_ok());
    }

    #[test]
    fn test_validate_rejects_layer_mismatch() {
        let raw = config(&["faked:a", "faked:b"]);
        let m = manifest_for(
            &raw,
            vec![ManifestEntry::ReusedRef {
                digest: Digest::parse("faked:a").unwrap(),
            }],
        );
        assert!(matches!(
            validate(&m, &raw),
            Err(DeltaError::CorruptArtifact(_))
        ));
    }

    #[test]
    fn test_validate_rejects_wrong_target_id() {
        let raw = config(&[]);
        let mut m = manifest_for(&raw, vec![]);
        m.target = Digest::sha256(b"something else");
        assert!(matches!(
            validate(&m, &raw),
            Err(DeltaError::CorruptArtifact(_))
        ));
    }

    #[test]
    fn test_validate_rejects_platform_mismatch() {
        let raw = config(&[]);
        let mut m = manifest_for(&raw, vec![]);
        m.platform = Platform::new("linux", "arm64");
        assert!(validate(&m, &raw).is_err());
    }
}
