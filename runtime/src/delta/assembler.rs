//! Delta construction: resolve, match, encode and stream.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::Arc;

use a3s_delta_core::error::{DeltaError, Result};
use a3s_delta_core::{Digest, ImageId, ImageStore, LayerReader, LayerStore, Platform, ReferenceStore};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::artifact::{ArtifactWriter, DeltaManifest, ManifestEntry};
use super::codec::{Patch, PatchCodec, PatchStats};
use super::matcher::{match_layers, MatchResult, MatchSummary};
use super::resolver::{ChainResolver, LayerChain, LayerRef};
use super::BuildContext;

/// Label keys on a delta descriptor image.
pub const LABEL_BASE: &str = "io.a3s.delta.base";
pub const LABEL_TARGET: &str = "io.a3s.delta.target";
pub const LABEL_DIGEST: &str = "io.a3s.delta.digest";

const CHUNK_LEN: usize = 256 * 1024;
const CHUNK_QUEUE: usize = 4;

/// Outcome of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct DeltaReport {
    pub base: ImageId,
    pub target: ImageId,
    pub entries: Vec<ManifestEntry>,
    pub summary: MatchSummary,
    pub patch_stats: PatchStats,
    /// Raw size of the target's layers; unknown when no layer content was read
    pub target_bytes: Option<u64>,
    pub artifact_bytes: u64,
    pub artifact_digest: Digest,
    /// Descriptor image registered under the requested tag
    pub descriptor: Option<ImageId>,
}

impl DeltaReport {
    /// Target bytes per artifact byte.
    pub fn ratio(&self) -> Option<f64> {
        let target = self.target_bytes?;
        (self.artifact_bytes > 0).then(|| target as f64 / self.artifact_bytes as f64)
    }
}

enum BlobJob {
    Patch {
        source: Digest,
        source_size: u64,
        target: Digest,
    },
    Full {
        digest: Digest,
        size: u64,
    },
}

enum Prepared {
    Patch(Patch, PatchStats),
    Full {
        digest: Digest,
        size: u64,
        reader: Box<dyn LayerReader>,
    },
}

struct Plan {
    entries: Vec<ManifestEntry>,
    jobs: Vec<BlobJob>,
    target_bytes: Option<u64>,
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(DeltaError::Cancelled);
    }
    Ok(())
}

fn required_size(layer: &LayerRef) -> Result<u64> {
    layer
        .size
        .ok_or_else(|| DeltaError::NotFound(format!("layer {}", layer.digest)))
}

/// Turn match results into manifest entries and the blob work they need.
///
/// `sized` chains carry sizes from the layer store. Unchanged-only builds
/// skip the store and report no target size.
fn plan(
    source: &LayerChain,
    target: &LayerChain,
    matches: &[MatchResult],
    sized: bool,
) -> Result<Plan> {
    let mut entries = Vec::with_capacity(matches.len());
    let mut jobs = Vec::new();
    let mut target_bytes = sized.then_some(0u64);

    for (layer, matched) in target.layers().iter().zip(matches) {
        let digest = layer.digest.clone();
        match matched {
            MatchResult::Unchanged(_) => {
                target_bytes = target_bytes.zip(layer.size).map(|(a, b)| a + b);
                entries.push(ManifestEntry::ReusedRef { digest });
            }
            MatchResult::Diffable(base) => {
                let size = required_size(layer)?;
                let base = source.get(base.position).unwrap_or(base);
                let source_size = required_size(base)?;
                target_bytes = target_bytes.map(|total| total + size);
                entries.push(ManifestEntry::PatchBlob {
                    digest: digest.clone(),
                    source: base.digest.clone(),
                    size,
                });
                jobs.push(BlobJob::Patch {
                    source: base.digest.clone(),
                    source_size,
                    target: digest,
                });
            }
            MatchResult::New => {
                let size = required_size(layer)?;
                target_bytes = target_bytes.map(|total| total + size);
                entries.push(ManifestEntry::FullBlob {
                    digest: digest.clone(),
                    size,
                });
                jobs.push(BlobJob::Full { digest, size });
            }
        }
    }

    Ok(Plan {
        entries,
        jobs,
        target_bytes,
    })
}

async fn prepare(
    job: BlobJob,
    store: Arc<dyn LayerStore>,
    codec: PatchCodec,
    cancel: CancellationToken,
) -> Result<Prepared> {
    match job {
        BlobJob::Patch {
            source,
            source_size,
            target,
        } => {
            let source_reader = store.open(&source).await?;
            let target_reader = store.open(&target).await?;
            let (patch, stats) = tokio::task::spawn_blocking(move || {
                codec.encode(source_reader, source_size, target_reader, &cancel)
            })
            .await??;

            for (expected, actual) in [
                (&source, &patch.header.source_digest),
                (&target, &patch.header.target_digest),
            ] {
                if expected != actual {
                    return Err(DeltaError::StoreError(format!(
                        "layer {} content hashes to {}",
                        expected, actual
                    )));
                }
            }

            tracing::debug!(
                source = %source,
                target = %target,
                copy_bytes = stats.copy_bytes,
                literal_bytes = stats.literal_bytes,
                patch_bytes = patch.body.len(),
                "Encoded layer patch"
            );
            Ok(Prepared::Patch(patch, stats))
        }
        BlobJob::Full { digest, size } => {
            let reader = store.open(&digest).await?;
            Ok(Prepared::Full {
                digest,
                size,
                reader,
            })
        }
    }
}

/// Copy a layer into a FULL frame without holding it in memory.
async fn stream_full<W: AsyncWrite + Unpin>(
    writer: &mut ArtifactWriter<W>,
    digest: &Digest,
    size: u64,
    mut reader: Box<dyn LayerReader>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<io::Result<Vec<u8>>>(CHUNK_QUEUE);
    let producer = tokio::task::spawn_blocking(move || loop {
        let mut buf = vec![0u8; CHUNK_LEN];
        let chunk = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => Err(e),
        };
        let failed = chunk.is_err();
        if tx.blocking_send(chunk).is_err() || failed {
            break;
        }
    });

    writer.begin_full(digest, size).await?;
    let mut hasher = Sha256::new();
    while let Some(chunk) = rx.recv().await {
        check_cancel(cancel)?;
        let chunk = chunk?;
        hasher.update(&chunk);
        writer.write_chunk(&chunk).await?;
    }
    producer.await?;
    writer.end_full()?;

    let actual = Digest::from_sha256_bytes(hasher.finalize().into());
    if &actual != digest {
        return Err(DeltaError::StoreError(format!(
            "layer {} content hashes to {}",
            digest, actual
        )));
    }

    tracing::debug!(digest = %digest, size_bytes = size, "Streamed full layer");
    Ok(())
}

/// Build a delta from `source` to `target` and stream it into `sink`.
pub(crate) async fn assemble<W: AsyncWrite + Unpin + Send>(
    ctx: &BuildContext<'_>,
    codec: &PatchCodec,
    max_parallel: usize,
    source: &ImageId,
    target: &ImageId,
    sink: W,
    cancel: &CancellationToken,
) -> Result<DeltaReport> {
    check_cancel(cancel)?;

    let resolver = ChainResolver::new(ctx.images);
    let (source_chain, target_chain) = resolver.resolve_pair(source, target).await?;
    let target_image = ctx.images.get(target).await?;
    let matches = match_layers(&source_chain, &target_chain);
    let summary = MatchSummary::of(&matches);

    tracing::debug!(
        unchanged = summary.unchanged,
        diffable = summary.diffable,
        new = summary.new,
        "Matched layer chains"
    );

    let store = if summary.needs_layer_content() {
        Some(ctx.layer_stores.require(target_chain.platform())?)
    } else {
        None
    };
    let (source_chain, target_chain) = match &store {
        Some(layers) => (
            resolver.resolve_sized(source, layers.as_ref()).await?,
            resolver.resolve_sized(target, layers.as_ref()).await?,
        ),
        None => (source_chain, target_chain),
    };
    let plan = plan(&source_chain, &target_chain, &matches, store.is_some())?;

    let manifest = DeltaManifest {
        base: source.clone(),
        target: target.clone(),
        platform: target_chain.platform().clone(),
        entries: plan.entries,
    };

    let mut writer = ArtifactWriter::new(sink);
    writer
        .write_header(&manifest, target_image.raw_config())
        .await?;

    let mut patch_stats = PatchStats::default();
    if let Some(store) = &store {
        // Encodes still in flight stop once this scope is left.
        let jobs_cancel = cancel.child_token();
        let _abandon = jobs_cancel.clone().drop_guard();
        let mut prepared = stream::iter(plan.jobs)
            .map(|job| prepare(job, Arc::clone(store), codec.clone(), jobs_cancel.clone()))
            .buffered(max_parallel.max(1));

        while let Some(blob) = prepared.next().await {
            check_cancel(cancel)?;
            match blob? {
                Prepared::Patch(patch, stats) => {
                    writer.write_patch(&patch).await?;
                    patch_stats += stats;
                }
                Prepared::Full {
                    digest,
                    size,
                    reader,
                } => stream_full(&mut writer, &digest, size, reader, cancel).await?,
            }
        }
    }

    check_cancel(cancel)?;
    let (_, artifact) = writer.finish().await?;

    Ok(DeltaReport {
        base: source.clone(),
        target: target.clone(),
        entries: manifest.entries,
        summary,
        patch_stats,
        target_bytes: plan.target_bytes,
        artifact_bytes: artifact.bytes,
        artifact_digest: artifact.digest,
        descriptor: None,
    })
}

/// Register a descriptor image for a finished delta and point `tag` at it.
pub(crate) async fn register_tag(
    images: &dyn ImageStore,
    references: &dyn ReferenceStore,
    platform: &Platform,
    report: &DeltaReport,
    tag: &str,
) -> Result<ImageId> {
    let labels: BTreeMap<&str, String> = [
        (LABEL_BASE, report.base.to_string()),
        (LABEL_TARGET, report.target.to_string()),
        (LABEL_DIGEST, report.artifact_digest.to_string()),
    ]
    .into_iter()
    .collect();
    let mut config = serde_json::json!({
        "os": platform.os,
        "architecture": platform.architecture,
        "rootfs": { "type": "layers", "diff_ids": [] },
        "config": { "Labels": labels },
    });
    if let Some(variant) = &platform.variant {
        config["variant"] = serde_json::Value::String(variant.clone());
    }

    let descriptor = images.create(&serde_json::to_vec(&config)?).await?;
    references.add_tag(tag, &descriptor).await?;
    tracing::debug!(tag, descriptor = %descriptor, "Tagged delta descriptor");
    Ok(descriptor)
}
