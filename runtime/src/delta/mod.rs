//! Image delta engine.
//!
//! A delta carries the difference between a base image and a target image:
//! layers the receiver already holds are referenced, layers that replace a
//! base layer at the same position are shipped as binary patches, and the
//! rest are shipped whole. [`DeltaEngine::delta_create`] streams such an
//! artifact; [`DeltaEngine::apply`] rebuilds the target from it.

pub mod applier;
pub mod artifact;
pub mod assembler;
pub mod codec;
pub mod matcher;
pub mod resolver;

use std::sync::Arc;

use a3s_delta_core::error::Result;
use a3s_delta_core::{DeltaConfig, ImageId, ImageStore, LayerStores, ReferenceStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::metrics::{BuildSample, MetricsCollector};

pub use artifact::{DeltaManifest, ManifestEntry};
pub use assembler::{DeltaReport, LABEL_BASE, LABEL_DIGEST, LABEL_TARGET};
pub use codec::{Patch, PatchCodec, PatchHeader, PatchStats};
pub use matcher::{match_layers, MatchResult, MatchSummary};
pub use resolver::{resolve_reference, ChainResolver, LayerChain, LayerRef};

/// Stores a build reads from and tags into.
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    pub images: &'a dyn ImageStore,
    pub references: &'a dyn ReferenceStore,
    pub layer_stores: &'a LayerStores,
}

impl<'a> BuildContext<'a> {
    pub fn new(
        images: &'a dyn ImageStore,
        references: &'a dyn ReferenceStore,
        layer_stores: &'a LayerStores,
    ) -> Self {
        Self {
            images,
            references,
            layer_stores,
        }
    }
}

/// Stores an apply registers into.
#[derive(Clone, Copy)]
pub struct ApplyContext<'a> {
    pub images: &'a dyn ImageStore,
    pub layer_stores: &'a LayerStores,
}

impl<'a> ApplyContext<'a> {
    pub fn new(images: &'a dyn ImageStore, layer_stores: &'a LayerStores) -> Self {
        Self {
            images,
            layer_stores,
        }
    }
}

/// Options for a single build.
#[derive(Debug, Clone, Default)]
pub struct DeltaOptions {
    /// Name to register the finished delta under
    pub tag: Option<String>,
}

impl DeltaOptions {
    pub fn tagged(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
        }
    }
}

/// Builds and applies image deltas.
pub struct DeltaEngine {
    config: DeltaConfig,
    codec: PatchCodec,
    metrics: Arc<MetricsCollector>,
}

impl DeltaEngine {
    /// Create an engine, rejecting invalid configuration.
    pub fn new(config: DeltaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            codec: PatchCodec::new(config.codec.clone()),
            config,
            metrics: Arc::new(MetricsCollector::new()),
        })
    }

    /// Share an existing metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &DeltaConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Build a delta from `source` to `target`, streaming it into `sink`.
    ///
    /// When `options.tag` is set, the tag is registered only after the whole
    /// artifact, trailer included, has been written.
    pub async fn delta_create<W: AsyncWrite + Unpin + Send>(
        &self,
        ctx: &BuildContext<'_>,
        source: &ImageId,
        target: &ImageId,
        options: &DeltaOptions,
        sink: W,
        cancel: &CancellationToken,
    ) -> Result<DeltaReport> {
        let result = self
            .build(ctx, source, target, options, sink, cancel)
            .await;

        match &result {
            Ok(report) => {
                self.metrics
                    .record_build(BuildSample {
                        reused: report.summary.unchanged as u64,
                        patched: report.summary.diffable as u64,
                        full: report.summary.new as u64,
                        artifact_bytes: report.artifact_bytes,
                        target_bytes: report.target_bytes,
                        patch: report.patch_stats,
                    })
                    .await;
                tracing::info!(
                    base = %source,
                    target = %target,
                    reused = report.summary.unchanged,
                    patched = report.summary.diffable,
                    full = report.summary.new,
                    artifact_bytes = report.artifact_bytes,
                    ratio = report.ratio().unwrap_or_default(),
                    "Delta created"
                );
            }
            Err(e) => {
                self.metrics.record_build_failure().await;
                tracing::warn!(base = %source, target = %target, error = %e, "Delta build failed");
            }
        }
        result
    }

    async fn build<W: AsyncWrite + Unpin + Send>(
        &self,
        ctx: &BuildContext<'_>,
        source: &ImageId,
        target: &ImageId,
        options: &DeltaOptions,
        sink: W,
        cancel: &CancellationToken,
    ) -> Result<DeltaReport> {
        let mut report = assembler::assemble(
            ctx,
            &self.codec,
            self.config.max_parallel_diffs,
            source,
            target,
            sink,
            cancel,
        )
        .await?;

        if let Some(tag) = &options.tag {
            let platform = ctx.images.get(target).await?.platform().clone();
            report.descriptor = Some(
                assembler::register_tag(ctx.images, ctx.references, &platform, &report, tag)
                    .await?,
            );
        }
        Ok(report)
    }

    /// Rebuild the target image described by `artifact`, returning its id.
    pub async fn apply<R: AsyncRead + Unpin + Send>(
        &self,
        ctx: &ApplyContext<'_>,
        artifact: R,
        cancel: &CancellationToken,
    ) -> Result<ImageId> {
        match applier::apply(ctx, &self.codec, artifact, cancel).await {
            Ok(id) => {
                self.metrics.record_apply().await;
                tracing::info!(image = %id, "Delta applied");
                Ok(id)
            }
            Err(e) => {
                self.metrics.record_apply_failure().await;
                tracing::warn!(error = %e, "Delta apply failed");
                Err(e)
            }
        }
    }
}

impl Default for DeltaEngine {
    fn default() -> Self {
        Self {
            config: DeltaConfig::default(),
            codec: PatchCodec::default(),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }
}
