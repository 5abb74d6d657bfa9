//! Delta engine metrics

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::delta::codec::PatchStats;

/// Snapshot of engine activity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaMetrics {
    /// Time since the collector was created (seconds)
    pub uptime_seconds: u64,

    /// Completed builds
    pub builds: u64,

    /// Completed applies
    pub applies: u64,

    /// Builds that returned an error
    pub build_failures: u64,

    /// Applies that returned an error
    pub apply_failures: u64,

    /// Layers encoded as patches
    pub patched_layers: u64,

    /// Layers shipped whole
    pub full_layers: u64,

    /// Layers referenced without a blob
    pub reused_layers: u64,

    /// Artifact bytes of builds whose target size was known
    pub artifact_bytes: u64,

    /// Target image bytes of those builds
    pub target_bytes: u64,

    /// Source bytes reused via patch copies
    pub copy_bytes: u64,

    /// Bytes carried as patch literals
    pub literal_bytes: u64,
}

impl DeltaMetrics {
    /// Target bytes per artifact byte over all builds with known sizes.
    pub fn overall_ratio(&self) -> Option<f64> {
        (self.artifact_bytes > 0 && self.target_bytes > 0)
            .then(|| self.target_bytes as f64 / self.artifact_bytes as f64)
    }
}

/// Per-build figures fed into the collector
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildSample {
    pub reused: u64,
    pub patched: u64,
    pub full: u64,
    pub artifact_bytes: u64,
    pub target_bytes: Option<u64>,
    pub patch: PatchStats,
}

/// Metrics collector
pub struct MetricsCollector {
    metrics: Arc<RwLock<DeltaMetrics>>,
    start_time: chrono::DateTime<chrono::Utc>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(DeltaMetrics::default())),
            start_time: chrono::Utc::now(),
        }
    }

    /// Get current metrics
    pub async fn snapshot(&self) -> DeltaMetrics {
        let mut metrics = self.metrics.read().await.clone();
        metrics.uptime_seconds = (chrono::Utc::now() - self.start_time)
            .num_seconds()
            .max(0) as u64;
        metrics
    }

    pub async fn record_build(&self, sample: BuildSample) {
        let mut metrics = self.metrics.write().await;
        metrics.builds += 1;
        metrics.reused_layers += sample.reused;
        metrics.patched_layers += sample.patched;
        metrics.full_layers += sample.full;
        metrics.copy_bytes += sample.patch.copy_bytes;
        metrics.literal_bytes += sample.patch.literal_bytes;
        if let Some(target) = sample.target_bytes {
            metrics.target_bytes += target;
            metrics.artifact_bytes += sample.artifact_bytes;
        }
    }

    pub async fn record_build_failure(&self) {
        self.metrics.write().await.build_failures += 1;
    }

    pub async fn record_apply(&self) {
        self.metrics.write().await.applies += 1;
    }

    pub async fn record_apply_failure(&self) {
        self.metrics.write().await.apply_failures += 1;
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
