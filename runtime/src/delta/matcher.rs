//! Position-aligned layer matching.
//!
//! Both chains are walked from the root. The common prefix of identical
//! digests is `Unchanged`. From the first divergence on, each target layer is
//! paired with the source layer at the same position (`Diffable`) or, past the
//! end of the source chain, has no counterpart (`New`). Chains that do not
//! even share their root layer are unrelated and every target layer is `New`.
//! There is no content search across positions.

use serde::Serialize;

use super::resolver::{LayerChain, LayerRef};

/// Classification of one target layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchResult {
    /// Identical to this source layer; the receiver already holds it.
    Unchanged(LayerRef),
    /// Encode as a patch against this source layer.
    Diffable(LayerRef),
    /// Ship in full.
    New,
}

impl MatchResult {
    pub fn source(&self) -> Option<&LayerRef> {
        match self {
            MatchResult::Unchanged(r) | MatchResult::Diffable(r) => Some(r),
            MatchResult::New => None,
        }
    }
}

/// Per-class counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchSummary {
    pub unchanged: usize,
    pub diffable: usize,
    pub new: usize,
}

impl MatchSummary {
    pub fn of(results: &[MatchResult]) -> Self {
        results.iter().fold(Self::default(), |mut s, r| {
            match r {
                MatchResult::Unchanged(_) => s.unchanged += 1,
                MatchResult::Diffable(_) => s.diffable += 1,
                MatchResult::New => s.new += 1,
            }
            s
        })
    }

    /// Whether any layer content has to be read to build the delta.
    pub fn needs_layer_content(&self) -> bool {
        self.diffable + self.new > 0
    }
}

/// Classify every target layer; the result has one entry per target layer.
pub fn match_layers(source: &LayerChain, target: &LayerChain) -> Vec<MatchResult> {
    let common = source
        .layers()
        .iter()
        .zip(target.layers())
        .take_while(|(s, t)| s.digest == t.digest)
        .count();

    (0..target.len())
        .map(|i| match source.get(i) {
            Some(s) if i < common => MatchResult::Unchanged(s.clone()),
            Some(s) if common > 0 => MatchResult::Diffable(s.clone()),
            _ => MatchResult::New,
        })
        .collect()
}
