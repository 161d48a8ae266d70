//! Nearest-identity matching of a probe embedding against the store.

use crate::store::Store;
use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Distance metric used to compare embeddings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `1 - cosine_similarity`, in [0, 2].
    #[default]
    Cosine,
    /// L2 distance.
    Euclidean,
}

impl Metric {
    pub fn distance(self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            Metric::Cosine => 1.0 - a.similarity(b),
            Metric::Euclidean => a.euclidean_distance(b),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
        })
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            other => Err(format!("unknown metric {other:?} (expected cosine or euclidean)")),
        }
    }
}

/// Confidence derived from a distance: `1 - distance`, clamped to [0, 1].
pub fn confidence_from_distance(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Result of matching a probe embedding against the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Name of the matched identity (if any).
    pub name: Option<String>,
    /// Distance to the closest candidate; `None` when nothing was comparable.
    pub distance: Option<f32>,
    /// Derived confidence of the match; 0.0 when unmatched.
    pub confidence: f32,
}

impl MatchResult {
    pub fn no_match(distance: Option<f32>) -> Self {
        Self {
            matched: false,
            name: None,
            distance,
            confidence: 0.0,
        }
    }
}

/// Linear-scan matcher with a configurable metric and acceptance threshold.
///
/// A candidate is accepted when its distance is strictly below `threshold`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchEngine {
    pub metric: Metric,
    pub threshold: f32,
}

impl MatchEngine {
    pub fn new(metric: Metric, threshold: f32) -> Self {
        Self { metric, threshold }
    }

    /// Scan every stored embedding and return the closest identity if it
    /// clears the threshold.
    ///
    /// Candidates whose dimensionality differs from the probe are skipped.
    /// On equal distances the first candidate in scan order wins.
    pub fn find_match(&self, probe: &Embedding, store: &Store) -> MatchResult {
        let mut best: Option<(&str, f32)> = None;
        let mut skipped = 0usize;

        for (name, candidate) in store.entries() {
            if candidate.dim() != probe.dim() {
                skipped += 1;
                continue;
            }
            let distance = self.metric.distance(probe, candidate);
            if distance.is_nan() {
                skipped += 1;
                continue;
            }
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((name, distance));
            }
        }

        if skipped > 0 {
            tracing::debug!(
                skipped,
                probe_dim = probe.dim(),
                "skipped incomparable store entries"
            );
        }

        match best {
            Some((name, distance)) if distance < self.threshold => MatchResult {
                matched: true,
                name: Some(name.to_string()),
                distance: Some(distance),
                confidence: confidence_from_distance(distance),
            },
            Some((_, distance)) => MatchResult::no_match(Some(distance)),
            None => MatchResult::no_match(None),
        }
    }
}
