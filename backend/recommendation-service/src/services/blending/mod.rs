//! Blender
//!
//! Normalizes each strategy's raw scores over the request's candidate pool,
//! fuses them with the variant's weights (renormalized per candidate over the
//! strategies that actually scored it), sorts, truncates and hands the window
//! to the diversity pass.

use crate::error::AppError;
use crate::models::{Candidate, Contribution, RankedItem, ScoredCandidate, StrategyKind};
use crate::services::diversity::DiversityLayer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// `(x - min) / (max - min)`; 0.5 for every candidate when all scores are equal.
    #[default]
    MinMax,
    /// `(x - mean) / std`; 0.0 for every candidate when the deviation is zero.
    ZScore,
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Normalization::MinMax => f.write_str("min_max"),
            Normalization::ZScore => f.write_str("z_score"),
        }
    }
}

/// Weights, normalization and diversity of one blend. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendConfig {
    pub weights: BTreeMap<StrategyKind, f64>,
    pub normalization: Normalization,
    /// Similarity penalty in `[0, 1]`; 0 keeps strict score order.
    pub diversity: f64,
}

impl Default for BlendConfig {
    fn default() -> Self {
        let mut weights = BTreeMap::new();
        weights.insert(StrategyKind::Collaborative, 0.5);
        weights.insert(StrategyKind::ContentBased, 0.3);
        weights.insert(StrategyKind::Popularity, 0.2);

        Self {
            weights,
            normalization: Normalization::MinMax,
            diversity: 0.2,
        }
    }
}

impl BlendConfig {
    pub fn weight(&self, strategy: StrategyKind) -> f64 {
        self.weights.get(&strategy).copied().unwrap_or(0.0)
    }

    pub fn validate(&self, name: &str) -> Result<(), AppError> {
        if let Some((strategy, weight)) = self
            .weights
            .iter()
            .find(|(_, weight)| !weight.is_finite() || **weight < 0.0)
        {
            return Err(AppError::Configuration(format!(
                "blend {}: weight {} for {} must be a non-negative number",
                name, weight, strategy
            )));
        }

        if !self.weights.values().any(|weight| *weight > 0.0) {
            return Err(AppError::Configuration(format!(
                "blend {}: at least one strategy weight must be positive",
                name
            )));
        }

        if !(0.0..=1.0).contains(&self.diversity) {
            return Err(AppError::Configuration(format!(
                "blend {}: diversity {} must be within [0, 1]",
                name, self.diversity
            )));
        }

        Ok(())
    }
}

/// A ranked candidate with its fused score and per-strategy breakdown.
#[derive(Debug, Clone)]
pub struct BlendedCandidate {
    pub candidate: Candidate,
    pub fused_score: f64,
    pub contributions: Vec<Contribution>,
    /// Weights actually applied to this candidate; they sum to 1.
    pub weights: BTreeMap<StrategyKind, f64>,
    pub cold: bool,
}

impl BlendedCandidate {
    pub fn item_id(&self) -> &str {
        &self.candidate.item_id
    }

    pub fn into_ranked_item(self) -> RankedItem {
        RankedItem {
            item_id: self.candidate.item_id,
            score: self.fused_score,
            explanation: self.contributions,
            cold: self.cold,
        }
    }
}

/// Per-strategy statistics over one request's candidate pool.
#[derive(Debug, Clone, Copy)]
struct ScoreStats {
    min: f64,
    max: f64,
    mean: f64,
    std_dev: f64,
}

impl ScoreStats {
    fn from_scores(scores: &[f64]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }

        let n = scores.len() as f64;
        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = scores.iter().sum::<f64>() / n;
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;

        Some(Self {
            min,
            max,
            mean,
            std_dev: variance.sqrt(),
        })
    }

    fn normalize(&self, method: Normalization, score: f64) -> f64 {
        match method {
            Normalization::MinMax => {
                let range = self.max - self.min;
                if range <= f64::EPSILON {
                    0.5
                } else {
                    (score - self.min) / range
                }
            }
            Normalization::ZScore => {
                if self.std_dev <= f64::EPSILON {
                    0.0
                } else {
                    (score - self.mean) / self.std_dev
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Blender;

impl Blender {
    pub fn new() -> Self {
        Self
    }

    /// Fuse, order and diversify. Candidates without any score are dropped,
    /// so every returned item has at least one contributing strategy.
    pub fn blend(
        &self,
        config: &BlendConfig,
        scored: Vec<ScoredCandidate>,
        list_length: usize,
    ) -> Vec<BlendedCandidate> {
        let stats = strategy_stats(&scored);

        let mut blended: Vec<BlendedCandidate> = scored
            .into_iter()
            .filter(ScoredCandidate::has_any_score)
            .map(|candidate| fuse(config, &stats, candidate))
            .collect();

        blended.sort_by(|a, b| {
            b.fused_score
                .total_cmp(&a.fused_score)
                .then_with(|| a.item_id().cmp(b.item_id()))
        });
        blended.truncate(list_length);

        DiversityLayer::new(config.diversity).rerank(blended)
    }
}

fn strategy_stats(scored: &[ScoredCandidate]) -> BTreeMap<StrategyKind, ScoreStats> {
    let mut columns: BTreeMap<StrategyKind, Vec<f64>> = BTreeMap::new();
    for candidate in scored {
        for (strategy, score) in &candidate.scores {
            columns.entry(*strategy).or_default().push(*score);
        }
    }

    columns
        .into_iter()
        .filter_map(|(strategy, scores)| {
            ScoreStats::from_scores(&scores).map(|stats| (strategy, stats))
        })
        .collect()
}

fn fuse(
    config: &BlendConfig,
    stats: &BTreeMap<StrategyKind, ScoreStats>,
    scored: ScoredCandidate,
) -> BlendedCandidate {
    let configured: f64 = scored.scores.keys().map(|s| config.weight(*s)).sum();

    // Renormalize over the strategies present. If the variant weights none of
    // them, they share the weight equally.
    let weights: BTreeMap<StrategyKind, f64> = scored
        .scores
        .keys()
        .map(|strategy| {
            let weight = if configured > 0.0 {
                config.weight(*strategy) / configured
            } else {
                1.0 / scored.scores.len() as f64
            };
            (*strategy, weight)
        })
        .collect();

    let mut fused_score = 0.0;
    let mut contributions = Vec::with_capacity(scored.scores.len());
    for (strategy, raw) in &scored.scores {
        let normalized = stats
            .get(strategy)
            .map(|s| s.normalize(config.normalization, *raw))
            .unwrap_or(0.5);
        let contribution = weights[strategy] * normalized;
        fused_score += contribution;
        contributions.push(Contribution {
            strategy: *strategy,
            contribution,
        });
    }

    BlendedCandidate {
        candidate: scored.candidate,
        fused_score,
        contributions,
        weights,
        cold: scored.cold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(item_id: &str, scores: &[(StrategyKind, f64)]) -> ScoredCandidate {
        let mut scored = ScoredCandidate::new(Candidate::without_features(item_id));
        scored.scores.extend(scores.iter().copied());
        scored
    }

    fn no_diversity() -> BlendConfig {
        BlendConfig {
            diversity: 0.0,
            ..BlendConfig::default()
        }
    }

    #[test]
    fn test_min_max_normalization() {
        let stats = ScoreStats::from_scores(&[2.0, 4.0, 6.0]).unwrap();
        assert_eq!(stats.normalize(Normalization::MinMax, 2.0), 0.0);
        assert_eq!(stats.normalize(Normalization::MinMax, 4.0), 0.5);
        assert_eq!(stats.normalize(Normalization::MinMax, 6.0), 1.0);

        let flat = ScoreStats::from_scores(&[3.0, 3.0]).unwrap();
        assert_eq!(flat.normalize(Normalization::MinMax, 3.0), 0.5);
    }

    #[test]
    fn test_z_score_normalization() {
        let stats = ScoreStats::from_scores(&[1.0, 3.0]).unwrap();
        assert!((stats.normalize(Normalization::ZScore, 3.0) - 1.0).abs() < 1e-9);
        assert!((stats.normalize(Normalization::ZScore, 1.0) + 1.0).abs() < 1e-9);

        let flat = ScoreStats::from_scores(&[5.0]).unwrap();
        assert_eq!(flat.normalize(Normalization::ZScore, 5.0), 0.0);
    }

    #[test]
    fn test_absent_strategy_weights_are_renormalized() {
        let candidates = vec![
            scored(
                "full",
                &[
                    (StrategyKind::Collaborative, 1.0),
                    (StrategyKind::ContentBased, 0.5),
                    (StrategyKind::Popularity, 10.0),
                ],
            ),
            scored("popular-only", &[(StrategyKind::Popularity, 20.0)]),
            scored(
                "no-collab",
                &[(StrategyKind::ContentBased, 0.9), (StrategyKind::Popularity, 5.0)],
            ),
        ];

        let blended = Blender::new().blend(&no_diversity(), candidates, 10);
        assert_eq!(blended.len(), 3);

        for item in &blended {
            let total: f64 = item.weights.values().sum();
            assert!((total - 1.0).abs() < 1e-9, "{} weights sum to {}", item.item_id(), total);
        }

        let popular_only = blended.iter().find(|b| b.item_id() == "popular-only").unwrap();
        assert_eq!(popular_only.weights[&StrategyKind::Popularity], 1.0);
        // Highest popularity, sole contributor: not penalized for the missing strategies.
        assert_eq!(popular_only.fused_score, 1.0);
        assert_eq!(blended[0].item_id(), "popular-only");
    }

    #[test]
    fn test_unscored_candidates_are_dropped() {
        let candidates = vec![
            scored("ghost", &[]),
            scored("real", &[(StrategyKind::Popularity, 1.0)]),
        ];

        let blended = Blender::new().blend(&no_diversity(), candidates, 10);
        assert_eq!(blended.len(), 1);
        assert_eq!(blended[0].item_id(), "real");
        assert!(!blended[0].contributions.is_empty());
    }

    #[test]
    fn test_ties_break_by_item_id_and_truncate() {
        let candidates = vec![
            scored("c", &[(StrategyKind::Popularity, 1.0)]),
            scored("a", &[(StrategyKind::Popularity, 1.0)]),
            scored("b", &[(StrategyKind::Popularity, 1.0)]),
        ];

        let blended = Blender::new().blend(&no_diversity(), candidates, 2);
        let ids: Vec<&str> = blended.iter().map(|b| b.item_id()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_zero_weighted_strategies_share_weight() {
        let mut config = no_diversity();
        config.weights.insert(StrategyKind::Popularity, 0.0);

        let blended = Blender::new().blend(
            &config,
            vec![scored("a", &[(StrategyKind::Popularity, 3.0)])],
            5,
        );

        assert_eq!(blended[0].weights[&StrategyKind::Popularity], 1.0);
    }

    #[test]
    fn test_validate_rejects_bad_blends() {
        let mut negative = BlendConfig::default();
        negative.weights.insert(StrategyKind::Popularity, -0.1);
        assert!(negative.validate("negative").is_err());

        let mut zero = BlendConfig::default();
        zero.weights.values_mut().for_each(|w| *w = 0.0);
        assert!(zero.validate("zero").is_err());

        let mut wide = BlendConfig::default();
        wide.diversity = f64::NAN;
        assert!(wide.validate("wide").is_err());

        assert!(BlendConfig::default().validate("default").is_ok());
    }
}
