//! Experiment Router
//!
//! Variant assignment is a pure function of `(experiment_id, user_id)`: a
//! SHA-256 point in `[0, 1)` falls into one of the experiment's cumulative
//! weight ranges. Nothing is stored, so every replica agrees.

use crate::config::BlendingConfig;
use crate::models::ExperimentAssignment;
use crate::services::blending::BlendConfig;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantConfig {
    pub id: String,
    /// Share of users in this variant; an experiment's weights sum to 1.
    pub weight: f64,
    /// Name of the blend this variant ranks with.
    pub blend: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub id: String,
    pub variants: Vec<VariantConfig>,
}

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("unknown experiment: {0}")]
    UnknownExperiment(String),

    #[error("invalid experiment {id}: {reason}")]
    InvalidDefinition { id: String, reason: String },

    #[error("bucket layout of live experiment {0} cannot change; start a new experiment id")]
    LiveBucketChange(String),

    #[error("experiment id {0} was retired and cannot be reused")]
    RetiredExperiment(String),

    #[error("unknown blend {blend} referenced by {referrer}")]
    UnknownBlend { referrer: String, blend: String },
}

/// Deterministic point in `[0, 1)` for a user within an experiment.
pub fn bucket_point(experiment_id: &str, user_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(experiment_id.as_bytes());
    hasher.update(b":");
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    // Top 53 bits give an exactly representable fraction.
    (u64::from_be_bytes(prefix) >> 11) as f64 / (1u64 << 53) as f64
}

#[derive(Debug, Clone)]
struct Bucket {
    variant_id: String,
    blend: String,
    /// Exclusive upper bound of the cumulative range.
    upper: f64,
}

#[derive(Debug, Clone)]
struct CompiledExperiment {
    definition: ExperimentConfig,
    buckets: Vec<Bucket>,
}

impl CompiledExperiment {
    fn compile(
        definition: &ExperimentConfig,
        blends: &HashMap<String, Arc<BlendConfig>>,
    ) -> Result<Self, ExperimentError> {
        let invalid = |reason: String| ExperimentError::InvalidDefinition {
            id: definition.id.clone(),
            reason,
        };

        if definition.id.trim().is_empty() {
            return Err(invalid("experiment id must not be empty".to_string()));
        }
        if definition.variants.is_empty() {
            return Err(invalid("at least one variant is required".to_string()));
        }

        let mut seen = HashSet::new();
        let mut cumulative = 0.0;
        let mut buckets = Vec::with_capacity(definition.variants.len());

        for variant in &definition.variants {
            if !seen.insert(variant.id.as_str()) {
                return Err(invalid(format!("duplicate variant id {}", variant.id)));
            }
            if !variant.weight.is_finite() || variant.weight <= 0.0 {
                return Err(invalid(format!(
                    "variant {} has non-positive weight {}",
                    variant.id, variant.weight
                )));
            }
            if !blends.contains_key(&variant.blend) {
                return Err(ExperimentError::UnknownBlend {
                    referrer: format!("{}/{}", definition.id, variant.id),
                    blend: variant.blend.clone(),
                });
            }

            cumulative += variant.weight;
            buckets.push(Bucket {
                variant_id: variant.id.clone(),
                blend: variant.blend.clone(),
                upper: cumulative,
            });
        }

        if (cumulative - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(invalid(format!(
                "variant weights sum to {}, expected 1",
                cumulative
            )));
        }

        // Absorb rounding so every point in [0, 1) lands in a bucket.
        if let Some(last) = buckets.last_mut() {
            last.upper = 1.0;
        }

        Ok(Self {
            definition: definition.clone(),
            buckets,
        })
    }

    fn bucket_for(&self, user_id: &str) -> &Bucket {
        let point = bucket_point(&self.definition.id, user_id);
        self.buckets
            .iter()
            .find(|bucket| point < bucket.upper)
            .unwrap_or_else(|| &self.buckets[self.buckets.len() - 1])
    }

    fn same_layout(&self, other: &CompiledExperiment) -> bool {
        let layout = |e: &CompiledExperiment| -> Vec<(String, u64)> {
            e.definition
                .variants
                .iter()
                .map(|v| (v.id.clone(), v.weight.to_bits()))
                .collect()
        };
        layout(self) == layout(other)
    }
}

/// Validated experiments and blends. Immutable; replaced as a whole.
#[derive(Debug, Clone)]
pub struct ExperimentCatalog {
    experiments: HashMap<String, CompiledExperiment>,
    blends: HashMap<String, Arc<BlendConfig>>,
    default_blend: String,
}

impl ExperimentCatalog {
    pub fn compile(
        blending: &BlendingConfig,
        experiments: &[ExperimentConfig],
    ) -> Result<Self, ExperimentError> {
        let blends: HashMap<String, Arc<BlendConfig>> = blending
            .blends
            .iter()
            .map(|(name, blend)| (name.clone(), Arc::new(blend.clone())))
            .collect();

        if !blends.contains_key(&blending.default_blend) {
            return Err(ExperimentError::UnknownBlend {
                referrer: "default_blend".to_string(),
                blend: blending.default_blend.clone(),
            });
        }

        let mut compiled = HashMap::with_capacity(experiments.len());
        for definition in experiments {
            let experiment = CompiledExperiment::compile(definition, &blends)?;
            if compiled.insert(definition.id.clone(), experiment).is_some() {
                return Err(ExperimentError::InvalidDefinition {
                    id: definition.id.clone(),
                    reason: "experiment defined more than once".to_string(),
                });
            }
        }

        Ok(Self {
            experiments: compiled,
            blends,
            default_blend: blending.default_blend.clone(),
        })
    }

    pub fn contains(&self, experiment_id: &str) -> bool {
        self.experiments.contains_key(experiment_id)
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }
}

/// The blend a request ranks with, and the assignments that chose it.
#[derive(Debug, Clone)]
pub struct BlendSelection {
    pub assignments: Vec<ExperimentAssignment>,
    pub blend_name: String,
    pub blend: Arc<BlendConfig>,
}

pub struct ExperimentRouter {
    catalog: ArcSwap<ExperimentCatalog>,
    /// Serializes updates and holds the ids of experiments removed by one.
    retired: Mutex<HashSet<String>>,
}

impl ExperimentRouter {
    pub fn new(catalog: ExperimentCatalog) -> Self {
        Self {
            catalog: ArcSwap::from_pointee(catalog),
            retired: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(
        blending: &BlendingConfig,
        experiments: &[ExperimentConfig],
    ) -> Result<Self, ExperimentError> {
        Ok(Self::new(ExperimentCatalog::compile(blending, experiments)?))
    }

    /// Variant of `user_id` in `experiment_id`. Same inputs, same answer.
    pub fn assign(&self, user_id: &str, experiment_id: &str) -> Result<String, ExperimentError> {
        let catalog = self.catalog.load();
        let experiment = catalog
            .experiments
            .get(experiment_id)
            .ok_or_else(|| ExperimentError::UnknownExperiment(experiment_id.to_string()))?;

        Ok(experiment.bucket_for(user_id).variant_id.clone())
    }

    /// Assign the user in every known experiment; the first one picks the blend.
    pub fn select(&self, user_id: &str, experiment_ids: &[String]) -> BlendSelection {
        let catalog = self.catalog.load_full();
        let mut assignments = Vec::new();
        let mut chosen_blend: Option<&str> = None;

        for experiment_id in experiment_ids {
            let Some(experiment) = catalog.experiments.get(experiment_id) else {
                debug!(experiment_id = %experiment_id, "Skipping unknown experiment");
                continue;
            };

            let bucket = experiment.bucket_for(user_id);
            assignments.push(ExperimentAssignment {
                experiment_id: experiment_id.clone(),
                variant_id: bucket.variant_id.clone(),
            });
            chosen_blend.get_or_insert(bucket.blend.as_str());
        }

        let blend_name = chosen_blend.unwrap_or(&catalog.default_blend).to_string();
        // Blend references are checked at compile time.
        let blend = catalog
            .blends
            .get(&blend_name)
            .or_else(|| catalog.blends.get(&catalog.default_blend))
            .cloned()
            .unwrap_or_default();

        BlendSelection {
            assignments,
            blend_name,
            blend,
        }
    }

    /// Swap in a new experiment configuration. Experiments already live must
    /// keep their bucket layout, and ids dropped by an earlier update stay
    /// retired; otherwise the update is rejected and the current catalog stays
    /// active. Concurrent updates are applied one at a time.
    pub fn apply(
        &self,
        blending: &BlendingConfig,
        experiments: &[ExperimentConfig],
    ) -> Result<(), ExperimentError> {
        let next = ExperimentCatalog::compile(blending, experiments)?;

        let mut retired = self
            .retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = self.catalog.load_full();

        for (id, experiment) in &next.experiments {
            if retired.contains(id) {
                warn!(experiment_id = %id, "Rejected reuse of retired experiment id");
                return Err(ExperimentError::RetiredExperiment(id.clone()));
            }
            if let Some(live) = current.experiments.get(id) {
                if !live.same_layout(experiment) {
                    warn!(experiment_id = %id, "Rejected bucket change for live experiment");
                    return Err(ExperimentError::LiveBucketChange(id.clone()));
                }
            }
        }

        let dropped: Vec<String> = current
            .experiments
            .keys()
            .filter(|id| !next.contains(id))
            .cloned()
            .collect();

        info!(
            experiments = next.len(),
            blends = next.blends.len(),
            retired = dropped.len(),
            "Experiment catalog updated"
        );
        retired.extend(dropped);
        self.catalog.store(Arc::new(next));
        Ok(())
    }

    pub fn catalog(&self) -> Arc<ExperimentCatalog> {
        self.catalog.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blending() -> BlendingConfig {
        let mut blending = BlendingConfig::default();
        blending.blends.insert(
            "popularity-heavy".to_string(),
            BlendConfig {
                diversity: 0.0,
                ..BlendConfig::default()
            },
        );
        blending
    }

    fn experiment(id: &str, variants: &[(&str, f64, &str)]) -> ExperimentConfig {
        ExperimentConfig {
            id: id.to_string(),
            variants: variants
                .iter()
                .map(|(variant, weight, blend)| VariantConfig {
                    id: variant.to_string(),
                    weight: *weight,
                    blend: blend.to_string(),
                })
                .collect(),
        }
    }

    fn router() -> ExperimentRouter {
        ExperimentRouter::from_config(
            &blending(),
            &[experiment(
                "homepage",
                &[("control", 0.5, "default"), ("treatment", 0.5, "popularity-heavy")],
            )],
        )
        .unwrap()
    }

    #[test]
    fn test_bucket_point_is_stable_and_in_range() {
        let a = bucket_point("homepage", "user1");
        assert_eq!(a, bucket_point("homepage", "user1"));
        assert!((0.0..1.0).contains(&a));
        assert_ne!(a, bucket_point("other-experiment", "user1"));
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let router = router();
        for i in 0..100 {
            let user = format!("user{}", i);
            let first = router.assign(&user, "homepage").unwrap();
            for _ in 0..5 {
                assert_eq!(router.assign(&user, "homepage").unwrap(), first);
            }
        }
    }

    #[test]
    fn test_assignment_follows_weights() {
        let router = router();
        let treated = (0..10_000)
            .filter(|i| router.assign(&format!("user{}", i), "homepage").unwrap() == "treatment")
            .count();

        // 50/50 split within a generous margin.
        assert!((4_500..5_500).contains(&treated), "treated = {}", treated);
    }

    #[test]
    fn test_select_uses_first_known_experiment() {
        let router = router();
        let selection = router.select(
            "user42",
            &["missing".to_string(), "homepage".to_string()],
        );

        assert_eq!(selection.assignments.len(), 1);
        let variant = &selection.assignments[0].variant_id;
        let expected_blend = if variant == "control" { "default" } else { "popularity-heavy" };
        assert_eq!(selection.blend_name, expected_blend);

        let fallback = router.select("user42", &[]);
        assert_eq!(fallback.blend_name, "default");
        assert!(fallback.assignments.is_empty());
    }

    #[test]
    fn test_invalid_definitions_rejected() {
        let cases = vec![
            experiment("empty", &[]),
            experiment("short", &[("a", 0.5, "default"), ("b", 0.3, "default")]),
            experiment("zero", &[("a", 1.0, "default"), ("b", 0.0, "default")]),
            experiment("dupe", &[("a", 0.5, "default"), ("a", 0.5, "default")]),
            experiment("blend", &[("a", 1.0, "nope")]),
        ];

        for case in cases {
            let id = case.id.clone();
            assert!(
                ExperimentCatalog::compile(&blending(), &[case]).is_err(),
                "{} should be rejected",
                id
            );
        }

        let twice = experiment("twice", &[("a", 1.0, "default")]);
        assert!(ExperimentCatalog::compile(&blending(), &[twice.clone(), twice]).is_err());
    }

    #[test]
    fn test_live_bucket_change_rejected() {
        let router = router();
        let before = router.assign("user7", "homepage").unwrap();

        let reshuffle = experiment(
            "homepage",
            &[("control", 0.9, "default"), ("treatment", 0.1, "popularity-heavy")],
        );
        let result = router.apply(&blending(), &[reshuffle]);
        assert!(matches!(result, Err(ExperimentError::LiveBucketChange(_))));
        assert_eq!(router.assign("user7", "homepage").unwrap(), before);

        // New ids are fine, and the live experiment may be kept as is.
        let unchanged = experiment(
            "homepage",
            &[("control", 0.5, "default"), ("treatment", 0.5, "popularity-heavy")],
        );
        let fresh = experiment("search", &[("only", 1.0, "default")]);
        router.apply(&blending(), &[unchanged, fresh]).unwrap();
        assert_eq!(router.assign("user7", "search").unwrap(), "only");
        assert_eq!(router.catalog().len(), 2);
    }

    #[test]
    fn test_retired_experiment_id_cannot_return() {
        let router = router();
        let search = experiment("search", &[("only", 1.0, "default")]);
        router.apply(&blending(), &[search]).unwrap();
        assert!(!router.catalog().contains("homepage"));

        let revived = experiment(
            "homepage",
            &[("control", 0.5, "default"), ("treatment", 0.5, "popularity-heavy")],
        );
        let result = router.apply(&blending(), &[revived]);
        assert!(matches!(result, Err(ExperimentError::RetiredExperiment(id)) if id == "homepage"));
        assert!(router.catalog().contains("search"));
    }

    #[test]
    fn test_concurrent_updates_cannot_both_claim_an_id() {
        let router = router();
        let homepage = experiment(
            "homepage",
            &[("control", 0.5, "default"), ("treatment", 0.5, "popularity-heavy")],
        );

        let results: Vec<Result<(), ExperimentError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (1..=8)
                .map(|i| {
                    let weight = i as f64 / 10.0;
                    let search = experiment(
                        "search",
                        &[("x", weight, "default"), ("y", 1.0 - weight, "popularity-heavy")],
                    );
                    let configs = vec![homepage.clone(), search];
                    let router = &router;
                    scope.spawn(move || router.apply(&blending(), &configs))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let applied = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(applied, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, ExperimentError::LiveBucketChange(id) if id == "search")));
    }

    #[test]
    fn test_unknown_experiment() {
        assert!(matches!(
            router().assign("user1", "missing"),
            Err(ExperimentError::UnknownExperiment(_))
        ));
    }
}
