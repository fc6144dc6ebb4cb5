use crate::models::{Candidate, CandidatePoolHint};
use crate::services::artifacts::{ArtifactKind, ArtifactSnapshot};
use crate::services::features::{FeatureCache, FeatureKey};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Candidates for one request, with their content features attached.
#[derive(Debug, Clone, Default)]
pub struct ResolvedCandidates {
    pub candidates: Vec<Candidate>,
    /// Candidates whose features could not be fetched (not "not found").
    pub missing_features: usize,
    /// Some signal was lost: the catalog was unavailable or feature fetches failed.
    pub degraded: bool,
}

/// Turns a pool hint into candidates. "All" means the published catalog, the
/// items of the pinned popularity artifact, best first and capped.
pub struct CandidateResolver {
    features: Arc<FeatureCache>,
    max_candidates: usize,
}

impl CandidateResolver {
    pub fn new(features: Arc<FeatureCache>, max_candidates: usize) -> Self {
        Self {
            features,
            max_candidates,
        }
    }

    pub async fn resolve(
        &self,
        hint: &CandidatePoolHint,
        artifacts: &ArtifactSnapshot,
        deadline: Instant,
    ) -> ResolvedCandidates {
        let (item_ids, catalog_missing) = match hint {
            CandidatePoolHint::All => match artifacts
                .get(ArtifactKind::Popularity)
                .and_then(|handle| handle.popularity())
            {
                Some(table) => (table.top(self.max_candidates), false),
                None => {
                    warn!("Catalog pool requested but no popularity artifact is loaded");
                    (Vec::new(), true)
                }
            },
            CandidatePoolHint::Items(items) => (self.explicit_pool(items), false),
        };

        let mut resolved = self.attach_features(item_ids, deadline).await;
        resolved.degraded |= catalog_missing;
        resolved
    }

    /// Explicit ids in request order, without blanks or duplicates.
    fn explicit_pool(&self, items: &[String]) -> Vec<String> {
        let mut seen = HashSet::with_capacity(items.len());
        let pool: Vec<String> = items
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty() && seen.insert(*id))
            .take(self.max_candidates)
            .map(str::to_string)
            .collect();

        if pool.len() < items.len() {
            debug!(
                requested = items.len(),
                kept = pool.len(),
                "Explicit candidate pool trimmed"
            );
        }
        pool
    }

    async fn attach_features(&self, item_ids: Vec<String>, deadline: Instant) -> ResolvedCandidates {
        if item_ids.is_empty() {
            return ResolvedCandidates::default();
        }

        let keys: Vec<FeatureKey> = item_ids.iter().cloned().map(FeatureKey::Item).collect();
        let lookups = join_all(keys.iter().map(|key| self.features.get_or_fetch(key)));

        let results = match tokio::time::timeout_at(deadline, lookups).await {
            Ok(results) => results,
            Err(_) => {
                warn!(
                    candidates = item_ids.len(),
                    "Feature lookups ran past the request deadline, continuing without features"
                );
                let missing_features = item_ids.len();
                return ResolvedCandidates {
                    candidates: item_ids.into_iter().map(Candidate::without_features).collect(),
                    missing_features,
                    degraded: true,
                };
            }
        };

        let mut missing_features = 0;
        let candidates = item_ids
            .into_iter()
            .zip(results)
            .map(|(item_id, result)| match result {
                Ok(Some(features)) => Candidate {
                    item_id,
                    features,
                },
                Ok(None) => Candidate::without_features(item_id),
                Err(e) => {
                    debug!(item_id = %item_id, error = %e, "Item features unavailable");
                    missing_features += 1;
                    Candidate::without_features(item_id)
                }
            })
            .collect();

        ResolvedCandidates {
            candidates,
            missing_features,
            degraded: missing_features > 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::services::artifacts::{
        ArtifactHandle, ArtifactId, ArtifactPayload, PopularityTable, ScoringArtifact,
    };
    use crate::services::features::{CatalogDocument, CatalogSnapshot};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn resolver(max_candidates: usize) -> CandidateResolver {
        let catalog = CatalogSnapshot::from_document(
            CatalogDocument::default()
                .with_item("movie1", &[("action", 1.0)])
                .with_item("movie2", &[("drama", 1.0)]),
        );
        let features = Arc::new(FeatureCache::new(&CacheConfig::default(), Arc::new(catalog)));
        CandidateResolver::new(features, max_candidates)
    }

    fn snapshot() -> ArtifactSnapshot {
        let handle: ArtifactHandle = Arc::new(
            ScoringArtifact::new(
                ArtifactId {
                    kind: ArtifactKind::Popularity,
                    version: 1,
                },
                ArtifactPayload::Popularity(PopularityTable::from_scores(
                    [
                        ("movie1".to_string(), 3.0),
                        ("movie2".to_string(), 9.0),
                        ("movie3".to_string(), 1.0),
                    ]
                    .into(),
                )),
            )
            .unwrap(),
        );
        ArtifactSnapshot::from_handles(BTreeMap::from([(ArtifactKind::Popularity, handle)]))
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn test_all_uses_popularity_catalog() {
        let resolved = resolver(2)
            .resolve(&CandidatePoolHint::All, &snapshot(), deadline())
            .await;

        let ids: Vec<&str> = resolved.candidates.iter().map(|c| c.item_id.as_str()).collect();
        assert_eq!(ids, vec!["movie2", "movie1"]);
        assert_eq!(resolved.candidates[0].features.as_slice(), &[0.0, 1.0]);
        assert!(!resolved.degraded);
    }

    #[tokio::test]
    async fn test_explicit_pool_is_deduplicated() {
        let hint = CandidatePoolHint::Items(vec![
            "movie3".to_string(),
            "movie1".to_string(),
            "movie3".to_string(),
            " ".to_string(),
        ]);

        let resolved = resolver(10).resolve(&hint, &snapshot(), deadline()).await;

        let ids: Vec<&str> = resolved.candidates.iter().map(|c| c.item_id.as_str()).collect();
        assert_eq!(ids, vec!["movie3", "movie1"]);
        // Unknown to the attribute store: no features, but not degraded.
        assert!(resolved.candidates[0].features.is_empty());
        assert_eq!(resolved.missing_features, 0);
    }

    #[tokio::test]
    async fn test_missing_catalog_is_degraded() {
        let resolved = resolver(10)
            .resolve(&CandidatePoolHint::All, &ArtifactSnapshot::default(), deadline())
            .await;

        assert!(resolved.candidates.is_empty());
        assert!(resolved.degraded);
    }
}
