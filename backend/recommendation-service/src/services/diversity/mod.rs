use crate::services::blending::BlendedCandidate;
use crate::utils::bounded_similarity;

/// Diversity Layer - greedy similarity-discount re-ranking
///
/// Builds the list position by position. A candidate not yet placed competes
/// with `fused - lambda * max_similarity(candidate, placed)`, so near
/// duplicates of items above it sink while distinct items rise. Nothing is
/// dropped; reported scores stay the fused scores.
pub struct DiversityLayer {
    lambda: f64,
}

impl DiversityLayer {
    pub fn new(lambda: f64) -> Self {
        Self {
            lambda: lambda.clamp(0.0, 1.0),
        }
    }

    /// Reorder `items`, which must already be sorted by fused score.
    pub fn rerank(&self, items: Vec<BlendedCandidate>) -> Vec<BlendedCandidate> {
        if self.lambda == 0.0 || items.len() < 2 {
            return items;
        }

        let mut remaining: Vec<(BlendedCandidate, f64)> =
            items.into_iter().map(|item| (item, 0.0)).collect();
        let mut selected: Vec<BlendedCandidate> = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let mut best_idx = 0;
            let mut best_score = f64::NEG_INFINITY;

            // Strict comparison keeps the earlier (higher fused, lower id) item on ties.
            for (i, (item, max_similarity)) in remaining.iter().enumerate() {
                let adjusted = item.fused_score - self.lambda * max_similarity;
                if adjusted > best_score {
                    best_score = adjusted;
                    best_idx = i;
                }
            }

            let (placed, _) = remaining.remove(best_idx);

            for (item, max_similarity) in remaining.iter_mut() {
                let similarity =
                    bounded_similarity(&placed.candidate.features, &item.candidate.features);
                if similarity > *max_similarity {
                    *max_similarity = similarity;
                }
            }

            selected.push(placed);
        }

        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candidate;
    use std::collections::BTreeMap;

    fn item(id: &str, score: f64, features: Vec<f64>) -> BlendedCandidate {
        BlendedCandidate {
            candidate: Candidate::new(id, features),
            fused_score: score,
            contributions: Vec::new(),
            weights: BTreeMap::new(),
            cold: false,
        }
    }

    fn ids(items: &[BlendedCandidate]) -> Vec<&str> {
        items.iter().map(|i| i.item_id()).collect()
    }

    #[test]
    fn test_interleaves_distinct_categories() {
        let layer = DiversityLayer::new(0.5);
        let items = vec![
            item("action1", 0.9, vec![1.0, 0.0]),
            item("action2", 0.85, vec![1.0, 0.0]),
            item("drama1", 0.7, vec![0.0, 1.0]),
        ];

        let reranked = layer.rerank(items);
        assert_eq!(ids(&reranked), vec!["action1", "drama1", "action2"]);
        // Reported scores are untouched.
        assert_eq!(reranked[2].fused_score, 0.85);
    }

    #[test]
    fn test_zero_lambda_keeps_order() {
        let layer = DiversityLayer::new(0.0);
        let items = vec![
            item("a", 0.9, vec![1.0, 0.0]),
            item("b", 0.8, vec![1.0, 0.0]),
            item("c", 0.1, vec![0.0, 1.0]),
        ];

        assert_eq!(ids(&layer.rerank(items)), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_never_drops_candidates() {
        let layer = DiversityLayer::new(1.0);
        let items: Vec<_> = (0..20)
            .map(|i| item(&format!("item{:02}", i), 1.0 - i as f64 * 0.01, vec![1.0, (i % 3) as f64]))
            .collect();

        let mut reranked = ids(&layer.rerank(items.clone()))
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        reranked.sort();
        let mut original: Vec<String> = items.iter().map(|i| i.item_id().to_string()).collect();
        original.sort();

        assert_eq!(reranked, original);
    }

    #[test]
    fn test_items_without_features_are_not_penalized() {
        let layer = DiversityLayer::new(1.0);
        let items = vec![
            item("a", 0.9, vec![]),
            item("b", 0.8, vec![]),
        ];

        assert_eq!(ids(&layer.rerank(items)), vec!["a", "b"]);
    }
}
