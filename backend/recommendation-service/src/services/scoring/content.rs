use super::{Scorer, ScoringBudget, ScoringError, StrategyScores, UserContext};
use crate::models::{Candidate, SimilarItem, StrategyKind};
use crate::services::artifacts::{ArtifactHandle, ArtifactKind};
use crate::utils::cosine_similarity;
use async_trait::async_trait;

/// Cosine similarity between the user's preference profile and each item's
/// content features. Reads no artifact.
pub struct ContentScorer;

#[async_trait]
impl Scorer for ContentScorer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ContentBased
    }

    fn artifact_kind(&self) -> Option<ArtifactKind> {
        None
    }

    async fn score(
        &self,
        user: &UserContext,
        candidates: &[Candidate],
        _artifact: Option<&ArtifactHandle>,
        budget: &ScoringBudget,
    ) -> Result<StrategyScores, ScoringError> {
        let Some(profile) = user.profile.as_ref() else {
            return Ok(StrategyScores::none(candidates));
        };

        Ok(StrategyScores::collect(candidates, budget, |candidate| {
            cosine_similarity(profile, &candidate.features)
        })
        .await)
    }
}

/// "More like this": pool items most similar to `seed`, best first, ties by
/// item id. The seed itself and items without usable features are skipped.
pub fn rank_similar(seed: &Candidate, pool: &[Candidate], top_n: usize) -> Vec<SimilarItem> {
    let mut ranked: Vec<SimilarItem> = pool
        .iter()
        .filter(|candidate| candidate.item_id != seed.item_id)
        .filter_map(|candidate| {
            cosine_similarity(&seed.features, &candidate.features).map(|score| SimilarItem {
                item_id: candidate.item_id.clone(),
                score,
            })
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    ranked.truncate(top_n);
    ranked
}
