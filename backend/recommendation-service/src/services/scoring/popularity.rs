use super::{Scorer, ScoringBudget, ScoringError, StrategyScores, UserContext};
use crate::models::{Candidate, StrategyKind};
use crate::services::artifacts::{ArtifactError, ArtifactHandle, ArtifactKind};
use async_trait::async_trait;

/// Non-personalized fallback: the published popularity score of each item.
pub struct PopularityScorer;

#[async_trait]
impl Scorer for PopularityScorer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Popularity
    }

    fn artifact_kind(&self) -> Option<ArtifactKind> {
        Some(ArtifactKind::Popularity)
    }

    async fn score(
        &self,
        _user: &UserContext,
        candidates: &[Candidate],
        artifact: Option<&ArtifactHandle>,
        budget: &ScoringBudget,
    ) -> Result<StrategyScores, ScoringError> {
        let table = artifact
            .and_then(|handle| handle.popularity())
            .ok_or(ArtifactError::Unavailable(ArtifactKind::Popularity))?;

        Ok(StrategyScores::collect(candidates, budget, |candidate| {
            table.score(&candidate.item_id)
        })
        .await)
    }
}
