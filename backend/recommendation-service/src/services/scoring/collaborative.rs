use super::{Scorer, ScoringBudget, ScoringError, StrategyScores, UserContext};
use crate::models::{Candidate, StrategyKind};
use crate::services::artifacts::{ArtifactError, ArtifactHandle, ArtifactKind};
use crate::utils::dot;
use async_trait::async_trait;
use tracing::debug;

/// Matrix-factorization scores: dot product of user and item latent factors.
pub struct CollaborativeScorer;

#[async_trait]
impl Scorer for CollaborativeScorer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Collaborative
    }

    fn artifact_kind(&self) -> Option<ArtifactKind> {
        Some(ArtifactKind::CollaborativeFactors)
    }

    async fn score(
        &self,
        user: &UserContext,
        candidates: &[Candidate],
        artifact: Option<&ArtifactHandle>,
        budget: &ScoringBudget,
    ) -> Result<StrategyScores, ScoringError> {
        let table = artifact
            .and_then(|handle| handle.factors())
            .ok_or(ArtifactError::Unavailable(ArtifactKind::CollaborativeFactors))?;

        let Some(user_factors) = table.user_factors(&user.user_id) else {
            debug!(user_id = %user.user_id, "No latent factors for user");
            return Ok(StrategyScores::none(candidates));
        };

        Ok(StrategyScores::collect(candidates, budget, |candidate| {
            table
                .item_factors(&candidate.item_id)
                .and_then(|item_factors| dot(user_factors, item_factors))
        })
        .await)
    }
}
