//! Cold-Start Resolver
//!
//! A candidate the primary (collaborative) strategy could not score is cold
//! when the user or the item has too little history. Cold candidates keep only
//! their fallback strategy scores, so the blender ranks them on popularity and
//! content alone instead of on a missing collaborative signal.

use crate::config::ColdStartConfig;
use crate::metrics;
use crate::models::{ScoredCandidate, StrategyKind};
use crate::services::features::InteractionSource;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColdStartReport {
    /// The user is below the interaction threshold, or their count is unknown.
    pub user_cold: bool,
    pub cold_candidates: usize,
}

pub struct ColdStartResolver {
    interactions: Arc<dyn InteractionSource>,
    primary: StrategyKind,
    fallback: Vec<StrategyKind>,
    min_user_interactions: u64,
    min_item_exposures: u64,
    lookup_timeout: Duration,
}

impl ColdStartResolver {
    pub fn new(config: &ColdStartConfig, interactions: Arc<dyn InteractionSource>) -> Self {
        Self {
            interactions,
            primary: StrategyKind::Collaborative,
            fallback: config.fallback_strategies.clone(),
            min_user_interactions: config.min_user_interactions,
            min_item_exposures: config.min_item_exposures,
            lookup_timeout: config.lookup_timeout(),
        }
    }

    pub async fn resolve(&self, user_id: &str, scored: &mut [ScoredCandidate]) -> ColdStartReport {
        let unscored: Vec<String> = scored
            .iter()
            .filter(|candidate| candidate.score(self.primary).is_none())
            .map(|candidate| candidate.item_id().to_string())
            .collect();

        if unscored.is_empty() {
            return ColdStartReport::default();
        }

        // Both lookups run together so resolution costs at most one lookup timeout.
        let (user_cold, exposures) =
            tokio::join!(self.user_is_cold(user_id), self.item_exposures(&unscored));
        let exposures = if user_cold {
            HashMap::new()
        } else {
            exposures.unwrap_or_default()
        };

        let mut cold_candidates = 0;
        for candidate in scored.iter_mut() {
            if candidate.score(self.primary).is_some() {
                continue;
            }

            let item_cold = user_cold
                || exposures.get(candidate.item_id()).copied().unwrap_or(0)
                    < self.min_item_exposures;

            if item_cold {
                candidate.cold = true;
                candidate
                    .scores
                    .retain(|strategy, _| self.fallback.contains(strategy));
                cold_candidates += 1;
            }
        }

        metrics::record_cold_candidates(cold_candidates);
        debug!(
            user_id = %user_id,
            user_cold,
            cold_candidates,
            lacking_primary = unscored.len(),
            "Cold-start resolution completed"
        );

        ColdStartReport {
            user_cold,
            cold_candidates,
        }
    }

    async fn user_is_cold(&self, user_id: &str) -> bool {
        match tokio::time::timeout(
            self.lookup_timeout,
            self.interactions.user_interactions(user_id),
        )
        .await
        {
            Ok(Ok(count)) => count < self.min_user_interactions,
            Ok(Err(e)) => {
                warn!(user_id = %user_id, error = %e, "Interaction lookup failed, treating user as cold");
                true
            }
            Err(_) => {
                warn!(user_id = %user_id, "Interaction lookup timed out, treating user as cold");
                true
            }
        }
    }

    /// Exposure counts, or `None` when unknown (every item is then cold).
    async fn item_exposures(&self, item_ids: &[String]) -> Option<HashMap<String, u64>> {
        match tokio::time::timeout(self.lookup_timeout, self.interactions.item_exposures(item_ids))
            .await
        {
            Ok(Ok(exposures)) => Some(exposures),
            Ok(Err(e)) => {
                warn!(error = %e, "Exposure lookup failed, treating items as cold");
                None
            }
            Err(_) => {
                warn!("Exposure lookup timed out, treating items as cold");
                None
            }
        }
    }
}
