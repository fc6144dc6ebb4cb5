//! Request Orchestrator
//!
//! Drives one request through
//! `Received -> CandidatesResolved -> Scoring -> Blending -> Complete`.
//! The deadline is fixed when the request is received. Candidate and profile
//! lookups must finish before the scoring reserve at the end of the budget, so
//! strategies always get a turn. If the deadline has passed anyway, the request
//! goes straight to blending and the strategies only get the cancel grace to
//! produce scores. Only a request with nothing left to rank ends in `Failed`.

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{
    Candidate, CandidatePoolHint, FeatureVector, RankedResponse, RecommendationRequest,
    ResponseStatus, SimilarItem,
};
use crate::services::artifacts::ArtifactStore;
use crate::services::blending::Blender;
use crate::services::candidates::CandidateResolver;
use crate::services::cold_start::ColdStartResolver;
use crate::services::experiment::{BlendSelection, ExperimentRouter};
use crate::services::features::{FeatureCache, FeatureKey, InteractionSource};
use crate::services::outcome::{OutcomeRecord, OutcomeRecorder};
use crate::services::scoring::{rank_similar, ScorerSet, UserContext};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Scoring window after a missed deadline when the cancel grace is zero.
const MIN_LATE_SCORING: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    CandidatesResolved,
    Scoring,
    Blending,
    Complete,
    Failed,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Received => "received",
            RequestState::CandidatesResolved => "candidates_resolved",
            RequestState::Scoring => "scoring",
            RequestState::Blending => "blending",
            RequestState::Complete => "complete",
            RequestState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Complete | RequestState::Failed)
    }

    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;

        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Received, CandidatesResolved)
            | (CandidatesResolved, Scoring)
            | (Scoring, Blending)
            | (Blending, Complete) => true,
            // Deadline short-circuit.
            (CandidatesResolved, Blending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State and deadline of one in-flight request.
///
/// The deadline bounds lookups and scoring. Cold-start resolution runs after
/// scoring under its own lookup timeout, so a response may land up to one
/// cold-start lookup timeout past the deadline.
#[derive(Debug)]
pub struct RequestLifecycle {
    request_id: Uuid,
    state: RequestState,
    started: Instant,
    deadline: Instant,
    lookup_deadline: Instant,
}

impl RequestLifecycle {
    pub fn new(request_id: Uuid, timeout: Duration) -> Self {
        let started = Instant::now();
        let deadline = started + timeout;
        Self {
            request_id,
            state: RequestState::Received,
            started,
            deadline,
            lookup_deadline: deadline,
        }
    }

    /// Hold back `reserve` of the budget for scoring. Capped at the whole budget.
    pub fn with_scoring_reserve(mut self, reserve: Duration) -> Self {
        let budget = self.deadline.saturating_duration_since(self.started);
        self.lookup_deadline = self.deadline - reserve.min(budget);
        self
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// When candidate and profile lookups must have finished.
    pub fn lookup_deadline(&self) -> Instant {
        self.lookup_deadline
    }

    pub fn past_deadline(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn advance(&mut self, next: RequestState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::Internal(format!(
                "invalid request transition {} -> {}",
                self.state, next
            )));
        }

        debug!(
            request_id = %self.request_id,
            from = %self.state,
            to = %next,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "Request state transition"
        );
        self.state = next;
        Ok(())
    }
}

pub struct RecommendationOrchestrator {
    artifacts: Arc<ArtifactStore>,
    features: Arc<FeatureCache>,
    candidates: CandidateResolver,
    scorers: ScorerSet,
    cold_start: ColdStartResolver,
    router: Arc<ExperimentRouter>,
    blender: Blender,
    outcomes: OutcomeRecorder,
    request_timeout: Duration,
    scoring_reserve: Duration,
    cancel_grace: Duration,
    max_list_length: usize,
}

impl RecommendationOrchestrator {
    pub fn new(
        config: &Config,
        artifacts: Arc<ArtifactStore>,
        features: Arc<FeatureCache>,
        interactions: Arc<dyn InteractionSource>,
        scorers: ScorerSet,
        outcomes: OutcomeRecorder,
    ) -> Result<Self> {
        if scorers.is_empty() {
            return Err(AppError::Configuration(
                "at least one scoring strategy must be registered".to_string(),
            ));
        }

        let router = ExperimentRouter::from_config(&config.blending, &config.experiments)?;
        let request_timeout = config.scoring.request_timeout();
        let cancel_grace = config.scoring.cancel_grace();
        let scoring_reserve = (Duration::from_millis(config.scoring.strategy_timeout_ms)
            + cancel_grace)
            .min(request_timeout / 2);

        Ok(Self {
            candidates: CandidateResolver::new(
                Arc::clone(&features),
                config.scoring.max_candidates,
            ),
            cold_start: ColdStartResolver::new(&config.cold_start, interactions),
            router: Arc::new(router),
            blender: Blender::new(),
            request_timeout,
            scoring_reserve,
            cancel_grace,
            max_list_length: config.scoring.max_list_length,
            artifacts,
            features,
            scorers,
            outcomes,
        })
    }

    pub fn router(&self) -> &Arc<ExperimentRouter> {
        &self.router
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    pub async fn recommend(&self, request: RecommendationRequest) -> Result<RankedResponse> {
        self.validate(&request)?;

        let request_id = Uuid::new_v4();
        let mut lifecycle = RequestLifecycle::new(request_id, self.request_timeout)
            .with_scoring_reserve(self.scoring_reserve);
        let selection = self.router.select(&request.user_id, &request.experiment_ids);

        let result = self.run(&request, &selection, &mut lifecycle).await;

        let elapsed = lifecycle.elapsed();
        match &result {
            Ok(response) => {
                metrics::record_request(response.status.as_str(), elapsed);
                info!(
                    request_id = %request_id,
                    user_id = %request.user_id,
                    status = response.status.as_str(),
                    items = response.items.len(),
                    blend = %response.blend,
                    elapsed_ms = response.elapsed_ms,
                    "Recommendations served"
                );
                self.outcomes.record(OutcomeRecord {
                    request_id,
                    user_id: request.user_id.clone(),
                    outcome: response.status.as_str().to_string(),
                    assignments: response.assignments.clone(),
                    blend: response.blend.clone(),
                    items: response.items.clone(),
                    strategies: response.strategies.clone(),
                    artifact_versions: response.artifact_versions.clone(),
                    latency_ms: response.elapsed_ms,
                    recorded_at: Utc::now(),
                });
            }
            Err(e) => {
                if !lifecycle.state().is_terminal() {
                    lifecycle.advance(RequestState::Failed)?;
                }
                metrics::record_request("failed", elapsed);
                warn!(
                    request_id = %request_id,
                    user_id = %request.user_id,
                    error = %e,
                    degraded = e.is_degraded(),
                    "Recommendation request failed"
                );
                self.outcomes.record(OutcomeRecord {
                    request_id,
                    user_id: request.user_id.clone(),
                    outcome: e.code().to_string(),
                    assignments: selection.assignments.clone(),
                    blend: selection.blend_name.clone(),
                    items: Vec::new(),
                    strategies: Vec::new(),
                    artifact_versions: BTreeMap::new(),
                    latency_ms: elapsed.as_millis() as u64,
                    recorded_at: Utc::now(),
                });
            }
        }

        result
    }

    async fn run(
        &self,
        request: &RecommendationRequest,
        selection: &BlendSelection,
        lifecycle: &mut RequestLifecycle,
    ) -> Result<RankedResponse> {
        let lookup_deadline = lifecycle.lookup_deadline();
        // Pinned for the whole request; reloads only affect later requests.
        let artifacts = self.artifacts.snapshot();

        let (resolved, (profile, profile_degraded)) = tokio::join!(
            self.candidates
                .resolve(&request.candidate_pool_hint, &artifacts, lookup_deadline),
            self.user_profile(&request.user_id, lookup_deadline),
        );

        if resolved.candidates.is_empty() {
            return Err(AppError::no_candidates(
                "candidate pool resolved to no items",
                resolved.degraded,
            ));
        }
        lifecycle.advance(RequestState::CandidatesResolved)?;

        let candidates = Arc::new(resolved.candidates);
        let user = Arc::new(UserContext {
            user_id: request.user_id.clone(),
            context: request.context.clone(),
            profile,
        });

        let short_circuited = lifecycle.past_deadline();
        let (scored, strategies) = if short_circuited {
            warn!(
                user_id = %request.user_id,
                overrun_ms = lifecycle.elapsed().saturating_sub(self.request_timeout).as_millis() as u64,
                "Deadline passed before scoring, scoring within the cancel grace"
            );
            lifecycle.advance(RequestState::Blending)?;
            let late_deadline = Instant::now() + self.cancel_grace.max(MIN_LATE_SCORING);
            let results = self
                .scorers
                .score_all(user, Arc::clone(&candidates), &artifacts, late_deadline)
                .await;
            (results.assemble(&candidates), results.reports())
        } else {
            lifecycle.advance(RequestState::Scoring)?;
            let results = self
                .scorers
                .score_all(user, Arc::clone(&candidates), &artifacts, lifecycle.deadline())
                .await;

            let mut scored = results.assemble(&candidates);
            self.cold_start
                .resolve(&request.user_id, &mut scored)
                .await;
            lifecycle.advance(RequestState::Blending)?;
            (scored, results.reports())
        };

        let strategies_degraded = strategies
            .iter()
            .any(|report| report.status.is_degraded());
        let degraded =
            short_circuited || strategies_degraded || resolved.degraded || profile_degraded;

        let blended = self
            .blender
            .blend(&selection.blend, scored, request.list_length);
        if blended.is_empty() {
            return Err(AppError::no_candidates(
                "no candidate received a score from any strategy",
                degraded,
            ));
        }
        lifecycle.advance(RequestState::Complete)?;

        Ok(RankedResponse {
            request_id: lifecycle.request_id,
            user_id: request.user_id.clone(),
            status: if degraded {
                ResponseStatus::Partial
            } else {
                ResponseStatus::Complete
            },
            items: blended
                .into_iter()
                .map(|item| item.into_ranked_item())
                .collect(),
            strategies,
            assignments: selection.assignments.clone(),
            blend: selection.blend_name.clone(),
            artifact_versions: artifacts.versions(),
            elapsed_ms: lifecycle.elapsed().as_millis() as u64,
        })
    }

    /// Items most similar in content to `item_id`, drawn from the catalog pool.
    pub async fn similar_items(&self, item_id: &str, limit: usize) -> Result<Vec<SimilarItem>> {
        if item_id.trim().is_empty() {
            return Err(AppError::InvalidRequest("item_id must not be empty".to_string()));
        }
        self.validate_list_length(limit)?;

        let deadline = Instant::now() + self.request_timeout;
        let seed_features = self.item_features(item_id, deadline).await?;
        let seed = Candidate {
            item_id: item_id.to_string(),
            features: seed_features,
        };

        let artifacts = self.artifacts.snapshot();
        let pool = self
            .candidates
            .resolve(&CandidatePoolHint::All, &artifacts, deadline)
            .await;

        let similar = rank_similar(&seed, &pool.candidates, limit);
        if similar.is_empty() {
            return Err(AppError::no_candidates(
                format!("no catalog item is comparable to {}", item_id),
                pool.degraded,
            ));
        }

        Ok(similar)
    }

    async fn item_features(&self, item_id: &str, deadline: Instant) -> Result<FeatureVector> {
        let key = FeatureKey::Item(item_id.to_string());
        let features = tokio::time::timeout_at(deadline, self.features.get_or_fetch(&key))
            .await
            .map_err(|_| {
                AppError::CacheFetchFailure(format!("feature lookup for {} timed out", key))
            })??;

        match features {
            Some(features) if !features.is_empty() => Ok(features),
            _ => Err(AppError::no_candidates(
                format!("item {} has no content features", item_id),
                false,
            )),
        }
    }

    /// User preference profile, and whether looking it up failed.
    async fn user_profile(&self, user_id: &str, deadline: Instant) -> (Option<FeatureVector>, bool) {
        let key = FeatureKey::User(user_id.to_string());
        match tokio::time::timeout_at(deadline, self.features.get_or_fetch(&key)).await {
            Ok(Ok(profile)) => (profile, false),
            Ok(Err(e)) => {
                warn!(user_id = %user_id, error = %e, "User profile unavailable");
                (None, true)
            }
            Err(_) => {
                warn!(user_id = %user_id, "User profile lookup ran past the lookup deadline");
                (None, true)
            }
        }
    }

    fn validate(&self, request: &RecommendationRequest) -> Result<()> {
        if request.user_id.trim().is_empty() {
            return Err(AppError::InvalidRequest("user_id must not be empty".to_string()));
        }
        self.validate_list_length(request.list_length)
    }

    fn validate_list_length(&self, list_length: usize) -> Result<()> {
        if list_length == 0 || list_length > self.max_list_length {
            return Err(AppError::InvalidRequest(format!(
                "list length must be between 1 and {}",
                self.max_list_length
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StrategyKind, StrategyStatus};
    use crate::services::artifacts::{ArtifactPayload, InMemoryArtifactSource, PopularityTable};
    use crate::services::features::{
        AttributeSource, CatalogDocument, CatalogSnapshot, FeatureError,
    };
    use crate::services::outcome::TracingOutcomeSink;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Attribute store that answers every lookup after a fixed delay.
    struct SlowAttributes {
        delay: Duration,
    }

    #[async_trait]
    impl AttributeSource for SlowAttributes {
        async fn fetch(&self, _key: &FeatureKey) -> std::result::Result<Option<FeatureVector>, FeatureError> {
            tokio::time::sleep(self.delay).await;
            Ok(Some(Arc::new(vec![1.0, 0.0])))
        }
    }

    async fn orchestrator(config: &Config, attributes: Arc<dyn AttributeSource>) -> RecommendationOrchestrator {
        let source = Arc::new(InMemoryArtifactSource::new());
        source
            .publish(ArtifactPayload::Popularity(PopularityTable::from_scores(
                HashMap::from([("a".to_string(), 9.0), ("b".to_string(), 4.0)]),
            )))
            .await;
        let artifacts = Arc::new(ArtifactStore::new(source));
        artifacts.initialize().await;

        let features = Arc::new(FeatureCache::new(&config.cache, attributes));
        let interactions = Arc::new(CatalogSnapshot::from_document(CatalogDocument::default()));
        let (outcomes, _) = OutcomeRecorder::spawn(16, Arc::new(TracingOutcomeSink));

        RecommendationOrchestrator::new(
            config,
            artifacts,
            features,
            interactions,
            ScorerSet::standard(&config.scoring),
            outcomes,
        )
        .unwrap()
    }

    fn request(user_id: &str) -> RecommendationRequest {
        RecommendationRequest {
            user_id: user_id.to_string(),
            context: Default::default(),
            candidate_pool_hint: CandidatePoolHint::All,
            list_length: 5,
            experiment_ids: Vec::new(),
        }
    }

    fn item_ids(response: &RankedResponse) -> Vec<&str> {
        response.items.iter().map(|item| item.item_id.as_str()).collect()
    }

    fn popularity_status(response: &RankedResponse) -> Option<StrategyStatus> {
        response
            .strategies
            .iter()
            .find(|report| report.strategy == StrategyKind::Popularity)
            .map(|report| report.status)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attribute_store_leaves_time_to_score() {
        let mut config = Config::default();
        config.scoring.request_timeout_ms = 80;
        config.cache.fetch_timeout_ms = 500;
        let orchestrator = orchestrator(
            &config,
            Arc::new(SlowAttributes {
                delay: Duration::from_millis(150),
            }),
        )
        .await;

        let response = orchestrator.recommend(request("user1")).await.unwrap();

        assert_eq!(response.status, ResponseStatus::Partial);
        assert_eq!(item_ids(&response), vec!["a", "b"]);
        assert_eq!(popularity_status(&response), Some(StrategyStatus::Complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_deadline_still_scores_before_blending() {
        let config = Config::default();
        let orchestrator = orchestrator(
            &config,
            Arc::new(CatalogSnapshot::from_document(CatalogDocument::default())),
        )
        .await;

        let request = request("user1");
        let selection = orchestrator.router().select(&request.user_id, &request.experiment_ids);
        let mut lifecycle = RequestLifecycle::new(Uuid::new_v4(), Duration::ZERO);

        let response = orchestrator
            .run(&request, &selection, &mut lifecycle)
            .await
            .unwrap();

        assert_eq!(lifecycle.state(), RequestState::Complete);
        assert_eq!(response.status, ResponseStatus::Partial);
        assert_eq!(item_ids(&response), vec!["a", "b"]);
        assert_eq!(popularity_status(&response), Some(StrategyStatus::Complete));
    }

    #[test]
    fn test_scoring_reserve_moves_lookup_deadline() {
        let lifecycle = RequestLifecycle::new(Uuid::new_v4(), Duration::from_millis(80))
            .with_scoring_reserve(Duration::from_millis(40));
        assert_eq!(
            lifecycle.deadline() - lifecycle.lookup_deadline(),
            Duration::from_millis(40)
        );

        let capped = RequestLifecycle::new(Uuid::new_v4(), Duration::from_millis(10))
            .with_scoring_reserve(Duration::from_secs(1));
        assert_eq!(capped.lookup_deadline(), capped.started);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut lifecycle = RequestLifecycle::new(Uuid::new_v4(), Duration::from_secs(1));

        for next in [
            RequestState::CandidatesResolved,
            RequestState::Scoring,
            RequestState::Blending,
            RequestState::Complete,
        ] {
            lifecycle.advance(next).unwrap();
        }
        assert!(lifecycle.state().is_terminal());
    }

    #[test]
    fn test_deadline_short_circuit_skips_scoring() {
        assert!(RequestState::CandidatesResolved.can_transition_to(RequestState::Blending));
        assert!(!RequestState::Received.can_transition_to(RequestState::Scoring));
        assert!(!RequestState::Blending.can_transition_to(RequestState::Scoring));
    }

    #[test]
    fn test_failed_reachable_from_any_live_state() {
        for state in [
            RequestState::Received,
            RequestState::CandidatesResolved,
            RequestState::Scoring,
            RequestState::Blending,
        ] {
            assert!(state.can_transition_to(RequestState::Failed));
        }
        assert!(!RequestState::Complete.can_transition_to(RequestState::Failed));
        assert!(!RequestState::Failed.can_transition_to(RequestState::Failed));
    }

    #[test]
    fn test_invalid_transition_is_an_error() {
        let mut lifecycle = RequestLifecycle::new(Uuid::new_v4(), Duration::from_secs(1));
        assert!(matches!(
            lifecycle.advance(RequestState::Complete),
            Err(AppError::Internal(_))
        ));
        assert_eq!(lifecycle.state(), RequestState::Received);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_fixed_at_receipt() {
        let lifecycle = RequestLifecycle::new(Uuid::new_v4(), Duration::from_millis(10));
        assert!(!lifecycle.past_deadline());

        tokio::time::advance(Duration::from_millis(11)).await;
        assert!(lifecycle.past_deadline());
    }
}
