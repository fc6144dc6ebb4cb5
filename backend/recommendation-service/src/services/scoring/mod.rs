//! Scorer Set
//!
//! Every strategy implements [`Scorer`] and is registered explicitly with a
//! [`ScorerSet`]. For one request the set runs all strategies concurrently
//! against the same candidates and pinned artifacts. Each strategy gets its own
//! deadline; a strategy that fails or overruns contributes nothing and never
//! affects the others.

mod collaborative;
mod content;
mod popularity;

pub use collaborative::CollaborativeScorer;
pub use content::{rank_similar, ContentScorer};
pub use popularity::PopularityScorer;

use crate::config::ScoringConfig;
use crate::error::AppError;
use crate::metrics;
use crate::models::{
    Candidate, FeatureVector, RequestContext, ScoredCandidate, StrategyKind, StrategyReport,
    StrategyStatus,
};
use crate::services::artifacts::{ArtifactError, ArtifactHandle, ArtifactKind, ArtifactSnapshot};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Candidates scored between deadline checks.
const DEADLINE_CHECK_INTERVAL: usize = 64;

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("{strategy} exceeded its {budget_ms}ms budget")]
    Timeout { strategy: StrategyKind, budget_ms: u64 },

    #[error("{strategy} failed: {message}")]
    Failed {
        strategy: StrategyKind,
        message: String,
    },

    #[error("strategy {0} is registered more than once")]
    DuplicateStrategy(StrategyKind),
}

impl From<ScoringError> for AppError {
    fn from(err: ScoringError) -> Self {
        match err {
            ScoringError::Artifact(e) => e.into(),
            ScoringError::DuplicateStrategy(_) => AppError::Configuration(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Who is being scored for.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: String,
    pub context: RequestContext,
    /// Preference profile from the feature cache, if the user has one.
    pub profile: Option<FeatureVector>,
}

/// Deadline and cancellation signal handed to a strategy.
#[derive(Debug, Clone)]
pub struct ScoringBudget {
    deadline: Instant,
    cancel: watch::Receiver<bool>,
}

impl ScoringBudget {
    pub fn new(deadline: Instant, cancel: watch::Receiver<bool>) -> Self {
        Self { deadline, cancel }
    }

    /// Budget that can only run out by time.
    pub fn detached(deadline: Instant) -> Self {
        let (_tx, cancel) = watch::channel(false);
        Self { deadline, cancel }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn is_exhausted(&self) -> bool {
        self.is_cancelled() || Instant::now() >= self.deadline
    }
}

/// Raw scores produced by one strategy.
#[derive(Debug, Clone, Default)]
pub struct StrategyScores {
    pub scores: HashMap<String, f64>,
    /// Candidates the strategy could not score (e.g. no factor vector).
    pub unscored: Vec<String>,
    /// False when the budget ran out before every candidate was visited.
    pub complete: bool,
}

impl StrategyScores {
    /// Visit candidates in order, stopping early once the budget is exhausted.
    /// `score_one` returns `None` for candidates the strategy cannot score.
    pub async fn collect<F>(
        candidates: &[Candidate],
        budget: &ScoringBudget,
        mut score_one: F,
    ) -> StrategyScores
    where
        F: FnMut(&Candidate) -> Option<f64>,
    {
        let mut result = StrategyScores {
            scores: HashMap::with_capacity(candidates.len()),
            unscored: Vec::new(),
            complete: true,
        };

        for (index, candidate) in candidates.iter().enumerate() {
            if index > 0 && index % DEADLINE_CHECK_INTERVAL == 0 {
                tokio::task::yield_now().await;
            }
            if budget.is_exhausted() {
                result.complete = false;
                break;
            }

            match score_one(candidate) {
                Some(score) if score.is_finite() => {
                    result.scores.insert(candidate.item_id.clone(), score);
                }
                _ => result.unscored.push(candidate.item_id.clone()),
            }
        }

        result
    }

    /// Nothing scored, every candidate reported as unscored.
    pub fn none(candidates: &[Candidate]) -> StrategyScores {
        StrategyScores {
            scores: HashMap::new(),
            unscored: candidates.iter().map(|c| c.item_id.clone()).collect(),
            complete: true,
        }
    }
}

#[async_trait]
pub trait Scorer: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Artifact the strategy reads, if any. The strategy is skipped as
    /// unavailable when that artifact has never loaded.
    fn artifact_kind(&self) -> Option<ArtifactKind>;

    /// Score as many candidates as the budget allows. Candidates the strategy
    /// cannot score are omitted, never guessed.
    async fn score(
        &self,
        user: &UserContext,
        candidates: &[Candidate],
        artifact: Option<&ArtifactHandle>,
        budget: &ScoringBudget,
    ) -> Result<StrategyScores, ScoringError>;
}

/// How one strategy fared for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    Complete,
    Partial,
    TimedOut,
    Unavailable(String),
    Failed(String),
}

impl StrategyOutcome {
    pub fn status(&self) -> StrategyStatus {
        match self {
            StrategyOutcome::Complete => StrategyStatus::Complete,
            StrategyOutcome::Partial => StrategyStatus::Partial,
            StrategyOutcome::TimedOut => StrategyStatus::TimedOut,
            StrategyOutcome::Unavailable(_) => StrategyStatus::Unavailable,
            StrategyOutcome::Failed(_) => StrategyStatus::Failed,
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            StrategyOutcome::Unavailable(reason) | StrategyOutcome::Failed(reason) => {
                Some(reason.clone())
            }
            _ => None,
        }
    }
}

/// Everything the strategies produced for one request.
#[derive(Debug, Default)]
pub struct StrategyResults {
    outcomes: BTreeMap<StrategyKind, StrategyOutcome>,
    scores: BTreeMap<StrategyKind, HashMap<String, f64>>,
}

impl StrategyResults {
    fn insert(&mut self, kind: StrategyKind, outcome: StrategyOutcome, scores: Option<StrategyScores>) {
        if let Some(scores) = scores {
            self.scores.insert(kind, scores.scores);
        }
        self.outcomes.insert(kind, outcome);
    }

    pub fn outcome(&self, kind: StrategyKind) -> Option<&StrategyOutcome> {
        self.outcomes.get(&kind)
    }

    pub fn is_degraded(&self) -> bool {
        self.outcomes
            .values()
            .any(|outcome| outcome.status().is_degraded())
    }

    pub fn reports(&self) -> Vec<StrategyReport> {
        self.outcomes
            .iter()
            .map(|(kind, outcome)| StrategyReport {
                strategy: *kind,
                status: outcome.status(),
                detail: outcome.detail(),
            })
            .collect()
    }

    /// One `ScoredCandidate` per candidate, in candidate order.
    pub fn assemble(&self, candidates: &[Candidate]) -> Vec<ScoredCandidate> {
        candidates
            .iter()
            .map(|candidate| {
                let mut scored = ScoredCandidate::new(candidate.clone());
                for (kind, scores) in &self.scores {
                    if let Some(score) = scores.get(&candidate.item_id) {
                        scored.scores.insert(*kind, *score);
                    }
                }
                scored
            })
            .collect()
    }
}

pub struct ScorerSet {
    scorers: BTreeMap<StrategyKind, Arc<dyn Scorer>>,
    default_timeout: Duration,
    timeouts: BTreeMap<StrategyKind, Duration>,
    cancel_grace: Duration,
}

impl ScorerSet {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            scorers: BTreeMap::new(),
            default_timeout: Duration::from_millis(config.strategy_timeout_ms),
            timeouts: StrategyKind::ALL
                .iter()
                .filter(|kind| config.strategy_timeouts.contains_key(kind))
                .map(|kind| (*kind, config.strategy_timeout(*kind)))
                .collect(),
            cancel_grace: config.cancel_grace(),
        }
    }

    /// Collaborative, content-based and popularity strategies.
    pub fn standard(config: &ScoringConfig) -> Self {
        let mut set = Self::new(config);
        set.scorers
            .insert(StrategyKind::Collaborative, Arc::new(CollaborativeScorer));
        set.scorers
            .insert(StrategyKind::ContentBased, Arc::new(ContentScorer));
        set.scorers
            .insert(StrategyKind::Popularity, Arc::new(PopularityScorer));
        set
    }

    pub fn register(&mut self, scorer: Arc<dyn Scorer>) -> Result<(), ScoringError> {
        let kind = scorer.kind();
        if self.scorers.contains_key(&kind) {
            return Err(ScoringError::DuplicateStrategy(kind));
        }
        self.scorers.insert(kind, scorer);
        Ok(())
    }

    /// Replace the scorer registered for its kind.
    pub fn replace(&mut self, scorer: Arc<dyn Scorer>) {
        self.scorers.insert(scorer.kind(), scorer);
    }

    pub fn kinds(&self) -> Vec<StrategyKind> {
        self.scorers.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.scorers.is_empty()
    }

    fn timeout(&self, kind: StrategyKind) -> Duration {
        self.timeouts
            .get(&kind)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Run every strategy concurrently, bounded by its own timeout and the
    /// request deadline. Once the request deadline passes, still-running
    /// strategies of this request are signalled to stop and get the cancel
    /// grace period to hand back partial scores.
    pub async fn score_all(
        &self,
        user: Arc<UserContext>,
        candidates: Arc<Vec<Candidate>>,
        artifacts: &ArtifactSnapshot,
        request_deadline: Instant,
    ) -> StrategyResults {
        let mut results = StrategyResults::default();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let started = Instant::now();

        for (kind, scorer) in &self.scorers {
            let kind = *kind;

            let artifact = match scorer.artifact_kind() {
                Some(artifact_kind) => match artifacts.get(artifact_kind) {
                    Some(handle) => Some(Arc::clone(handle)),
                    None => {
                        let reason = ArtifactError::Unavailable(artifact_kind).to_string();
                        warn!(strategy = %kind, reason = %reason, "Strategy skipped");
                        metrics::record_strategy(kind.as_str(), "unavailable", Duration::ZERO);
                        results.insert(kind, StrategyOutcome::Unavailable(reason), None);
                        continue;
                    }
                },
                None => None,
            };

            let timeout = self.timeout(kind);
            let deadline = (started + timeout).min(request_deadline);
            let hard_deadline = deadline + self.cancel_grace;
            let budget = ScoringBudget::new(deadline, cancel_rx.clone());

            let scorer = Arc::clone(scorer);
            let user = Arc::clone(&user);
            let candidates = Arc::clone(&candidates);

            tasks.spawn(async move {
                let run = scorer.score(&user, &candidates, artifact.as_ref(), &budget);
                let result = match tokio::time::timeout_at(hard_deadline, run).await {
                    Ok(result) => result,
                    Err(_) => Err(ScoringError::Timeout {
                        strategy: kind,
                        budget_ms: timeout.as_millis() as u64,
                    }),
                };
                (kind, result, started.elapsed())
            });
        }

        let request_timer = tokio::time::sleep_until(request_deadline);
        tokio::pin!(request_timer);
        let mut cancelled = false;

        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((kind, result, elapsed)) => {
                            let (outcome, scores) = classify(kind, result);
                            metrics::record_strategy(kind.as_str(), outcome.status().as_str(), elapsed);
                            debug!(
                                strategy = %kind,
                                status = outcome.status().as_str(),
                                elapsed_ms = elapsed.as_millis() as u64,
                                "Strategy finished"
                            );
                            results.insert(kind, outcome, scores);
                        }
                        Err(e) => {
                            // Panicked task; its strategy is recorded as failed below.
                            warn!(error = %e, "Strategy task aborted");
                        }
                    }
                }
                _ = &mut request_timer, if !cancelled => {
                    cancelled = true;
                    let _ = cancel_tx.send(true);
                    debug!("Request deadline reached, cancelling remaining strategies");
                }
            }
        }

        for kind in self.scorers.keys() {
            if results.outcome(*kind).is_none() {
                results.insert(
                    *kind,
                    StrategyOutcome::Failed("strategy task panicked".to_string()),
                    None,
                );
            }
        }

        results
    }
}

fn classify(
    kind: StrategyKind,
    result: Result<StrategyScores, ScoringError>,
) -> (StrategyOutcome, Option<StrategyScores>) {
    match result {
        Ok(scores) if scores.complete => (StrategyOutcome::Complete, Some(scores)),
        Ok(scores) => {
            warn!(
                strategy = %kind,
                scored = scores.scores.len(),
                "Strategy ran out of budget, keeping partial scores"
            );
            (StrategyOutcome::Partial, Some(scores))
        }
        Err(ScoringError::Timeout { budget_ms, .. }) => {
            warn!(strategy = %kind, budget_ms, "Strategy timed out");
            (StrategyOutcome::TimedOut, None)
        }
        Err(ScoringError::Artifact(e)) => {
            warn!(strategy = %kind, error = %e, "Strategy artifact unavailable");
            (StrategyOutcome::Unavailable(e.to_string()), None)
        }
        Err(e) => {
            warn!(strategy = %kind, error = %e, "Strategy failed");
            (StrategyOutcome::Failed(e.to_string()), None)
        }
    }
}
