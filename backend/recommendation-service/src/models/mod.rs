use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Dense feature vector shared between the cache, candidates and scorers.
pub type FeatureVector = Arc<Vec<f64>>;

/// Scoring strategies known to the engine.
///
/// New strategies are added as new variants and registered explicitly with the
/// `ScorerSet`; there is no dynamic lookup by name at request time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Collaborative,
    ContentBased,
    Popularity,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::Collaborative,
        StrategyKind::ContentBased,
        StrategyKind::Popularity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Collaborative => "collaborative",
            StrategyKind::ContentBased => "content_based",
            StrategyKind::Popularity => "popularity",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collaborative" => Ok(StrategyKind::Collaborative),
            "content_based" => Ok(StrategyKind::ContentBased),
            "popularity" => Ok(StrategyKind::Popularity),
            other => Err(format!("unknown strategy: {}", other)),
        }
    }
}

/// An item eligible for ranking in one request.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub item_id: String,
    /// Content features; empty when the attribute store had nothing for the item.
    pub features: FeatureVector,
}

impl Candidate {
    pub fn new(item_id: impl Into<String>, features: Vec<f64>) -> Self {
        Self {
            item_id: item_id.into(),
            features: Arc::new(features),
        }
    }

    pub fn without_features(item_id: impl Into<String>) -> Self {
        Self::new(item_id, Vec::new())
    }
}

/// A candidate plus the raw score of every strategy that could score it.
///
/// A strategy missing from `scores` did not produce a score; that is different
/// from a score of `0.0`.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub scores: BTreeMap<StrategyKind, f64>,
    /// Set by the cold-start resolver; only fallback strategies contribute.
    pub cold: bool,
}

impl ScoredCandidate {
    pub fn new(candidate: Candidate) -> Self {
        Self {
            candidate,
            scores: BTreeMap::new(),
            cold: false,
        }
    }

    pub fn item_id(&self) -> &str {
        &self.candidate.item_id
    }

    pub fn score(&self, strategy: StrategyKind) -> Option<f64> {
        self.scores.get(&strategy).copied()
    }

    pub fn has_any_score(&self) -> bool {
        !self.scores.is_empty()
    }
}

/// Device, locale and free-form session signals sent with a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub session_signals: HashMap<String, String>,
}

/// Where the candidate pool comes from: the whole catalog or an explicit list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidatePoolHint {
    #[default]
    All,
    Items(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationRequest {
    pub user_id: String,
    #[serde(default)]
    pub context: RequestContext,
    #[serde(default)]
    pub candidate_pool_hint: CandidatePoolHint,
    pub list_length: usize,
    #[serde(default)]
    pub experiment_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Complete,
    /// At least one strategy was skipped, timed out or returned partial scores.
    Partial,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Complete => "complete",
            ResponseStatus::Partial => "partial",
        }
    }
}

/// How a single strategy fared for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Complete,
    Partial,
    TimedOut,
    Unavailable,
    Failed,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Complete => "complete",
            StrategyStatus::Partial => "partial",
            StrategyStatus::TimedOut => "timed_out",
            StrategyStatus::Unavailable => "unavailable",
            StrategyStatus::Failed => "failed",
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, StrategyStatus::Complete)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyReport {
    pub strategy: StrategyKind,
    pub status: StrategyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentAssignment {
    pub experiment_id: String,
    pub variant_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub strategy: StrategyKind,
    pub contribution: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedItem {
    pub item_id: String,
    pub score: f64,
    pub explanation: Vec<Contribution>,
    #[serde(default)]
    pub cold: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedResponse {
    pub request_id: Uuid,
    pub user_id: String,
    pub status: ResponseStatus,
    pub items: Vec<RankedItem>,
    pub strategies: Vec<StrategyReport>,
    pub assignments: Vec<ExperimentAssignment>,
    pub blend: String,
    pub artifact_versions: BTreeMap<String, u64>,
    pub elapsed_ms: u64,
}

impl RankedResponse {
    pub fn is_degraded(&self) -> bool {
        self.status == ResponseStatus::Partial
    }

    pub fn item_ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.item_id.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarItem {
    pub item_id: String,
    pub score: f64,
}
