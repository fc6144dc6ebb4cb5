use super::ArtifactError;
use crate::utils::all_finite;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Artifact families published by the training pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArtifactKind {
    /// User/item latent factors from matrix factorization.
    #[serde(rename = "cf-factors")]
    CollaborativeFactors,
    /// Item popularity scores; also the catalog for "all" candidate pools.
    #[serde(rename = "popularity")]
    Popularity,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::CollaborativeFactors, ArtifactKind::Popularity];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::CollaborativeFactors => "cf-factors",
            ArtifactKind::Popularity => "popularity",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cf-factors" => Ok(ArtifactKind::CollaborativeFactors),
            "popularity" => Ok(ArtifactKind::Popularity),
            other => Err(format!("unknown artifact kind: {}", other)),
        }
    }
}

/// Stable artifact name, rendered as `<kind>-v<version>` (e.g. `cf-factors-v3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactId {
    pub kind: ArtifactKind,
    pub version: u64,
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.kind, self.version)
    }
}

/// Latent factor table: `score(user, item) = <user_factors, item_factors>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactorTable {
    pub dimensions: usize,
    #[serde(default)]
    pub users: HashMap<String, Vec<f64>>,
    #[serde(default)]
    pub items: HashMap<String, Vec<f64>>,
}

impl FactorTable {
    pub fn user_factors(&self, user_id: &str) -> Option<&[f64]> {
        self.users.get(user_id).map(Vec::as_slice)
    }

    pub fn item_factors(&self, item_id: &str) -> Option<&[f64]> {
        self.items.get(item_id).map(Vec::as_slice)
    }

    fn validate(&self) -> Result<(), String> {
        if self.dimensions == 0 {
            return Err("factor dimensions must be greater than 0".to_string());
        }

        let vectors = self
            .users
            .iter()
            .map(|(id, v)| ("user", id, v))
            .chain(self.items.iter().map(|(id, v)| ("item", id, v)));

        for (side, id, vector) in vectors {
            if vector.len() != self.dimensions {
                return Err(format!(
                    "{} {} has {} factors, expected {}",
                    side,
                    id,
                    vector.len(),
                    self.dimensions
                ));
            }
            if !all_finite(vector) {
                return Err(format!("{} {} has non-finite factors", side, id));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PopularityTable {
    pub scores: HashMap<String, f64>,
    /// Item ids by descending score, ties by id. Rebuilt on load.
    #[serde(skip)]
    ranked: Vec<String>,
}

impl PopularityTable {
    pub fn from_scores(scores: HashMap<String, f64>) -> Self {
        Self {
            scores,
            ranked: Vec::new(),
        }
        .prepared()
    }

    fn prepared(mut self) -> Self {
        let mut ranked: Vec<(&String, f64)> =
            self.scores.iter().map(|(id, score)| (id, *score)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        self.ranked = ranked.into_iter().map(|(id, _)| id.clone()).collect();
        self
    }

    pub fn score(&self, item_id: &str) -> Option<f64> {
        self.scores.get(item_id).copied()
    }

    /// The `limit` most popular item ids.
    pub fn top(&self, limit: usize) -> Vec<String> {
        self.ranked.iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    fn validate(&self) -> Result<(), String> {
        match self.scores.iter().find(|(_, score)| !score.is_finite()) {
            Some((id, _)) => Err(format!("item {} has a non-finite popularity score", id)),
            None => Ok(()),
        }
    }
}

/// Decoded artifact content.
#[derive(Debug, Clone)]
pub enum ArtifactPayload {
    Factors(FactorTable),
    Popularity(PopularityTable),
}

impl ArtifactPayload {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactPayload::Factors(_) => ArtifactKind::CollaborativeFactors,
            ArtifactPayload::Popularity(_) => ArtifactKind::Popularity,
        }
    }

    /// Decode a published JSON document of the given kind.
    pub fn decode(kind: ArtifactKind, bytes: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            ArtifactKind::CollaborativeFactors => {
                ArtifactPayload::Factors(serde_json::from_slice(bytes)?)
            }
            ArtifactKind::Popularity => {
                let table: PopularityTable = serde_json::from_slice(bytes)?;
                ArtifactPayload::Popularity(table.prepared())
            }
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            ArtifactPayload::Factors(table) => serde_json::to_vec_pretty(table),
            ArtifactPayload::Popularity(table) => serde_json::to_vec_pretty(table),
        }
    }

    pub(super) fn validate(&self, id: ArtifactId) -> Result<(), ArtifactError> {
        if self.kind() != id.kind {
            return Err(ArtifactError::Invalid {
                id: id.to_string(),
                reason: format!("payload is a {} artifact", self.kind()),
            });
        }

        let checked = match self {
            ArtifactPayload::Factors(table) => table.validate(),
            ArtifactPayload::Popularity(table) => table.validate(),
        };

        checked.map_err(|reason| ArtifactError::Invalid {
            id: id.to_string(),
            reason,
        })
    }
}

/// An immutable, version-stamped artifact. Shared read-only by every request
/// that pinned it and dropped once the last of them finishes.
#[derive(Debug)]
pub struct ScoringArtifact {
    id: ArtifactId,
    loaded_at: DateTime<Utc>,
    payload: ArtifactPayload,
}

pub type ArtifactHandle = Arc<ScoringArtifact>;

impl ScoringArtifact {
    pub fn new(id: ArtifactId, payload: ArtifactPayload) -> Result<Self, ArtifactError> {
        payload.validate(id)?;

        Ok(Self {
            id,
            loaded_at: Utc::now(),
            payload,
        })
    }

    pub fn id(&self) -> ArtifactId {
        self.id
    }

    pub fn kind(&self) -> ArtifactKind {
        self.id.kind
    }

    pub fn version(&self) -> u64 {
        self.id.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn factors(&self) -> Option<&FactorTable> {
        match &self.payload {
            ArtifactPayload::Factors(table) => Some(table),
            _ => None,
        }
    }

    pub fn popularity(&self) -> Option<&PopularityTable> {
        match &self.payload {
            ArtifactPayload::Popularity(table) => Some(table),
            _ => None,
        }
    }
}
