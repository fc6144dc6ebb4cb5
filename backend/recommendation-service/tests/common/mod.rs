//! Shared fixtures for recommendation integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use recommendation_service::config::Config;
use recommendation_service::models::{CandidatePoolHint, RecommendationRequest, StrategyKind};
use recommendation_service::services::artifacts::{
    ArtifactPayload, ArtifactStore, FactorTable, InMemoryArtifactSource, PopularityTable,
};
use recommendation_service::services::blending::{BlendConfig, Normalization};
use recommendation_service::services::features::{CatalogDocument, CatalogSnapshot};
use recommendation_service::services::{
    FeatureCache, OutcomeRecorder, RecommendationOrchestrator, ScorerSet, TracingOutcomeSink,
};

pub struct Engine {
    pub orchestrator: Arc<RecommendationOrchestrator>,
    pub source: Arc<InMemoryArtifactSource>,
    pub artifacts: Arc<ArtifactStore>,
}

/// Config with a single "default" blend.
pub fn config_with_blend(blend: BlendConfig) -> Config {
    let mut config = Config::default();
    config.blending.blends.insert("default".to_string(), blend);
    config
}

pub fn blend(weights: &[(StrategyKind, f64)], diversity: f64) -> BlendConfig {
    BlendConfig {
        weights: weights.iter().copied().collect(),
        normalization: Normalization::MinMax,
        diversity,
    }
}

pub fn popularity(scores: &[(&str, f64)]) -> ArtifactPayload {
    ArtifactPayload::Popularity(PopularityTable::from_scores(
        scores
            .iter()
            .map(|(id, score)| (id.to_string(), *score))
            .collect::<HashMap<_, _>>(),
    ))
}

pub fn factors(users: &[(&str, Vec<f64>)], items: &[(&str, Vec<f64>)]) -> ArtifactPayload {
    let dimensions = users
        .iter()
        .chain(items.iter())
        .map(|(_, v)| v.len())
        .next()
        .unwrap_or(1);

    ArtifactPayload::Factors(FactorTable {
        dimensions,
        users: users
            .iter()
            .map(|(id, v)| (id.to_string(), v.clone()))
            .collect(),
        items: items
            .iter()
            .map(|(id, v)| (id.to_string(), v.clone()))
            .collect(),
    })
}

/// Publish the payloads, load them and wire an orchestrator around them.
pub async fn engine(
    config: &Config,
    catalog: CatalogDocument,
    payloads: Vec<ArtifactPayload>,
    scorers: ScorerSet,
) -> Engine {
    config.validate().unwrap();

    let source = Arc::new(InMemoryArtifactSource::new());
    for payload in payloads {
        source.publish(payload).await;
    }

    let artifacts = Arc::new(ArtifactStore::new(source.clone()));
    artifacts.initialize().await;

    let catalog = Arc::new(CatalogSnapshot::from_document(catalog));
    let features = Arc::new(FeatureCache::new(&config.cache, catalog.clone()));
    let (outcomes, _) = OutcomeRecorder::spawn(64, Arc::new(TracingOutcomeSink));

    let orchestrator = RecommendationOrchestrator::new(
        config,
        artifacts.clone(),
        features,
        catalog,
        scorers,
        outcomes,
    )
    .unwrap();

    Engine {
        orchestrator: Arc::new(orchestrator),
        source,
        artifacts,
    }
}

pub fn request(user_id: &str, list_length: usize) -> RecommendationRequest {
    RecommendationRequest {
        user_id: user_id.to_string(),
        context: Default::default(),
        candidate_pool_hint: CandidatePoolHint::All,
        list_length,
        experiment_ids: Vec::new(),
    }
}

pub fn request_for_items(user_id: &str, items: &[&str], list_length: usize) -> RecommendationRequest {
    RecommendationRequest {
        candidate_pool_hint: CandidatePoolHint::Items(
            items.iter().map(|id| id.to_string()).collect(),
        ),
        ..request(user_id, list_length)
    }
}

/// Sum of explanation contributions per item, keyed by item id.
pub fn contribution_totals(
    response: &recommendation_service::models::RankedResponse,
) -> BTreeMap<String, f64> {
    response
        .items
        .iter()
        .map(|item| {
            (
                item.item_id.clone(),
                item.explanation.iter().map(|c| c.contribution).sum(),
            )
        })
        .collect()
}
