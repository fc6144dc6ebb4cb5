//! Integration Tests: HTTP service over on-disk fixtures
//!
//! Loads `tests/fixtures/config/recommendation.toml`, the artifact tree and
//! the catalog snapshot the same way the binary does, then drives the HTTP
//! endpoints.

use actix_web::{test, web, App};
use std::sync::Arc;

use recommendation_service::config::{Config, CONFIG_FILE_ENV};
use recommendation_service::handlers::{configure, RecommendationHandlerState, DEGRADED_HEADER};
use recommendation_service::models::{RankedResponse, ResponseStatus};
use recommendation_service::services::artifacts::ArtifactKind;
use recommendation_service::services::{
    ArtifactStore, CatalogSnapshot, FeatureCache, FsArtifactSource, OutcomeRecorder,
    RecommendationOrchestrator, ScorerSet, TracingOutcomeSink,
};

async fn fixture_state() -> web::Data<RecommendationHandlerState> {
    std::env::set_var(
        CONFIG_FILE_ENV,
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/config/recommendation.toml"),
    );
    let mut config = Config::from_env().unwrap();
    config.validate().unwrap();

    let root = env!("CARGO_MANIFEST_DIR");
    config.artifacts.root_dir = format!("{}/{}", root, config.artifacts.root_dir);
    config.catalog.snapshot_path = format!("{}/{}", root, config.catalog.snapshot_path);

    let artifacts = Arc::new(ArtifactStore::new(Arc::new(FsArtifactSource::new(
        &config.artifacts.root_dir,
    ))));
    artifacts.initialize().await;
    assert!(artifacts.is_ready());
    assert_eq!(
        artifacts.active_version(ArtifactKind::CollaborativeFactors),
        Some(1)
    );

    let catalog = Arc::new(
        CatalogSnapshot::load(&config.catalog.snapshot_path)
            .await
            .unwrap(),
    );
    let features = Arc::new(FeatureCache::new(&config.cache, catalog.clone()));
    let (outcomes, _) = OutcomeRecorder::spawn(
        config.outcomes.channel_capacity,
        Arc::new(TracingOutcomeSink),
    );

    let orchestrator = RecommendationOrchestrator::new(
        &config,
        artifacts,
        features,
        catalog,
        ScorerSet::standard(&config.scoring),
        outcomes,
    )
    .unwrap();

    web::Data::new(RecommendationHandlerState {
        orchestrator: Arc::new(orchestrator),
    })
}

#[actix_web::test]
async fn test_fixture_service_end_to_end() {
    let app = test::init_service(
        App::new()
            .app_data(fixture_state().await)
            .configure(configure),
    )
    .await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/ready").to_request()).await;
    assert!(resp.status().is_success());
    let readiness: serde_json::Value = test::read_body_json(resp).await;
    assert!(readiness["artifact_loaded_at"]["cf-factors"].is_string());
    assert!(readiness["artifact_loaded_at"]["popularity"].is_string());

    // Warm user, every strategy available.
    let req = test::TestRequest::post()
        .uri("/api/v1/recommendations")
        .set_json(serde_json::json!({
            "user_id": "alice",
            "list_length": 4,
            "experiment_ids": ["home-feed-ranking"],
            "context": {"device": "ios", "locale": "en-US"}
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers().get(DEGRADED_HEADER).unwrap().to_str().unwrap(),
        "false"
    );

    let body: RankedResponse = test::read_body_json(resp).await;
    assert_eq!(body.status, ResponseStatus::Complete);
    assert_eq!(body.items.len(), 4);
    assert_eq!(body.assignments.len(), 1);
    assert_eq!(body.artifact_versions["cf-factors"], 1);
    assert_eq!(body.artifact_versions["popularity"], 1);

    // m4 has no factors and only 5 exposures.
    let m4 = body.items.iter().find(|item| item.item_id == "m4").unwrap();
    assert!(m4.cold);
    let m1 = body.items.iter().find(|item| item.item_id == "m1").unwrap();
    assert!(!m1.cold);

    // Explicit pool, cold user.
    let req = test::TestRequest::post()
        .uri("/api/v1/recommendations")
        .set_json(serde_json::json!({
            "user_id": "bob",
            "list_length": 2,
            "candidate_pool_hint": {"items": ["m1", "m2", "m4"]}
        }))
        .to_request();
    let body: RankedResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body.items.len(), 2);
    assert!(body.items.iter().all(|item| item.cold));

    let req = test::TestRequest::get()
        .uri("/api/v1/items/m1/similar?limit=2")
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["items"][0]["item_id"], "m3");

    let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
    assert!(resp.status().is_success());
    let body = test::read_body(resp).await;
    assert!(String::from_utf8_lossy(&body).contains("recommendation_requests_total"));
}
