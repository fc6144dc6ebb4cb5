use actix_web::{web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recommendation_service::config::Config;
use recommendation_service::handlers::{configure, RecommendationHandlerState};
use recommendation_service::services::{
    ArtifactStore, CatalogSnapshot, FeatureCache, FsArtifactSource, OutcomeRecorder,
    RecommendationOrchestrator, ScorerSet, TracingOutcomeSink,
};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,recommendation_service=debug".into());

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        "Starting {} v{}",
        config.service.service_name,
        env!("CARGO_PKG_VERSION")
    );

    // Scoring artifacts. Kinds that fail to load stay unavailable and the
    // strategies depending on them are skipped until a reload succeeds.
    let artifacts = Arc::new(ArtifactStore::new(Arc::new(FsArtifactSource::new(
        &config.artifacts.root_dir,
    ))));
    artifacts.initialize().await;
    let (_refresher_shutdown, _refresher) = artifacts.spawn_refresher(Duration::from_secs(
        config.artifacts.refresh_interval_secs,
    ));

    // Attribute store and feature cache
    let catalog = Arc::new(
        CatalogSnapshot::load(&config.catalog.snapshot_path)
            .await
            .context("Failed to load catalog snapshot")?,
    );
    let features = Arc::new(FeatureCache::new(&config.cache, catalog.clone()));
    let (_maintenance_shutdown, _maintenance) = features.spawn_maintenance(Duration::from_secs(
        config.cache.maintenance_interval_secs,
    ));

    let (outcomes, _outcome_drain) =
        OutcomeRecorder::spawn(config.outcomes.channel_capacity, Arc::new(TracingOutcomeSink));

    let orchestrator = RecommendationOrchestrator::new(
        &config,
        artifacts,
        features,
        catalog,
        ScorerSet::standard(&config.scoring),
        outcomes,
    )
    .context("Failed to initialize recommendation orchestrator")?;

    let state = web::Data::new(RecommendationHandlerState {
        orchestrator: Arc::new(orchestrator),
    });

    let bind_addr = format!("{}:{}", config.service.http_host, config.service.http_port);
    tracing::info!("HTTP server listening on {}", bind_addr);

    HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
        .bind(&bind_addr)
        .with_context(|| format!("Failed to bind {}", bind_addr))?
        .run()
        .await
        .context("HTTP server error")?;

    Ok(())
}
