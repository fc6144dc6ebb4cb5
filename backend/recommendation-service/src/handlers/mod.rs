/// Recommendation API Handlers
///
/// HTTP endpoints for ranked recommendations, similar items and health checks
use actix_web::{get, post, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{RecommendationRequest, SimilarItem};
use crate::services::RecommendationOrchestrator;

/// Set on every ranked response; `true` when any signal was missing.
pub const DEGRADED_HEADER: &str = "x-recommendation-degraded";

/// Query parameters for GET /api/v1/items/{item_id}/similar
#[derive(Debug, Deserialize)]
pub struct SimilarItemsQuery {
    /// Number of similar items to return (default: 10)
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Serialize)]
pub struct SimilarItemsResponse {
    pub item_id: String,
    pub items: Vec<SimilarItem>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub artifact_versions: BTreeMap<String, u64>,
    pub artifact_loaded_at: BTreeMap<String, DateTime<Utc>>,
}

/// Handler state for recommendation endpoints
pub struct RecommendationHandlerState {
    pub orchestrator: Arc<RecommendationOrchestrator>,
}

/// POST /api/v1/recommendations
/// Rank candidates for a user
#[post("/api/v1/recommendations")]
pub async fn get_recommendations(
    body: web::Json<RecommendationRequest>,
    state: web::Data<RecommendationHandlerState>,
) -> Result<HttpResponse> {
    let request = body.into_inner();
    debug!(
        user_id = %request.user_id,
        list_length = request.list_length,
        "Getting recommendations"
    );

    let response = state.orchestrator.recommend(request).await?;
    let degraded = if response.is_degraded() { "true" } else { "false" };

    Ok(HttpResponse::Ok()
        .insert_header((DEGRADED_HEADER, degraded))
        .json(response))
}

/// GET /api/v1/items/{item_id}/similar
#[get("/api/v1/items/{item_id}/similar")]
pub async fn get_similar_items(
    path: web::Path<String>,
    query: web::Query<SimilarItemsQuery>,
    state: web::Data<RecommendationHandlerState>,
) -> Result<HttpResponse> {
    let item_id = path.into_inner();
    debug!(item_id = %item_id, limit = query.limit, "Getting similar items");

    let items = state
        .orchestrator
        .similar_items(&item_id, query.limit)
        .await?;

    Ok(HttpResponse::Ok().json(SimilarItemsResponse {
        count: items.len(),
        item_id,
        items,
    }))
}

#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Ready once every artifact kind has a loaded version.
#[get("/ready")]
pub async fn ready(state: web::Data<RecommendationHandlerState>) -> HttpResponse {
    let artifacts = state.orchestrator.artifacts();
    let snapshot = artifacts.snapshot();
    let body = ReadinessResponse {
        ready: artifacts.is_ready(),
        artifact_versions: snapshot.versions(),
        artifact_loaded_at: snapshot.loaded_at(),
    };

    if body.ready {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

#[get("/metrics")]
pub async fn metrics_endpoint() -> Result<HttpResponse> {
    let (content_type, body) = metrics::render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        AppError::Internal(e.to_string())
    })?;

    Ok(HttpResponse::Ok().content_type(content_type).body(body))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_recommendations)
        .service(get_similar_items)
        .service(health)
        .service(ready)
        .service(metrics_endpoint);
}
