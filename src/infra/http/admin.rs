//! Operator API: purges, cleanup, statistics, bundle maintenance and preload review.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::{
    application::error::AppError,
    assets::MergeEngine,
    cache::{CacheStore, EventKind, PurgeReport, PurgeTrigger, StoreStats},
    preload::{PassReport, PreloadRecommendationEngine, Recommendation, RejectedAt},
};

use super::middleware::{log_responses, set_request_id};

#[derive(Clone)]
pub struct AdminState {
    pub cache: Arc<CacheStore>,
    /// Content and settings notifications, drained by the purge consumer.
    pub trigger: Arc<PurgeTrigger>,
    pub merge: Arc<MergeEngine>,
    pub preload: Arc<PreloadRecommendationEngine>,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/purge/all", post(purge_all))
        .route("/purge/url", post(purge_url))
        .route("/purge/entity/{id}", post(purge_entity))
        .route("/events/entity/{id}", post(entity_changed))
        .route("/events/url", post(url_changed))
        .route("/events/settings", post(settings_changed))
        .route("/cache/cleanup", post(cleanup))
        .route("/cache/stats", get(stats))
        .route("/bundles/purge", post(purge_bundles))
        .route("/preload/recommendations", get(recommendations))
        .route("/preload/run", post(run_preload))
        .route("/preload/{id}/accept", post(accept_recommendation))
        .route("/preload/{id}/reject", post(reject_recommendation))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_id))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PurgeOptions {
    no_cdn: bool,
}

#[derive(Debug, Deserialize)]
struct PurgeUrlRequest {
    url: String,
    #[serde(default)]
    no_cdn: bool,
}

#[derive(Debug, Deserialize)]
struct UrlChangedRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct Queued {
    queued: usize,
}

#[derive(Debug, Serialize)]
struct Removed {
    removed: usize,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    pages: StoreStats,
    bundles: StoreStats,
}

#[derive(Debug, Serialize)]
struct RecommendationsResponse {
    recommendations: Vec<Recommendation>,
    /// Dismissed id -> RFC 3339 dismissal time.
    rejected: BTreeMap<String, RejectedAt>,
    #[serde(with = "time::serde::rfc3339::option")]
    last_run: Option<OffsetDateTime>,
}

async fn health() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn purge_all(
    State(state): State<AdminState>,
    options: Option<Json<PurgeOptions>>,
) -> Json<PurgeReport> {
    let options = options.map(|Json(options)| options).unwrap_or_default();
    Json(state.cache.purge_all(!options.no_cdn).await)
}

async fn purge_url(
    State(state): State<AdminState>,
    Json(request): Json<PurgeUrlRequest>,
) -> Result<Json<PurgeReport>, AppError> {
    let url = request.url.trim();
    if url.is_empty() {
        return Err(AppError::validation("url must not be empty"));
    }
    Ok(Json(state.cache.purge_url(url, !request.no_cdn).await))
}

async fn purge_entity(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
    options: Option<Json<PurgeOptions>>,
) -> Json<PurgeReport> {
    let options = options.map(|Json(options)| options).unwrap_or_default();
    Json(state.cache.purge_entity(id, !options.no_cdn).await)
}

async fn publish(state: &AdminState, kind: EventKind) -> (StatusCode, Json<Queued>) {
    state.trigger.trigger(kind, false).await;
    (
        StatusCode::ACCEPTED,
        Json(Queued {
            queued: state.trigger.queue().len(),
        }),
    )
}

async fn entity_changed(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
) -> (StatusCode, Json<Queued>) {
    publish(&state, EventKind::EntityChanged { entity_id: id }).await
}

async fn url_changed(
    State(state): State<AdminState>,
    Json(request): Json<UrlChangedRequest>,
) -> Result<(StatusCode, Json<Queued>), AppError> {
    let url = request.url.trim();
    if url.is_empty() {
        return Err(AppError::validation("url must not be empty"));
    }
    Ok(publish(&state, EventKind::UrlChanged { url: url.to_string() }).await)
}

async fn settings_changed(State(state): State<AdminState>) -> (StatusCode, Json<Queued>) {
    publish(&state, EventKind::SettingsChanged).await
}

async fn cleanup(State(state): State<AdminState>) -> Json<Removed> {
    Json(Removed {
        removed: state.cache.cleanup_expired(),
    })
}

async fn stats(State(state): State<AdminState>) -> Result<Json<StatsResponse>, AppError> {
    Ok(Json(StatsResponse {
        pages: state.cache.stats()?,
        bundles: state.merge.bundles().stats()?,
    }))
}

async fn purge_bundles(State(state): State<AdminState>) -> Result<Json<Removed>, AppError> {
    let removed = state.merge.bundles().purge_all()?;
    info!(removed, "Purged merged bundles");
    Ok(Json(Removed { removed }))
}

async fn recommendations(State(state): State<AdminState>) -> Json<RecommendationsResponse> {
    Json(RecommendationsResponse {
        recommendations: state.preload.recommendations(),
        rejected: state
            .preload
            .rejected()
            .into_iter()
            .map(|(id, at)| (id, RejectedAt(at)))
            .collect(),
        last_run: state.preload.last_run(),
    })
}

async fn run_preload(State(state): State<AdminState>) -> Result<Json<PassReport>, AppError> {
    Ok(Json(state.preload.run().await?))
}

async fn accept_recommendation(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Recommendation>, AppError> {
    Ok(Json(state.preload.accept(&id)?))
}

async fn reject_recommendation(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    state.preload.reject(&id)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
