// Handlers HTTP : une fine couche au-dessus de `QueryService`.
// Les erreurs remontent sous forme d'`AppError`, converties en réponse JSON `success = false`.
use crate::app_state::AppState;
use crate::cache::CacheStats;
use crate::config::DatabaseConfig;
use crate::database;
use crate::error::{AppError, AppResult};
use crate::models::{
    ConnectionTestResult, HealthStatus, LegacyQueryRequest, LegacyQueryResponse, QueryRequest,
    QueryResponse, TagSearchParams,
};
use crate::pool::PoolState;
use crate::warmup::{WarmupProgress, WarmupTask};
use axum::{
    body::Bytes,
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use std::time::SystemTime;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/query", post(query_handler))
        .route("/api/query/legacy", post(legacy_query_handler))
        .route("/api/tags/search", get(tag_search_handler))
        .route("/api/cache/stats", get(cache_stats_handler))
        .route("/api/cache/clear", post(cache_clear_handler))
        .route("/api/cache/warmup", post(cache_warmup_handler))
        .route("/api/pool/state", get(pool_state_handler))
        .route("/api/connection/test", post(connection_test_handler))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// POST `/api/query` : réponse groupée par tag.
pub async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> AppResult<Json<QueryResponse>> {
    let response = state.service.query(request).await?;
    Ok(Json(response))
}

// POST `/api/query/legacy` : un enregistrement par point, paginé.
pub async fn legacy_query_handler(
    State(state): State<AppState>,
    Json(request): Json<LegacyQueryRequest>,
) -> AppResult<Json<LegacyQueryResponse>> {
    let response = state.service.query_legacy(request).await?;
    Ok(Json(response))
}

pub async fn tag_search_handler(
    State(state): State<AppState>,
    Query(params): Query<TagSearchParams>,
) -> AppResult<Json<Vec<String>>> {
    let tags = state
        .service
        .search_tags(params.profile.as_deref(), &params.keyword, params.limit)
        .await?;
    Ok(Json(tags))
}

pub async fn cache_stats_handler(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.service.cache_stats())
}

pub async fn cache_clear_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.service.clear_cache();
    Json(serde_json::json!({"status": "ok"}))
}

pub async fn cache_warmup_handler(
    State(state): State<AppState>,
    Json(tasks): Json<Vec<WarmupTask>>,
) -> Json<WarmupProgress> {
    info!(tasks = tasks.len(), "Cache warmup requested");
    Json(state.service.warmup(tasks, None).await)
}

// `null` tant qu'aucune connexion n'a été ouverte.
pub async fn pool_state_handler(State(state): State<AppState>) -> Json<Option<PoolState>> {
    Json(state.service.pool_state())
}

// POST `/api/connection/test` : corps vide pour tester la base configurée,
// ou un `DatabaseConfig` pour tester une autre base sans toucher au pool.
pub async fn connection_test_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<ConnectionTestResult>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Json(state.service.test_connection().await));
    }

    let config: DatabaseConfig = serde_json::from_slice(&body)
        .map_err(|e| AppError::Config(format!("invalid database config: {}", e)))?;
    Ok(Json(database::test_connection(&config).await))
}

// GET `/health` : emprunte et rend une connexion du pool.
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthStatus>> {
    if let Err(e) = state.service.health_check().await {
        error!(error = %e, "Health check failed: no usable database connection");
        return Err(e);
    }
    Ok(Json(HealthStatus {
        status: "healthy".to_string(),
        timestamp: current_timestamp(),
    }))
}

fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
