use crate::cache::EnrichmentCache;
use crate::config::Config;
use crate::errors::AppError;
use crate::models::{BatchEnrichmentRequest, BatchEnrichmentResult, CostEstimate};
use crate::queue::EnrichmentQueueManager;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Enrichment orchestrator.
    pub manager: EnrichmentQueueManager,
    /// Cache handle, kept separately for the health endpoint's stats.
    pub cache: EnrichmentCache,
    /// Application configuration.
    pub config: Config,
}

/// Header carrying the tenant identity on every enrichment route.
const TENANT_HEADER: &str = "x-tenant-id";

fn tenant_id(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| AppError::BadRequest("X-Tenant-Id header is required".to_string()))
}

/// Health check endpoint.
///
/// Returns the service status plus cache counters. A failing stats query
/// degrades to a null cache block rather than failing the check.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let cache = match state.cache.stats().await {
        Ok(stats) => json!(stats),
        Err(e) => {
            tracing::warn!("Health check could not read cache stats: {}", e);
            json!(null)
        }
    };

    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "property-enrichment-api",
            "version": env!("CARGO_PKG_VERSION"),
            "providers": {
                "batchdata": state.config.batchdata_api_key.is_some(),
                "tracerfy": state.config.tracerfy_api_key.is_some(),
            },
            "cache": cache,
        })),
    )
}

/// POST /api/v1/enrichment/jobs
///
/// Submits a batch of addresses for enrichment. Responds 202 with a pollable
/// `job_id` when a background job was created, or 200 with a completed
/// synthetic result (estimate-only, or fully served from cache).
pub async fn create_enrichment_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<BatchEnrichmentRequest>,
) -> Result<(StatusCode, Json<BatchEnrichmentResult>), AppError> {
    let tenant = tenant_id(&headers)?;
    tracing::info!(
        "POST /enrichment/jobs - tenant: {}, addresses: {}, provider: {}",
        tenant,
        request.addresses.len(),
        request.provider
    );

    let result = state.manager.start_enrichment_job(&tenant, request).await?;
    let status = if result.job_id.is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(result)))
}

/// GET /api/v1/enrichment/jobs/:id
///
/// Polls the state of a previously submitted job. Jobs are scoped to the
/// requesting tenant; another tenant's job id reads as not found.
pub async fn get_enrichment_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<BatchEnrichmentResult>, AppError> {
    let tenant = tenant_id(&headers)?;
    tracing::debug!("GET /enrichment/jobs/{} - tenant: {}", id, tenant);

    state
        .manager
        .get_job_status(&tenant, id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Enrichment job {} not found", id)))
}

/// POST /api/v1/enrichment/estimate
///
/// Computes the cost projection for a batch without creating a job or calling
/// a provider. Equivalent to submitting with `estimate_only`, as a dedicated
/// route.
pub async fn estimate_enrichment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<BatchEnrichmentRequest>,
) -> Result<Json<CostEstimate>, AppError> {
    let tenant = tenant_id(&headers)?;
    tracing::info!(
        "POST /enrichment/estimate - tenant: {}, addresses: {}, provider: {}",
        tenant,
        request.addresses.len(),
        request.provider
    );

    let estimate = state
        .manager
        .estimate_cost(&request.addresses, request.provider, &request.options)
        .await?;

    Ok(Json(estimate))
}
