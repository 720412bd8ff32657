use crate::config::ApiConfig;
use crate::metadata::StoredObject;
use crate::store::{StoreStats, TieredStore};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TieredStore>,
}

/// Object metadata in API responses. Never carries payload bytes or crypto
/// parameters.
#[derive(Debug, Serialize)]
pub struct ObjectResponse {
    pub id: String,
    pub key: String,
    pub layer: u8,
    pub layer_name: &'static str,
    pub original_size: u64,
    pub stored_size: u64,
    pub compression_ratio: f64,
    pub chunk_count: usize,
    pub providers: Vec<String>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub temperature_score: f64,
    pub predicted_next_access: Option<DateTime<Utc>>,
    pub temporal_provider: Option<String>,
}

impl From<StoredObject> for ObjectResponse {
    fn from(o: StoredObject) -> Self {
        let providers = o.providers().into_iter().map(String::from).collect();
        Self {
            id: o.id,
            key: o.key,
            layer: o.layer.number(),
            layer_name: o.layer.spec().name,
            original_size: o.original_size,
            stored_size: o.encrypted_size,
            compression_ratio: o.compression_ratio,
            chunk_count: o.chunks.len(),
            providers,
            access_count: o.access_count,
            last_accessed: o.last_accessed,
            created: o.created,
            expires_at: o.expires_at,
            temperature_score: o.temperature_score,
            predicted_next_access: o.predicted_next_access,
            temporal_provider: o.temporal_provider,
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal_error(error: &str, code: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Create the ops router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/stats", get(get_stats))
        .route("/api/v1/objects/:id", get(get_object))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "strata-store"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.metadata().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "metadata": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "metadata": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state))]
async fn get_stats(State(state): State<AppState>) -> Result<Json<StoreStats>, ApiError> {
    state.store.stats().await.map(Json).map_err(|e| {
        error!(error = %e, "Failed to compute stats");
        internal_error("Failed to compute stats", "STATS_ERROR")
    })
}

/// Get single object metadata
#[instrument(skip(state))]
async fn get_object(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ObjectResponse>, ApiError> {
    let object = state.store.metadata().get(&id).await.map_err(|e| {
        error!(error = %e, "Failed to get object");
        internal_error("Failed to get object", "QUERY_ERROR")
    })?;

    match object {
        Some(o) => Ok(Json(o.into())),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Object not found".to_string(),
                code: "NOT_FOUND".to_string(),
            }),
        )),
    }
}

/// Start the ops API server, stopping when `shutdown` is cancelled
pub async fn start_api_server(state: AppState, config: &ApiConfig, shutdown: CancellationToken) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting ops API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayerConfig, StoreConfig};
    use crate::crypto::StaticSecretProvider;
    use crate::metadata::fixtures::object;
    use crate::metadata::InMemoryMetadataStore;
    use crate::provider::ProviderRegistry;
    use crate::store::StoreOptions;

    fn state() -> AppState {
        AppState {
            store: Arc::new(TieredStore::new(
                StoreConfig::default(),
                LayerConfig::default(),
                Arc::new(InMemoryMetadataStore::new()),
                Arc::new(ProviderRegistry::new().with_memory_defaults()),
                Arc::new(StaticSecretProvider::new(vec![1u8; 32]).unwrap()),
            )),
        }
    }

    #[test]
    fn test_object_response_from() {
        let response: ObjectResponse = object("abc").into();
        assert_eq!(response.layer, 2);
        assert_eq!(response.layer_name, "Zero-Egress Warm");
        assert_eq!(response.chunk_count, 1);
        assert_eq!(response.providers, vec!["warm".to_string()]);

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("iv").is_none());
        assert!(json.get("salt").is_none());
    }

    #[tokio::test]
    async fn test_get_object_handler() {
        let state = state();
        let receipt = state
            .store
            .store("k", b"visible metadata", StoreOptions::default())
            .await
            .unwrap();

        let Json(found) = get_object(State(state.clone()), Path(receipt.id.clone()))
            .await
            .unwrap();
        assert_eq!(found.id, receipt.id);
        assert_eq!(found.original_size, 16);

        let (status, _) = get_object(State(state), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_stats_handler() {
        let state = state();
        state.store.store("k", b"x", StoreOptions::default()).await.unwrap();
        let Json(stats) = get_stats(State(state)).await.unwrap();
        assert_eq!(stats.total_stored, 1);
    }
}
