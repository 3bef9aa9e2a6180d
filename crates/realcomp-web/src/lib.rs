//! JSON routes over the reconciliation engine.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use realcomp_core::{MarketDataPoint, MarketLocation, Property, PropertyFilters, PropertyRef};
use realcomp_storage::StorageError;
use realcomp_sync::{ReconciliationEngine, SyncSummary};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "realcomp-web";

/// Query keys that shape a search without filtering it.
const CONTROL_PARAMS: &[&str] = &["limit", "refresh"];

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    pub default_sync_limit: usize,
}

impl AppState {
    pub fn new(engine: Arc<ReconciliationEngine>, default_sync_limit: usize) -> Self {
        Self {
            engine,
            default_sync_limit,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Storage(err) => {
                error!(error = %err, "storage failure while serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketDataQuery {
    city: Option<String>,
    state: Option<String>,
    zip_code: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SyncQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/properties/search", get(search_handler))
        .route("/api/properties/{id}", get(property_handler))
        .route("/api/market-data", get(market_data_handler))
        .route("/api/mls/sync", post(mls_sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Vec<Property>> {
    let has_filter = params
        .iter()
        .any(|(k, v)| !CONTROL_PARAMS.contains(&k.as_str()) && !v.trim().is_empty());
    if !has_filter {
        return Err(ApiError::BadRequest(
            "at least one search parameter is required".into(),
        ));
    }

    let filters = PropertyFilters::from_params(&params);
    let refresh = params
        .get("refresh")
        .is_some_and(|v| matches!(v.as_str(), "1" | "true"));
    let results = if refresh {
        state.engine.refresh_search(&filters).await?
    } else {
        state.engine.search_properties(&filters).await?
    };
    Ok(Json(results))
}

async fn property_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Property> {
    let not_found = || ApiError::NotFound(format!("property {id} not found"));
    let reference = PropertyRef::parse(&id).ok_or_else(not_found)?;
    state
        .engine
        .get_property_details(&reference)
        .await?
        .map(Json)
        .ok_or_else(not_found)
}

async fn market_data_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MarketDataQuery>,
) -> ApiResult<Vec<MarketDataPoint>> {
    let required = |value: Option<String>| value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let (Some(city), Some(st)) = (required(query.city), required(query.state)) else {
        return Err(ApiError::BadRequest("city and state are required".into()));
    };
    let location = MarketLocation::new(city, st, query.zip_code);
    Ok(Json(state.engine.get_market_data(&location).await?))
}

async fn mls_sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Json<SyncSummary> {
    let limit = query.limit.unwrap_or(state.default_sync_limit);
    Json(state.engine.synchronize_mls_data(limit).await)
}
