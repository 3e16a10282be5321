//! Admin HTTP surface: health, stats, invalidation, warming, snapshots and
//! refresh subscriptions, plus a cached quote read for manual checks.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use lib_quotecache::markets::Interval;
use lib_quotecache::{CacheEngine, CacheError, CacheKey, CacheType, Invalidation};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Cache(CacheError),
}

impl From<CacheError> for AppError {
    fn from(e: CacheError) -> Self {
        AppError::Cache(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Cache(CacheError::Upstream(e)) => (StatusCode::BAD_GATEWAY, e.to_string()),
            AppError::Cache(CacheError::Configuration(msg)) => (StatusCode::BAD_REQUEST, msg),
            AppError::Cache(e) => {
                error!(error = %e, "admin request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Body of `POST /invalidate`. Exactly one scope must be given.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateRequest {
    pub key: Option<String>,
    pub namespace: Option<String>,
    pub prefix: Option<String>,
    #[serde(default)]
    pub all: bool,
}

impl InvalidateRequest {
    pub fn scope(&self) -> Result<Invalidation, AppError> {
        let given = usize::from(self.key.is_some())
            + usize::from(self.namespace.is_some())
            + usize::from(self.prefix.is_some())
            + usize::from(self.all);
        if given != 1 {
            return Err(AppError::BadRequest("give exactly one of key, namespace, prefix or all".into()));
        }

        if let Some(key) = &self.key {
            return key.parse::<CacheKey>().map(Invalidation::Key).map_err(AppError::BadRequest);
        }
        if let Some(ns) = &self.namespace {
            return ns.parse::<CacheType>().map(Invalidation::Namespace).map_err(AppError::BadRequest);
        }
        if let Some(prefix) = &self.prefix {
            return Ok(Invalidation::Prefix(prefix.clone()));
        }
        Ok(Invalidation::All)
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionRequest {
    pub symbol: String,
    pub interval: Interval,
}

pub fn router(engine: Arc<CacheEngine>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/quote/{exchange}/{symbol}", get(quote_handler))
        .route("/invalidate", post(invalidate_handler))
        .route("/warm", post(warm_handler))
        .route("/snapshot", post(snapshot_handler))
        .route("/subscribe", post(subscribe_handler))
        .route("/unsubscribe", post(unsubscribe_handler))
        .with_state(engine)
}

/// Serves the admin router until `cancel` fires.
pub async fn serve(addr: SocketAddr, engine: Arc<CacheEngine>, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin surface listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            info!("admin surface shutting down");
        })
        .await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn stats_handler(State(engine): State<Arc<CacheEngine>>) -> impl IntoResponse {
    Json(engine.stats())
}

async fn quote_handler(
    State(engine): State<Arc<CacheEngine>>,
    Path((exchange, symbol)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let quote = engine.quote(&symbol, &exchange).await?;
    Ok(Json(quote))
}

async fn invalidate_handler(
    State(engine): State<Arc<CacheEngine>>,
    Json(body): Json<InvalidateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let removed = engine.invalidate(body.scope()?).await;
    Ok(Json(json!({ "removed": removed })))
}

async fn warm_handler(State(engine): State<Arc<CacheEngine>>) -> impl IntoResponse {
    Json(engine.warm_now().await)
}

async fn snapshot_handler(State(engine): State<Arc<CacheEngine>>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(engine.snapshot_now().await?))
}

async fn subscribe_handler(
    State(engine): State<Arc<CacheEngine>>,
    Json(body): Json<SubscriptionRequest>,
) -> impl IntoResponse {
    let ref_count = engine.subscribe(&body.symbol, body.interval);
    Json(json!({ "symbol": body.symbol, "interval": body.interval, "refCount": ref_count }))
}

async fn unsubscribe_handler(
    State(engine): State<Arc<CacheEngine>>,
    Json(body): Json<SubscriptionRequest>,
) -> impl IntoResponse {
    let ref_count = engine.unsubscribe(&body.symbol, body.interval).await;
    Json(json!({ "symbol": body.symbol, "interval": body.interval, "refCount": ref_count }))
}
