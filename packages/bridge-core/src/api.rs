//! Read-only operator HTTP surface: `/health`, `/metrics`, `/config`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{AllowMethods, AllowOrigin, CorsLayer};
use tracing::info;

use crate::{relayer::Relayer, Error};

#[derive(Clone)]
pub struct AppState {
    pub relayer: Arc<Relayer>,
}

/// 200 when both ledgers answer, 503 otherwise. Same body either way.
async fn health(State(state): State<AppState>) -> Response {
    let status = state.relayer.status().await;
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status)).into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    Json(state.relayer.status().await).into_response()
}

async fn config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.relayer.config().sanitized())
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}

/// Any origin may read the operator endpoints; preflight requests get 200.
pub fn router(relayer: Arc<Relayer>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(AllowMethods::any())
        .allow_origin(AllowOrigin::any())
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/config", get(config))
        .fallback(not_found)
        .layer(cors)
        .with_state(AppState { relayer })
}

pub async fn bind(bind_address: &str, port: u16) -> Result<TcpListener, Error> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid bind address {}:{}: {}", bind_address, port, e)))?;
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Network(format!("Failed to bind {}: {}", addr, e)))
}

/// Serves until `shutdown` resolves, then finishes in-flight requests.
pub async fn serve<F>(listener: TcpListener, relayer: Arc<Relayer>, shutdown: F) -> Result<(), Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Health server listening on {}", addr);
    }
    axum::serve(listener, router(relayer))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Network(format!("Health server failed: {}", e)))
}
