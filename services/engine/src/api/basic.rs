//! Liveness, identity and readiness endpoints.
use crate::app::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::{Value, json};

/// ping godoc: cheap liveness probe.
#[utoipa::path(
    get,
    path = "/ping",
    tag = "basic",
    responses((status = 200, description = "The server is alive"))
)]
pub async fn ping() -> Json<Value> {
    Json(json!({"message": "pong"}))
}

/// version godoc: build identity.
#[utoipa::path(
    get,
    path = "/version",
    tag = "basic",
    responses((status = 200, description = "Version information"))
)]
pub async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "env": std::env::var("RUN_ENV").unwrap_or_default(),
    }))
}

/// healthz godoc: readiness; verifies the document store and the authority
/// are reachable.
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "basic",
    responses(
        (status = 200, description = "All dependencies reachable"),
        (status = 500, description = "A dependency is down")
    )
)]
pub async fn healthz(State(state): State<AppState>) -> Result<String, (StatusCode, String)> {
    if let Err(err) = state.index.doc_engine().ping().await {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ping document store failed: {err}"),
        ));
    }
    if let Err(err) = state.authority.ping().await {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ping authority failed: {err}"),
        ));
    }
    Ok("ok".to_string())
}
