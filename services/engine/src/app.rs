//! HTTP application wiring.
//!
//! # Purpose
//! Builds the Axum router, configures middleware, and defines the shared
//! application state injected into handlers. Route composition lives here
//! to keep `main` small and testable.
use crate::api;
use crate::api::openapi::ApiDoc;
use crate::auth::{self, AuthState};
use crate::metrics::record_api_request;
use argus_authority::AuthorityClient;
use argus_index::Index;
use argus_snapshot::SnapshotStore;
use axum::Router;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

#[derive(Clone)]
pub struct AppState {
    pub index: Arc<Index>,
    pub auth: Arc<AuthState>,
    pub authority: Arc<dyn AuthorityClient>,
    pub snapshot_store: Arc<SnapshotStore>,
    pub full_sync_tx: mpsc::Sender<()>,
}

pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/search", post(api::search::search))
        .route("/batch-search", post(api::search::batch_search))
        .route("/stats", get(api::search::stats))
        .route("/full-sync", post(api::search::full_sync))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::client_auth_middleware,
        ))
        .layer(axum::middleware::from_fn(api_metrics_middleware));

    Router::new()
        .route("/ping", get(api::basic::ping))
        .route("/version", get(api::basic::version))
        .route("/healthz", get(api::basic::healthz))
        .nest("/api/v1", api_routes)
        .merge(
            utoipa_swagger_ui::SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn api_metrics_middleware(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    // stamped by the auth middleware; absent when authentication failed
    let client_id = response
        .extensions()
        .get::<auth::ClientId>()
        .map(|auth::ClientId(client_id)| client_id.as_str())
        .unwrap_or_default();
    record_api_request(
        &method,
        &path,
        response.status().as_u16(),
        client_id,
        start.elapsed().as_secs_f64(),
    );
    response
}
