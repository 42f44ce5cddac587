//! Search API handlers.
use crate::api::error::{
    ApiError, api_bad_request, api_conflict, api_forbidden, api_system_error, success,
    success_with_debug,
};
use crate::api::types::{MAX_BATCH, SearchRequestBody, subjects_body};
use crate::app::AppState;
use crate::auth::ClientId;
use crate::metrics::now_unix;
use argus_index::{SearchDebug, SearchError};
use argus_snapshot::SnapshotError;
use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};

fn search_error(err: SearchError) -> ApiError {
    api_system_error(&err.to_string())
}

/// search godoc: search the subjects holding permission on
/// system/action/resource.
#[utoipa::path(
    post,
    path = "/api/v1/search",
    tag = "search",
    request_body = SearchRequestBody,
    params(
        ("debug" = Option<String>, Query, description = "Echo engine steps and queries")
    ),
    responses(
        (status = 200, description = "Matching subjects, deduplicated and limit-bounded"),
        (status = 400, description = "Validation failed", body = ErrorBody),
        (status = 401, description = "Authentication failed", body = ErrorBody)
    )
)]
pub async fn search(
    State(state): State<AppState>,
    Extension(ClientId(client_id)): Extension<ClientId>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<SearchRequestBody>,
) -> Result<Json<Value>, ApiError> {
    body.validate().map_err(|message| api_bad_request(&message))?;

    if !state.auth.is_super_client(&client_id) {
        state
            .auth
            .validate_system_client(&body.system, &client_id)
            .await
            .map_err(|err| err.into_api_error())?;
    }

    let request = body.into_domain(now_unix());

    let mut debug = params
        .contains_key("debug")
        .then(SearchDebug::default);
    let subjects = state
        .index
        .search(&request, debug.as_mut())
        .await
        .map_err(search_error)?;

    Ok(success_with_debug(
        json!({"subjects": subjects_body(subjects)}),
        debug.map(|entry| serde_json::to_value(entry).unwrap_or(Value::Null)),
    ))
}

/// batch-search godoc: run several searches in one round-trip.
#[utoipa::path(
    post,
    path = "/api/v1/batch-search",
    tag = "search",
    request_body = Vec<SearchRequestBody>,
    responses(
        (status = 200, description = "Per-request subject lists, positionally aligned"),
        (status = 400, description = "Validation failed", body = ErrorBody),
        (status = 401, description = "Authentication failed", body = ErrorBody)
    )
)]
pub async fn batch_search(
    State(state): State<AppState>,
    Extension(ClientId(client_id)): Extension<ClientId>,
    Json(body): Json<Vec<SearchRequestBody>>,
) -> Result<Json<Value>, ApiError> {

    if body.len() > MAX_BATCH {
        return Err(api_bad_request(&format!(
            "batch size must not exceed {MAX_BATCH}"
        )));
    }
    for request in &body {
        request
            .validate()
            .map_err(|message| api_bad_request(&message))?;
    }

    if !state.auth.is_super_client(&client_id) {
        let systems: HashSet<&str> = body.iter().map(|request| request.system.as_str()).collect();
        for system in systems {
            state
                .auth
                .validate_system_client(system, &client_id)
                .await
                .map_err(|err| err.into_api_error())?;
        }
    }

    let now = now_unix();
    let requests: Vec<_> = body
        .into_iter()
        .map(|request| request.into_domain(now))
        .collect();

    let results = state
        .index
        .batch_search(&requests)
        .await
        .map_err(search_error)?;
    let results: Vec<_> = results.into_iter().map(subjects_body).collect();

    Ok(success(json!({"results": results})))
}

/// stats godoc: per-action index sizes, or the global totals for super
/// callers.
#[utoipa::path(
    get,
    path = "/api/v1/stats",
    tag = "search",
    params(
        ("system" = Option<String>, Query, description = "System identifier"),
        ("action" = Option<String>, Query, description = "Action identifier")
    ),
    responses(
        (status = 200, description = "Engine sizes"),
        (status = 403, description = "Global stats need a super caller", body = ErrorBody)
    )
)]
pub async fn stats(
    State(state): State<AppState>,
    Extension(ClientId(client_id)): Extension<ClientId>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let system = params.get("system").cloned().unwrap_or_default();
    let action = params.get("action").cloned().unwrap_or_default();

    if !system.is_empty() && !action.is_empty() {
        if !state.auth.is_super_client(&client_id) {
            state
                .auth
                .validate_system_client(&system, &client_id)
                .await
                .map_err(|err| err.into_api_error())?;
        }
        let stats = state.index.stats(&system, &action).await;
        return Ok(success(json!({
            "doc": stats.doc,
            "eval": stats.eval,
            "total": stats.total,
        })));
    }

    if !state.auth.is_super_client(&client_id) {
        return Err(api_forbidden(
            "only a super app code can access the global stats",
        ));
    }

    let stats = state.index.total_stats().await;
    let full_sync_last_time = read_time(state.snapshot_store.full_sync_last_time());
    let incr_sync_last_time = read_time(state.snapshot_store.incr_sync_last_time());
    Ok(success(json!({
        "doc": stats.doc,
        "eval": stats.eval,
        "total": stats.total,
        "full_sync_last_time": full_sync_last_time,
        "incr_sync_last_time": incr_sync_last_time,
    })))
}

fn read_time(result: Result<i64, SnapshotError>) -> i64 {
    result.unwrap_or(0)
}

/// full-sync godoc: trigger a full sync; 409 while one is already running.
#[utoipa::path(
    post,
    path = "/api/v1/full-sync",
    tag = "search",
    responses(
        (status = 200, description = "Full sync triggered"),
        (status = 403, description = "Super caller required", body = ErrorBody),
        (status = 409, description = "A full sync is already in flight", body = ErrorBody)
    )
)]
pub async fn full_sync(
    State(state): State<AppState>,
    Extension(ClientId(client_id)): Extension<ClientId>,
) -> Result<Json<Value>, ApiError> {
    if !state.auth.is_super_client(&client_id) {
        return Err(api_forbidden("only a super app code can trigger full sync"));
    }

    state
        .full_sync_tx
        .try_send(())
        .map_err(|_| api_conflict("a full sync is already in flight"))?;

    Ok(success(Value::Null))
}
