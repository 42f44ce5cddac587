//! API error envelope and helpers.
//!
//! Every response carries the `{code, message, data}` envelope; `code` 0 is
//! success, anything else names the failure class.
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use serde_json::{Value, json};
use utoipa::ToSchema;

pub const CODE_OK: i64 = 0;
pub const CODE_BAD_REQUEST: i64 = 40000;
pub const CODE_UNAUTHORIZED: i64 = 40100;
pub const CODE_FORBIDDEN: i64 = 40300;
pub const CODE_CONFLICT: i64 = 40900;
pub const CODE_SYSTEM_ERROR: i64 = 50000;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
    #[schema(value_type = Object, nullable)]
    pub data: Value,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn envelope(status: StatusCode, code: i64, message: &str) -> ApiError {
    ApiError {
        status,
        body: ErrorBody {
            code,
            message: message.to_string(),
            data: Value::Null,
        },
    }
}

pub fn api_bad_request(message: &str) -> ApiError {
    envelope(StatusCode::BAD_REQUEST, CODE_BAD_REQUEST, message)
}

pub fn api_unauthorized(message: &str) -> ApiError {
    envelope(StatusCode::UNAUTHORIZED, CODE_UNAUTHORIZED, message)
}

pub fn api_forbidden(message: &str) -> ApiError {
    envelope(StatusCode::FORBIDDEN, CODE_FORBIDDEN, message)
}

pub fn api_conflict(message: &str) -> ApiError {
    envelope(StatusCode::CONFLICT, CODE_CONFLICT, message)
}

pub fn api_system_error(message: &str) -> ApiError {
    tracing::error!(%message, "request failed");
    envelope(StatusCode::INTERNAL_SERVER_ERROR, CODE_SYSTEM_ERROR, message)
}

/// The success envelope.
pub fn success(data: Value) -> Json<Value> {
    Json(json!({
        "code": CODE_OK,
        "message": "ok",
        "data": data,
    }))
}

pub fn success_with_debug(data: Value, debug: Option<Value>) -> Json<Value> {
    match debug {
        Some(debug) => Json(json!({
            "code": CODE_OK,
            "message": "ok",
            "data": data,
            "debug": debug,
        })),
        None => success(data),
    }
}
