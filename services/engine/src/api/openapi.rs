//! OpenAPI document for the search API.
use crate::api::error::ErrorBody;
use crate::api::types::{ActionBody, ResourceNodeBody, SearchRequestBody, SubjectBody};
use crate::api::{basic, search};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "argus-engine",
        version = "v1",
        description = "Authorization search index: who can do X on Y"
    ),
    paths(
        basic::ping,
        basic::version,
        basic::healthz,
        search::search,
        search::batch_search,
        search::stats,
        search::full_sync
    ),
    components(schemas(
        ActionBody,
        ResourceNodeBody,
        SearchRequestBody,
        SubjectBody,
        ErrorBody
    )),
    tags(
        (name = "basic", description = "Liveness and identity"),
        (name = "search", description = "Subject search and index operations")
    )
)]
pub struct ApiDoc;
