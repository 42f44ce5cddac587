//! Document store abstraction behind the document engine.
//!
//! The engine builds typed queries and policy documents; a store executes
//! them. Production runs against Elasticsearch over REST, tests and local
//! development run against the in-memory store.
use crate::doc::query::{Query, SearchBody};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("document store rejected request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Counts a swallowed document-store failure; alerting keys off this
/// alongside the error logs.
pub(crate) fn record_store_error(op: &'static str) {
    metrics::counter!("argus_engine_doc_store_errors_total", "op" => op).increment(1);
}

/// Per-item outcome tally of a bulk call. Deletes of absent documents are
/// counted, not failed: delete events may be replayed by the queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BulkSummary {
    pub succeeded: usize,
    pub not_found: usize,
    pub failed: usize,
}

/// One msearch response: the restricted `_source` of each hit.
#[derive(Debug, Default, Clone)]
pub struct SearchResponse {
    pub hits: Vec<Value>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Upserts documents keyed by policy id.
    async fn bulk_index(&self, docs: Vec<(i64, Value)>) -> StoreResult<BulkSummary>;

    /// Deletes documents by policy id.
    async fn bulk_delete(&self, ids: &[i64]) -> StoreResult<BulkSummary>;

    /// Executes all searches in one round-trip; responses are positionally
    /// aligned with the request slice.
    async fn msearch(&self, searches: &[SearchBody]) -> StoreResult<Vec<SearchResponse>>;

    /// Deletes everything matching the query, returning the count removed.
    async fn delete_by_query(&self, query: &Query) -> StoreResult<u64>;

    async fn count(&self, query: &Query) -> StoreResult<u64>;

    async fn ping(&self) -> StoreResult<()>;

    fn backend_name(&self) -> &'static str;
}
