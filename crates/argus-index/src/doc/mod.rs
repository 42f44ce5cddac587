//! Document engine: `any` and term-representable policies in an inverted
//! index, queried with structured boolean filters.
pub mod document;
pub mod elastic;
pub mod memory;
pub mod query;
pub mod store;

use crate::doc::query::{SearchBody, any_query, doc_query, page_size};
use crate::doc::store::{BulkSummary, DocumentStore, SearchResponse, StoreResult, record_store_error};
use argus_policy::{Policy, SearchRequest, Subject};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct DocEngine {
    store: Arc<dyn DocumentStore>,
}

/// Subjects returned by the two sub-queries of one search, any-grants
/// first. Order within each list follows the store's stable hit order.
#[derive(Debug, Default)]
pub struct DocSearchResult {
    pub any_subjects: Vec<Subject>,
    pub doc_subjects: Vec<Subject>,
}

impl DocSearchResult {
    pub fn subjects(self) -> impl Iterator<Item = Subject> {
        self.any_subjects.into_iter().chain(self.doc_subjects)
    }
}

impl DocEngine {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.store.ping().await
    }

    /// Indexes a batch of `any`/`doc` policies. Policies whose expression
    /// cannot be projected into a document are logged and skipped; they are
    /// a classifier defect, not a reason to drop the batch.
    pub async fn bulk_add(&self, policies: &[Policy]) -> StoreResult<BulkSummary> {
        let mut docs = Vec::with_capacity(policies.len());
        for policy in policies {
            match document::make_doc(policy) {
                Ok(doc) => docs.push((policy.id, doc)),
                Err(err) => {
                    warn!(policy_id = policy.id, error = %err, "skip unprojectable policy");
                }
            }
        }
        if docs.is_empty() {
            return Ok(BulkSummary::default());
        }
        self.store.bulk_index(docs).await
    }

    pub async fn bulk_delete(&self, ids: &[i64]) -> StoreResult<BulkSummary> {
        if ids.is_empty() {
            return Ok(BulkSummary::default());
        }
        self.store.bulk_delete(ids).await
    }

    pub async fn bulk_delete_by_subjects(
        &self,
        before_updated_at: i64,
        subjects: &[Subject],
    ) -> StoreResult<u64> {
        if subjects.is_empty() {
            return Ok(0);
        }
        self.store
            .delete_by_query(&query::subjects_query(before_updated_at, subjects))
            .await
    }

    pub async fn bulk_delete_by_template_subjects(
        &self,
        before_updated_at: i64,
        template_id: i64,
        subjects: &[Subject],
    ) -> StoreResult<u64> {
        if subjects.is_empty() {
            return Ok(0);
        }
        self.store
            .delete_by_query(&query::template_subjects_query(
                before_updated_at,
                template_id,
                subjects,
            ))
            .await
    }

    fn request_bodies(req: &SearchRequest) -> Vec<SearchBody> {
        let size = page_size(req);
        vec![
            SearchBody {
                query: any_query(req),
                size,
            },
            SearchBody {
                query: doc_query(req),
                size,
            },
        ]
    }

    pub async fn search(&self, req: &SearchRequest) -> StoreResult<DocSearchResult> {
        let responses = self.store.msearch(&Self::request_bodies(req)).await?;
        Ok(Self::split_responses(&responses))
    }

    /// All requests share one msearch round-trip; responses come back in
    /// pairs, positionally aligned with the request slice.
    pub async fn batch_search(&self, reqs: &[SearchRequest]) -> StoreResult<Vec<DocSearchResult>> {
        let mut searches = Vec::with_capacity(reqs.len() * 2);
        for req in reqs {
            searches.extend(Self::request_bodies(req));
        }
        let responses = self.store.msearch(&searches).await?;
        Ok(responses
            .chunks(2)
            .map(Self::split_responses)
            .collect())
    }

    fn split_responses(responses: &[SearchResponse]) -> DocSearchResult {
        let mut result = DocSearchResult::default();
        if let Some(any) = responses.first() {
            result.any_subjects = parse_subjects(&any.hits);
        }
        if let Some(doc) = responses.get(1) {
            result.doc_subjects = parse_subjects(&doc.hits);
        }
        result
    }

    pub async fn size(&self, system: &str, action: &str) -> u64 {
        self.store
            .count(&query::action_count_query(system, action))
            .await
            .unwrap_or_else(|err| {
                record_store_error("count");
                warn!(error = %err, "doc engine count failed");
                0
            })
    }

    pub async fn total(&self) -> u64 {
        self.store
            .count(&query::Query::MatchAll)
            .await
            .unwrap_or_else(|err| {
                record_store_error("count");
                warn!(error = %err, "doc engine total failed");
                0
            })
    }
}

fn parse_subjects(hits: &[Value]) -> Vec<Subject> {
    let mut subjects = Vec::with_capacity(hits.len());
    for hit in hits {
        match serde_json::from_value::<Subject>(hit["subject"].clone()) {
            Ok(mut subject) => {
                subject.fill_uid();
                subjects.push(subject);
            }
            Err(err) => warn!(error = %err, "drop hit with malformed subject"),
        }
    }
    subjects
}
