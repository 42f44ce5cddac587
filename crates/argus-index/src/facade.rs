//! Index facade: routes mutations between the two engines and fans
//! queries out across both.
//!
//! Mutation ordering matters: a reclassified policy is added to its new
//! engine before the stale copy is deleted from the sibling, so there is no
//! observable moment where the policy grants nothing.
use crate::doc::DocEngine;
use crate::doc::store::{StoreError, record_store_error};
use crate::eval::EvalEngine;
use argus_policy::classify::split_policies;
use argus_policy::{Policy, SearchRequest, SnapshotRecord, Subject};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

const SEARCH_DEADLINE: Duration = Duration::from_millis(100);
const BATCH_SEARCH_DEADLINE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("document engine search failed: {0}")]
    Doc(#[from] StoreError),
    #[error("search deadline exceeded")]
    Timeout,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct IndexStats {
    pub doc: u64,
    pub eval: u64,
    pub total: u64,
}

/// Echoed back to the caller when the request carries `?debug`.
#[derive(Debug, Default, Serialize)]
pub struct SearchDebug {
    pub steps: Vec<String>,
    pub queries: Vec<Value>,
    pub doc_subject_count: usize,
    pub eval_subject_count: usize,
}

impl SearchDebug {
    fn step(&mut self, step: &str) {
        self.steps.push(step.to_string());
    }
}

pub struct Index {
    doc: DocEngine,
    eval: EvalEngine,
}

impl Index {
    pub fn new(doc: DocEngine, eval: EvalEngine) -> Self {
        Self { doc, eval }
    }

    pub fn doc_engine(&self) -> &DocEngine {
        &self.doc
    }

    /// Classifies and routes a batch. Additions run before the sibling
    /// deletions; engine failures are logged and gauged, never propagated,
    /// because the next sync cycle re-converges.
    pub async fn bulk_upsert(&self, policies: Vec<Policy>) {
        let (eval_batch, doc_batch) = split_policies(policies);

        let eval_ids: Vec<i64> = eval_batch.iter().map(|p| p.id).collect();
        let doc_ids: Vec<i64> = doc_batch.iter().map(|p| p.id).collect();

        self.eval.bulk_add(eval_batch);
        if !eval_ids.is_empty() {
            if let Err(err) = self.doc.bulk_delete(&eval_ids).await {
                record_store_error("bulk_delete");
                error!(error = %err, "bulk_upsert: evict reclassified policies from doc engine failed");
            }
        }

        if !doc_batch.is_empty() {
            if let Err(err) = self.doc.bulk_add(&doc_batch).await {
                record_store_error("bulk_index");
                error!(error = %err, "bulk_upsert: doc engine add failed");
            }
        }
        if !doc_ids.is_empty() {
            self.eval.bulk_delete(&doc_ids);
        }
    }

    pub async fn bulk_delete(&self, ids: &[i64]) {
        if ids.is_empty() {
            return;
        }
        if let Err(err) = self.doc.bulk_delete(ids).await {
            record_store_error("bulk_delete");
            error!(error = %err, "bulk_delete: doc engine failed");
        }
        self.eval.bulk_delete(ids);
    }

    pub async fn bulk_delete_by_subjects(&self, before_updated_at: i64, subjects: &[Subject]) {
        if subjects.is_empty() {
            return;
        }
        if let Err(err) = self
            .doc
            .bulk_delete_by_subjects(before_updated_at, subjects)
            .await
        {
            record_store_error("delete_by_query");
            error!(error = %err, "bulk_delete_by_subjects: doc engine failed");
        }
        self.eval.bulk_delete_by_subjects(before_updated_at, subjects);
    }

    pub async fn bulk_delete_by_template_subjects(
        &self,
        before_updated_at: i64,
        template_id: i64,
        subjects: &[Subject],
    ) {
        if subjects.is_empty() {
            return;
        }
        if let Err(err) = self
            .doc
            .bulk_delete_by_template_subjects(before_updated_at, template_id, subjects)
            .await
        {
            record_store_error("delete_by_query");
            error!(error = %err, "bulk_delete_by_template_subjects: doc engine failed");
        }
        self.eval
            .bulk_delete_by_template_subjects(before_updated_at, template_id, subjects);
    }

    pub async fn search(
        &self,
        req: &SearchRequest,
        debug: Option<&mut SearchDebug>,
    ) -> Result<Vec<Subject>, SearchError> {
        tokio::time::timeout(SEARCH_DEADLINE, self.search_inner(req, debug))
            .await
            .map_err(|_| SearchError::Timeout)?
    }

    async fn search_inner(
        &self,
        req: &SearchRequest,
        mut debug: Option<&mut SearchDebug>,
    ) -> Result<Vec<Subject>, SearchError> {
        let mut subjects = Vec::new();
        let mut seen_uids = HashSet::new();

        if let Some(debug) = debug.as_deref_mut() {
            debug.step("execute document query");
            debug.queries = vec![
                crate::doc::query::any_query(req).to_es(),
                crate::doc::query::doc_query(req).to_es(),
            ];
        }
        let doc_result = self.doc.search(req).await?;
        admit(doc_result.subjects(), &mut seen_uids, &mut subjects);
        if let Some(debug) = debug.as_deref_mut() {
            debug.doc_subject_count = subjects.len();
        }
        if req.limit_reached(seen_uids.len()) {
            subjects.truncate(req.limit as usize);
            return Ok(subjects);
        }

        if let Some(debug) = debug.as_deref_mut() {
            debug.step("execute eval policies");
        }
        let before = subjects.len();
        admit(
            self.eval.search(req).into_iter(),
            &mut seen_uids,
            &mut subjects,
        );
        if let Some(debug) = debug.as_deref_mut() {
            debug.eval_subject_count = subjects.len() - before;
        }
        if req.limit_reached(seen_uids.len()) {
            subjects.truncate(req.limit as usize);
        }
        Ok(subjects)
    }

    pub async fn batch_search(
        &self,
        reqs: &[SearchRequest],
    ) -> Result<Vec<Vec<Subject>>, SearchError> {
        tokio::time::timeout(BATCH_SEARCH_DEADLINE, self.batch_search_inner(reqs))
            .await
            .map_err(|_| SearchError::Timeout)?
    }

    async fn batch_search_inner(
        &self,
        reqs: &[SearchRequest],
    ) -> Result<Vec<Vec<Subject>>, SearchError> {
        let doc_results = self.doc.batch_search(reqs).await?;

        let mut results = Vec::with_capacity(reqs.len());
        for (req, doc_result) in reqs.iter().zip(doc_results) {
            let mut subjects = Vec::new();
            let mut seen_uids = HashSet::new();

            admit(doc_result.subjects(), &mut seen_uids, &mut subjects);
            if req.limit_reached(seen_uids.len()) {
                subjects.truncate(req.limit as usize);
                results.push(subjects);
                continue;
            }

            admit(
                self.eval.search(req).into_iter(),
                &mut seen_uids,
                &mut subjects,
            );
            if req.limit_reached(seen_uids.len()) {
                subjects.truncate(req.limit as usize);
            }
            results.push(subjects);
        }
        Ok(results)
    }

    pub async fn stats(&self, system: &str, action: &str) -> IndexStats {
        let doc = self.doc.size(system, action).await;
        let eval = self.eval.size(system, action);
        IndexStats {
            doc,
            eval,
            total: doc + eval,
        }
    }

    pub async fn total_stats(&self) -> IndexStats {
        let doc = self.doc.total().await;
        let eval = self.eval.total();
        IndexStats {
            doc,
            eval,
            total: doc + eval,
        }
    }

    /// Snapshot covers the evaluation engine only; the document index is
    /// reconstructed by a full sync if lost.
    pub fn take_snapshot(&self) -> Vec<SnapshotRecord> {
        self.eval.take_snapshot()
    }

    pub fn load_snapshot(&self, records: Vec<SnapshotRecord>) {
        self.eval.load_snapshot(records);
    }
}

fn admit(
    incoming: impl Iterator<Item = Subject>,
    seen_uids: &mut HashSet<String>,
    subjects: &mut Vec<Subject>,
) {
    for subject in incoming {
        if seen_uids.insert(subject.uid.clone()) {
            subjects.push(subject);
        }
    }
}
