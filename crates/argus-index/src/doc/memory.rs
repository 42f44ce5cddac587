//! In-memory document store.
//!
//! Backs tests and local development. Documents are flattened into dotted
//! field paths at index time so typed queries are answered exactly the way
//! the keyword-mapped Elasticsearch index answers them. Hits are returned
//! in policy-id order, which keeps within-engine output stable for a given
//! query.
use crate::doc::query::{Query, SearchBody};
use crate::doc::store::{BulkSummary, DocumentStore, SearchResponse, StoreError, StoreResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

#[derive(Debug)]
struct StoredDoc {
    raw: Value,
    flat: HashMap<String, Vec<Value>>,
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<BTreeMap<i64, StoredDoc>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.read().expect("doc store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The raw stored document, for assertions in tests.
    pub fn get(&self, id: i64) -> Option<Value> {
        self.docs
            .read()
            .expect("doc store lock")
            .get(&id)
            .map(|doc| doc.raw.clone())
    }
}

fn flatten(value: &Value, prefix: &str, out: &mut HashMap<String, Vec<Value>>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(child, &path, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten(item, prefix, out);
            }
        }
        scalar => {
            out.entry(prefix.to_string())
                .or_default()
                .push(scalar.clone());
        }
    }
}

fn term_eq(stored: &Value, wanted: &Value) -> bool {
    match (stored, wanted) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().zip(b.as_f64()).is_some_and(|(a, b)| a == b)
        }
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => false,
    }
}

fn matches(query: &Query, doc: &StoredDoc) -> bool {
    match query {
        Query::MatchAll => true,
        Query::MatchNone => false,
        Query::Term { field, value } => doc
            .flat
            .get(field)
            .is_some_and(|stored| stored.iter().any(|item| term_eq(item, value))),
        Query::Range { field, gte, lt } => doc.flat.get(field).is_some_and(|stored| {
            stored.iter().filter_map(|item| item.as_i64()).any(|item| {
                gte.map_or(true, |bound| item >= bound) && lt.map_or(true, |bound| item < bound)
            })
        }),
        Query::Bool {
            must,
            should,
            filter,
        } => {
            must.iter().all(|clause| matches(clause, doc))
                && filter.iter().all(|clause| matches(clause, doc))
                && (should.is_empty() || should.iter().any(|clause| matches(clause, doc)))
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn bulk_index(&self, docs: Vec<(i64, Value)>) -> StoreResult<BulkSummary> {
        let mut guard = self
            .docs
            .write()
            .map_err(|_| StoreError::Unavailable("poisoned lock".to_string()))?;
        let mut summary = BulkSummary::default();
        for (id, raw) in docs {
            let mut flat = HashMap::new();
            flatten(&raw, "", &mut flat);
            guard.insert(id, StoredDoc { raw, flat });
            summary.succeeded += 1;
        }
        Ok(summary)
    }

    async fn bulk_delete(&self, ids: &[i64]) -> StoreResult<BulkSummary> {
        let mut guard = self
            .docs
            .write()
            .map_err(|_| StoreError::Unavailable("poisoned lock".to_string()))?;
        let mut summary = BulkSummary::default();
        for id in ids {
            if guard.remove(id).is_some() {
                summary.succeeded += 1;
            } else {
                summary.not_found += 1;
            }
        }
        Ok(summary)
    }

    async fn msearch(&self, searches: &[SearchBody]) -> StoreResult<Vec<SearchResponse>> {
        let guard = self
            .docs
            .read()
            .map_err(|_| StoreError::Unavailable("poisoned lock".to_string()))?;
        let mut responses = Vec::with_capacity(searches.len());
        for search in searches {
            let hits = guard
                .values()
                .filter(|doc| matches(&search.query, doc))
                .take(search.size)
                .map(|doc| json!({"subject": doc.raw["subject"]}))
                .collect();
            responses.push(SearchResponse { hits });
        }
        Ok(responses)
    }

    async fn delete_by_query(&self, query: &Query) -> StoreResult<u64> {
        let mut guard = self
            .docs
            .write()
            .map_err(|_| StoreError::Unavailable("poisoned lock".to_string()))?;
        let before = guard.len();
        guard.retain(|_, doc| !matches(query, doc));
        Ok((before - guard.len()) as u64)
    }

    async fn count(&self, query: &Query) -> StoreResult<u64> {
        let guard = self
            .docs
            .read()
            .map_err(|_| StoreError::Unavailable("poisoned lock".to_string()))?;
        Ok(guard.values().filter(|doc| matches(query, doc)).count() as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
