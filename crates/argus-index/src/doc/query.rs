//! Typed boolean queries over the document store.
//!
//! The same query value is rendered to the Elasticsearch JSON DSL by the
//! elastic backend and interpreted structurally by the in-memory backend,
//! so both answer identically.
use argus_policy::path;
use argus_policy::{SUBJECT_TYPE_ALL, SearchRequest, Subject};
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    MatchAll,
    MatchNone,
    Term {
        field: String,
        value: Value,
    },
    /// Half-open numeric range over a top-level field.
    Range {
        field: String,
        gte: Option<i64>,
        lt: Option<i64>,
    },
    Bool {
        must: Vec<Query>,
        should: Vec<Query>,
        filter: Vec<Query>,
    },
}

impl Query {
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn must(clauses: Vec<Query>) -> Self {
        Query::Bool {
            must: clauses,
            should: Vec::new(),
            filter: Vec::new(),
        }
    }

    pub fn should(clauses: Vec<Query>) -> Self {
        Query::Bool {
            must: Vec::new(),
            should: clauses,
            filter: Vec::new(),
        }
    }

    pub fn filter(clauses: Vec<Query>) -> Self {
        Query::Bool {
            must: Vec::new(),
            should: Vec::new(),
            filter: clauses,
        }
    }

    /// Renders the Elasticsearch query DSL fragment.
    pub fn to_es(&self) -> Value {
        match self {
            Query::MatchAll => json!({"match_all": {}}),
            Query::MatchNone => json!({"match_none": {}}),
            Query::Term { field, value } => {
                let mut inner = serde_json::Map::new();
                inner.insert(field.clone(), value.clone());
                json!({"term": inner})
            }
            Query::Range { field, gte, lt } => {
                let mut bounds = serde_json::Map::new();
                if let Some(gte) = gte {
                    bounds.insert("gte".to_string(), json!(gte));
                }
                if let Some(lt) = lt {
                    bounds.insert("lt".to_string(), json!(lt));
                }
                let mut inner = serde_json::Map::new();
                inner.insert(field.clone(), Value::Object(bounds));
                json!({"range": inner})
            }
            Query::Bool {
                must,
                should,
                filter,
            } => {
                let mut body = serde_json::Map::new();
                if !must.is_empty() {
                    body.insert(
                        "must".to_string(),
                        Value::Array(must.iter().map(Query::to_es).collect()),
                    );
                }
                if !should.is_empty() {
                    body.insert(
                        "should".to_string(),
                        Value::Array(should.iter().map(Query::to_es).collect()),
                    );
                }
                if !filter.is_empty() {
                    body.insert(
                        "filter".to_string(),
                        Value::Array(filter.iter().map(Query::to_es).collect()),
                    );
                }
                json!({"bool": body})
            }
        }
    }
}

/// A single search of an msearch round-trip. The returned source is always
/// restricted to the subject block.
#[derive(Debug, Clone)]
pub struct SearchBody {
    pub query: Query,
    pub size: usize,
}

impl SearchBody {
    pub fn to_es(&self) -> Value {
        json!({
            "query": self.query.to_es(),
            "from": 0,
            "size": self.size,
            "_source": "subject",
            "track_total_hits": true,
        })
    }
}

/// `action.id = A OR actions.id = A`: the dual-field match tolerates both
/// generations of the policy schema.
fn action_clause(action: &str) -> Query {
    Query::should(vec![
        Query::term("action.id", action),
        Query::term("actions.id", action),
    ])
}

fn subject_type_clause(subject_type: &str) -> Option<Query> {
    if subject_type == SUBJECT_TYPE_ALL {
        None
    } else {
        Some(Query::term("subject.type", subject_type))
    }
}

/// The `any` sub-query: unconditional grants for this system/action, not
/// yet expired. Pure filters; scoring is never relied on.
pub fn any_query(req: &SearchRequest) -> Query {
    let mut clauses = vec![
        Query::Range {
            field: "expired_at".to_string(),
            gte: Some(req.now_timestamp),
            lt: None,
        },
        Query::term("system", req.system.as_str()),
        action_clause(&req.action.id),
        Query::term("type", "any"),
    ];
    if let Some(clause) = subject_type_clause(&req.subject_type) {
        clauses.push(clause);
    }
    Query::filter(clauses)
}

/// The `doc` sub-query: a disjunction over every requested
/// `(resource, attribute, value)` pair, constrained to the system, action
/// and liveness filters. Path attributes are expanded request-side: one
/// term per prefix against the path field, one term per node against the
/// companion contains field.
pub fn doc_query(req: &SearchRequest) -> Query {
    let mut resource_clauses = Vec::new();

    for node in &req.resource {
        for (key, value) in &node.attribute {
            let field = format!(
                "resource.{}.{}.{}",
                req.system, node.resource_type, key
            );
            if key == path::PATH_KEY {
                for path_value in attribute_strings(value) {
                    for prefix in path::split_path_prefixes(&path_value) {
                        resource_clauses.push(Query::term(field.clone(), prefix));
                    }
                    let contains_field = format!(
                        "resource.{}.{}.{}",
                        req.system,
                        node.resource_type,
                        path::PATH_CONTAINS_KEY
                    );
                    for node_value in path::split_path_nodes(&path_value) {
                        resource_clauses.push(Query::term(contains_field.clone(), node_value));
                    }
                }
                continue;
            }
            resource_clauses.push(Query::term(field, value.clone()));
        }
    }

    // No attribute constraints: nothing can match, but a placeholder keeps
    // msearch responses positionally aligned.
    let resource_clause = match resource_clauses.len() {
        0 => return Query::MatchNone,
        1 => resource_clauses.remove(0),
        _ => Query::should(resource_clauses),
    };

    let mut clauses = vec![
        resource_clause,
        Query::Range {
            field: "expired_at".to_string(),
            gte: Some(req.now_timestamp),
            lt: None,
        },
        Query::term("system", req.system.as_str()),
        action_clause(&req.action.id),
        Query::term("type", "doc"),
    ];
    if let Some(clause) = subject_type_clause(&req.subject_type) {
        clauses.push(clause);
    }
    Query::must(clauses)
}

fn attribute_strings(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn subjects_clause(subjects: &[Subject]) -> Query {
    let mut clauses = Vec::with_capacity(subjects.len());
    for subject in subjects {
        clauses.push(Query::must(vec![
            Query::term("subject.type", subject.subject_type.as_str()),
            Query::term("subject.id", subject.id.as_str()),
        ]));
    }
    if clauses.len() == 1 {
        clauses.remove(0)
    } else {
        Query::should(clauses)
    }
}

/// Deletes every document of the given subjects older than `timestamp`.
pub fn subjects_query(timestamp: i64, subjects: &[Subject]) -> Query {
    Query::must(vec![
        subjects_clause(subjects),
        Query::Range {
            field: "updated_at".to_string(),
            gte: None,
            lt: Some(timestamp),
        },
    ])
}

/// Like [`subjects_query`], additionally constrained to one template.
pub fn template_subjects_query(timestamp: i64, template_id: i64, subjects: &[Subject]) -> Query {
    Query::must(vec![
        Query::term("template_id", template_id),
        subjects_clause(subjects),
        Query::Range {
            field: "updated_at".to_string(),
            gte: None,
            lt: Some(timestamp),
        },
    ])
}

/// Count of live documents for one system/action pair.
pub fn action_count_query(system: &str, action: &str) -> Query {
    Query::filter(vec![Query::term("system", system), action_clause(action)])
}

/// Page size: 100 by default, raised to the requested limit when one is
/// set (the HTTP layer caps limits at 1000).
pub fn page_size(req: &SearchRequest) -> usize {
    if req.limit > 0 { req.limit as usize } else { 100 }
}
