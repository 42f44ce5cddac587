//! Search request types shared by the HTTP surface and the engines.
use crate::eval::ObjectSet;
use crate::policy::Action;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wildcard subject type: do not filter by subject type.
pub const SUBJECT_TYPE_ALL: &str = "all";

/// One resource in a search request. `attribute["id"]` is injected at
/// ingress so expressions over `<type>.id` resolve without the caller
/// repeating the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceNode {
    pub system: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
    #[serde(default)]
    pub attribute: Map<String, Value>,
}

impl ResourceNode {
    pub fn inject_id(&mut self) {
        self.attribute
            .insert("id".to_string(), Value::String(self.id.clone()));
    }
}

pub type Resource = Vec<ResourceNode>;

/// A "who can do X on Y" query. `limit` of 0 or -1 means unlimited,
/// bounded only by the request deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub system: String,
    pub action: Action,
    pub resource: Resource,
    pub subject_type: String,
    #[serde(default)]
    pub limit: i64,

    /// Stamped by the server at ingress; not part of the wire schema.
    #[serde(skip)]
    pub now_timestamp: i64,
}

impl SearchRequest {
    /// Builds the evaluation object set from the requested resource nodes.
    pub fn object_set(&self) -> ObjectSet {
        let mut objects = ObjectSet::new();
        for node in &self.resource {
            objects.set(node.resource_type.clone(), node.attribute.clone());
        }
        objects
    }

    pub fn unlimited(&self) -> bool {
        self.limit <= 0
    }

    /// True once the admitted subject count satisfies the limit.
    pub fn limit_reached(&self, admitted: usize) -> bool {
        self.limit > 0 && admitted >= self.limit as usize
    }
}
