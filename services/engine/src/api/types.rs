//! Wire DTOs of the search API.
use argus_policy::{Action, ResourceNode, SearchRequest, Subject};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

pub const MAX_LIMIT: i64 = 1000;
pub const MAX_BATCH: usize = 100;

const SUBJECT_TYPES: [&str; 3] = ["all", "user", "group"];

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ActionBody {
    #[schema(example = "edit")]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResourceNodeBody {
    #[schema(example = "bk_cmdb")]
    pub system: String,
    #[serde(rename = "type")]
    #[schema(example = "host")]
    pub resource_type: String,
    #[schema(example = "42")]
    pub id: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub attribute: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SearchRequestBody {
    #[schema(example = "bk_cmdb")]
    pub system: String,
    pub action: ActionBody,
    pub resource: Vec<ResourceNodeBody>,
    #[schema(example = "all")]
    pub subject_type: String,
    /// 0 or -1 mean unlimited, bounded by the request deadline.
    #[serde(default)]
    #[schema(example = 10)]
    pub limit: i64,
}

impl SearchRequestBody {
    pub fn validate(&self) -> Result<(), String> {
        if self.system.is_empty() {
            return Err("system is required".to_string());
        }
        if self.action.id.is_empty() {
            return Err("action.id is required".to_string());
        }
        if !SUBJECT_TYPES.contains(&self.subject_type.as_str()) {
            return Err(format!(
                "subject_type must be one of {SUBJECT_TYPES:?}, got {}",
                self.subject_type
            ));
        }
        if self.limit < -1 || self.limit > MAX_LIMIT {
            return Err(format!("limit must be in [-1, {MAX_LIMIT}]"));
        }
        Ok(())
    }

    /// Converts to the domain request: stamps `now`, injects each node's id
    /// into its attribute map.
    pub fn into_domain(self, now_timestamp: i64) -> SearchRequest {
        let mut request = SearchRequest {
            system: self.system,
            action: Action { id: self.action.id },
            resource: self
                .resource
                .into_iter()
                .map(|node| ResourceNode {
                    system: node.system,
                    resource_type: node.resource_type,
                    id: node.id,
                    attribute: node.attribute,
                })
                .collect(),
            subject_type: self.subject_type,
            limit: self.limit,
            now_timestamp,
        };
        for node in &mut request.resource {
            node.inject_id();
        }
        request
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubjectBody {
    #[serde(rename = "type")]
    #[schema(example = "user")]
    pub subject_type: String,
    #[schema(example = "alice")]
    pub id: String,
    pub name: String,
}

impl From<Subject> for SubjectBody {
    fn from(subject: Subject) -> Self {
        Self {
            subject_type: subject.subject_type,
            id: subject.id,
            name: subject.name,
        }
    }
}

pub fn subjects_body(subjects: Vec<Subject>) -> Vec<SubjectBody> {
    subjects.into_iter().map(SubjectBody::from).collect()
}
