//! Policies and the identities they grant permission to.
use crate::classify::PolicyClass;
use crate::expression::ExprCell;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A user or group holding permission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(rename = "type")]
    pub subject_type: String,
    pub id: String,
    #[serde(default)]
    pub name: String,

    /// `type:id`, the dedup key. Derived locally, never on the wire.
    #[serde(skip)]
    pub uid: String,
}

impl Subject {
    pub fn new(subject_type: impl Into<String>, id: impl Into<String>) -> Self {
        let mut subject = Subject {
            subject_type: subject_type.into(),
            id: id.into(),
            name: String::new(),
            uid: String::new(),
        };
        subject.fill_uid();
        subject
    }

    pub fn fill_uid(&mut self) {
        self.uid = format!("{}:{}", self.subject_type, self.id);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy {id}: expression serialize failed: {source}")]
    ExpressionSerialize {
        id: i64,
        #[source]
        source: serde_json::Error,
    },
}

/// One authorization policy as delivered by the authority, plus the fields
/// derived at ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub version: String,
    pub id: i64,
    pub system: String,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub actions: Vec<Action>,
    pub subject: Subject,
    #[serde(default)]
    pub template_id: i64,
    pub expression: ExprCell,
    pub expired_at: i64,
    pub updated_at: i64,

    #[serde(skip)]
    pub expression_signature: String,
    #[serde(skip)]
    pub expression_length: usize,
    #[serde(skip)]
    pub class: Option<PolicyClass>,
}

impl Policy {
    /// Computes the subject uid and the expression signature, and folds the
    /// legacy singular `action` field into `actions`. Must run before a
    /// policy enters either engine; snapshot load runs it again because the
    /// derived fields are never persisted.
    pub fn fill_derived(&mut self) -> Result<(), PolicyError> {
        self.subject.fill_uid();

        if self.actions.is_empty() && !self.action.id.is_empty() {
            self.actions = vec![self.action.clone()];
        }

        let bytes =
            serde_json::to_vec(&self.expression).map_err(|source| {
                PolicyError::ExpressionSerialize {
                    id: self.id,
                    source,
                }
            })?;
        self.expression_signature = hex::encode(Sha256::digest(&bytes));
        self.expression_length = bytes.len();
        Ok(())
    }
}

/// Per-`(system, action)` dump of the evaluation engine, the unit persisted
/// by the snapshot store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub system: String,
    pub action: String,
    pub last_modified_timestamp: i64,
    pub eval_policies: Vec<Policy>,
}

impl SnapshotRecord {
    pub fn fill_policies_derived(&mut self) -> Result<(), PolicyError> {
        for policy in &mut self.eval_policies {
            policy.fill_derived()?;
        }
        Ok(())
    }
}
