//! Expression cells as delivered by the authority.
//!
//! An expression is a tree: inner nodes are `AND`/`OR` over `content`,
//! leaves carry `(op, field, value)`. `any` is the trivially-true leaf.
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "eq")]
    Eq,
    #[serde(rename = "not_eq")]
    NotEq,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not_contains")]
    NotContains,
    #[serde(rename = "starts_with")]
    StartsWith,
    #[serde(rename = "not_starts_with")]
    NotStartsWith,
    #[serde(rename = "ends_with")]
    EndsWith,
    #[serde(rename = "not_ends_with")]
    NotEndsWith,
    #[serde(rename = "string_contains")]
    StringContains,
    #[serde(rename = "lt")]
    Lt,
    #[serde(rename = "lte")]
    Lte,
    #[serde(rename = "gt")]
    Gt,
    #[serde(rename = "gte")]
    Gte,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::And => "AND",
            Operator::Or => "OR",
            Operator::Any => "any",
            Operator::Eq => "eq",
            Operator::NotEq => "not_eq",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::StartsWith => "starts_with",
            Operator::NotStartsWith => "not_starts_with",
            Operator::EndsWith => "ends_with",
            Operator::NotEndsWith => "not_ends_with",
            Operator::StringContains => "string_contains",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
        }
    }
}

/// One cell of a policy expression. Field order is fixed so serialisation
/// of a given tree is byte-stable, which keeps expression signatures stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExprCell {
    pub op: Operator,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ExprCell>,
}

impl ExprCell {
    pub fn any() -> Self {
        ExprCell {
            op: Operator::Any,
            field: String::new(),
            value: Value::Null,
            content: Vec::new(),
        }
    }

    pub fn leaf(op: Operator, field: impl Into<String>, value: Value) -> Self {
        ExprCell {
            op,
            field: field.into(),
            value,
            content: Vec::new(),
        }
    }

    pub fn and(content: Vec<ExprCell>) -> Self {
        ExprCell {
            op: Operator::And,
            field: String::new(),
            value: Value::Null,
            content,
        }
    }

    pub fn or(content: Vec<ExprCell>) -> Self {
        ExprCell {
            op: Operator::Or,
            field: String::new(),
            value: Value::Null,
            content,
        }
    }

    /// The object part of `field`, i.e. `"host"` for `"host.id"`.
    pub fn field_object(&self) -> &str {
        match self.field.split_once('.') {
            Some((object, _)) => object,
            None => self.field.as_str(),
        }
    }
}
