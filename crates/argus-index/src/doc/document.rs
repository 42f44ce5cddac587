//! Policy-to-document projection.
use argus_policy::{ExprCell, Operator, Policy, PolicyClass, path};
use serde_json::{Map, Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("policy {0}: expression is not term-representable")]
    NotTermRepresentable(i64),
    #[error("policy {0}: missing expression class")]
    Unclassified(i64),
}

/// Builds the stored document for an `any` or `doc` policy.
///
/// The resource block nests attribute constraints under
/// `resource.<system>.<field>` with every value as a list, so the store can
/// answer them as exact term lookups. Path values are stored verbatim; the
/// request side expands its path into prefixes and nodes at query time.
pub fn make_doc(policy: &Policy) -> Result<Value, DocumentError> {
    let class = policy.class.ok_or(DocumentError::Unclassified(policy.id))?;

    let mut object = Map::new();
    if class == PolicyClass::Doc {
        fill_object(&mut object, &policy.expression, policy.id)?;
    }

    let actions: Vec<Value> = policy
        .actions
        .iter()
        .map(|action| json!({"id": action.id}))
        .collect();

    let mut resource = Map::new();
    resource.insert(policy.system.clone(), Value::Object(object));

    Ok(json!({
        "type": class.as_str(),
        "id": policy.id,
        "version": policy.version,
        "system": policy.system,
        "actions": actions,
        "subject": {
            "id": policy.subject.id,
            "type": policy.subject.subject_type,
            "name": policy.subject.name,
            "uid": policy.subject.uid,
        },
        "template_id": policy.template_id,
        "resource": resource,
        "expired_at": policy.expired_at,
        "updated_at": policy.updated_at,
    }))
}

fn fill_object(
    object: &mut Map<String, Value>,
    expression: &ExprCell,
    policy_id: i64,
) -> Result<(), DocumentError> {
    match expression.op {
        Operator::Eq => {
            object.insert(
                expression.field.clone(),
                Value::Array(vec![expression.value.clone()]),
            );
        }
        Operator::In => {
            object.insert(expression.field.clone(), as_list(&expression.value));
        }
        Operator::StartsWith => {
            object.insert(expression.field.clone(), as_list(&expression.value));
        }
        Operator::StringContains => {
            // `x._bk_iam_path_ string_contains v` is answered from the
            // companion contains field.
            object.insert(
                path::to_contains_field(&expression.field),
                Value::Array(vec![expression.value.clone()]),
            );
        }
        Operator::Or => {
            // A merged same-object disjunction: every child is already a
            // list-valued leaf.
            for cell in &expression.content {
                fill_object(object, cell, policy_id)?;
            }
        }
        _ => return Err(DocumentError::NotTermRepresentable(policy_id)),
    }
    Ok(())
}

fn as_list(value: &Value) -> Value {
    match value {
        Value::Array(_) => value.clone(),
        other => Value::Array(vec![other.clone()]),
    }
}
