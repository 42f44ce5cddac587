//! Expression classification: decide which engine a policy lands in.
//!
//! Classes:
//! - `Any`: the expression grants unconditionally.
//! - `Doc`: the expression reduces to term-level constraints an inverted
//!   index can answer (equality, membership, path prefix).
//! - `Eval`: everything else; evaluated in memory per request.
//!
//! The rewrite is deterministic: merged disjunctions are keyed through an
//! ordered map, so equivalent inputs produce byte-identical output and a
//! stable signature. When in doubt a policy falls through to `Eval`, which
//! is always correct, only slower.
use crate::expression::{ExprCell, Operator};
use crate::path;
use crate::policy::Policy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyClass {
    Any,
    Doc,
    Eval,
}

impl PolicyClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyClass::Any => "any",
            PolicyClass::Doc => "doc",
            PolicyClass::Eval => "eval",
        }
    }
}

fn is_any(expr: &ExprCell) -> bool {
    expr.op == Operator::Any
}

fn is_single_eq_or_in(expr: &ExprCell) -> bool {
    matches!(expr.op, Operator::Eq | Operator::In)
}

fn is_path_starts_with(expr: &ExprCell) -> bool {
    expr.op == Operator::StartsWith && path::is_path_field(&expr.field)
}

/// True when the tree consists of `OR` inner nodes and leaves only, with
/// `starts_with` restricted to path fields. `any` leaves are allowed; the
/// merge collapses the whole disjunction to `any` when one appears.
fn is_all_or(expr: &ExprCell) -> bool {
    match expr.op {
        Operator::And => false,
        Operator::Or => expr.content.iter().all(is_all_or),
        Operator::StartsWith => path::is_path_field(&expr.field),
        _ => true,
    }
}

/// `(A or B) or (C or (D or F))` => `[A, B, C, D, F]`.
fn flatten_or(expr: &ExprCell, out: &mut Vec<ExprCell>) {
    if expr.op == Operator::Or {
        for child in &expr.content {
            flatten_or(child, out);
        }
    } else {
        out.push(expr.clone());
    }
}

/// Merges flattened leaves sharing the same `field:op` key, folding `eq`
/// into a unary `in`. Keys are ordered, so the output shape is independent
/// of input ordering quirks.
fn merge_or(leaves: Vec<ExprCell>) -> ExprCell {
    if leaves.iter().any(is_any) {
        return ExprCell::any();
    }

    let mut merged: BTreeMap<String, (Operator, String, Vec<Value>)> = BTreeMap::new();
    for leaf in leaves {
        let op = match leaf.op {
            Operator::Eq => Operator::In,
            other => other,
        };
        let key = format!("{}:{}", leaf.field, op.as_str());
        let entry = merged
            .entry(key)
            .or_insert_with(|| (op, leaf.field.clone(), Vec::new()));
        // a list value is spliced, not nested, so re-normalising an
        // already-merged leaf is a fixed point
        match leaf.value {
            Value::Array(items) => entry.2.extend(items),
            value => entry.2.push(value),
        }
    }

    let mut cells: Vec<ExprCell> = merged
        .into_values()
        .map(|(op, field, values)| ExprCell::leaf(op, field, Value::Array(values)))
        .collect();

    if cells.len() == 1 {
        cells.remove(0)
    } else {
        ExprCell::or(cells)
    }
}

/// True when a merged disjunction constrains a single object with ops the
/// document engine can answer.
fn is_same_object_disjunction(expr: &ExprCell) -> bool {
    if expr.op != Operator::Or {
        return false;
    }

    let mut object: Option<&str> = None;
    for cell in &expr.content {
        match cell.op {
            Operator::Eq | Operator::In => {}
            Operator::StartsWith if path::is_path_field(&cell.field) => {}
            _ => return false,
        }

        let prefix = cell.field_object();
        match object {
            None => object = Some(prefix),
            Some(seen) if seen == prefix => {}
            Some(_) => return false,
        }
    }
    object.is_some()
}

/// Classifies an expression. Returns the class and, when normalisation
/// changed the tree, the rewritten expression to store in its place.
pub fn classify(expr: &ExprCell) -> (PolicyClass, Option<ExprCell>) {
    // 1. the single `any` leaf
    if is_any(expr) {
        return (PolicyClass::Any, None);
    }

    // 2. a single leaf the index answers directly
    if is_single_eq_or_in(expr) || is_path_starts_with(expr) {
        return (PolicyClass::Doc, None);
    }

    // 3. an all-OR tree: flatten, merge, re-test
    if is_all_or(expr) {
        let mut leaves = Vec::new();
        flatten_or(expr, &mut leaves);
        let merged = merge_or(leaves);

        if is_any(&merged) {
            return (PolicyClass::Any, Some(merged));
        }
        if is_single_eq_or_in(&merged)
            || is_path_starts_with(&merged)
            || is_same_object_disjunction(&merged)
        {
            return (PolicyClass::Doc, Some(merged));
        }
    }

    // 4. everything else is evaluated per request, unchanged
    (PolicyClass::Eval, None)
}

/// Classifies a batch, partitioning into `(eval, doc-or-any)` and filling
/// derived fields. Policies whose derived fields cannot be computed are
/// logged and dropped; the rest of the batch proceeds.
pub fn split_policies(policies: Vec<Policy>) -> (Vec<Policy>, Vec<Policy>) {
    let mut eval_policies = Vec::new();
    let mut doc_policies = Vec::with_capacity(policies.len());

    for mut policy in policies {
        let (class, rewritten) = classify(&policy.expression);
        if let Some(expression) = rewritten {
            policy.expression = expression;
        }
        policy.class = Some(class);

        if let Err(err) = policy.fill_derived() {
            warn!(policy_id = policy.id, error = %err, "drop policy with malformed expression");
            continue;
        }

        match class {
            PolicyClass::Eval => eval_policies.push(policy),
            PolicyClass::Any | PolicyClass::Doc => doc_policies.push(policy),
        }
    }

    (eval_policies, doc_policies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eq(field: &str, value: Value) -> ExprCell {
        ExprCell::leaf(Operator::Eq, field, value)
    }

    #[test]
    fn single_any_is_any_class() {
        let (class, rewritten) = classify(&ExprCell::any());
        assert_eq!(class, PolicyClass::Any);
        assert!(rewritten.is_none());
    }

    #[test]
    fn single_eq_and_in_are_doc_class() {
        let (class, _) = classify(&eq("host.id", json!("42")));
        assert_eq!(class, PolicyClass::Doc);

        let (class, _) = classify(&ExprCell::leaf(Operator::In, "host.id", json!(["1", "2"])));
        assert_eq!(class, PolicyClass::Doc);
    }

    #[test]
    fn path_starts_with_is_doc_but_plain_starts_with_is_eval() {
        let (class, _) = classify(&ExprCell::leaf(
            Operator::StartsWith,
            "host._bk_iam_path_",
            json!("/biz,1/"),
        ));
        assert_eq!(class, PolicyClass::Doc);

        let (class, _) = classify(&ExprCell::leaf(
            Operator::StartsWith,
            "host.name",
            json!("db-"),
        ));
        assert_eq!(class, PolicyClass::Eval);
    }

    #[test]
    fn and_is_eval_class_unchanged() {
        let expr = ExprCell::and(vec![
            eq("host.id", json!("42")),
            eq("host.owner", json!("bob")),
        ]);
        let (class, rewritten) = classify(&expr);
        assert_eq!(class, PolicyClass::Eval);
        assert!(rewritten.is_none());
    }

    #[test]
    fn or_of_same_field_eq_merges_to_single_in() {
        let expr = ExprCell::or(vec![
            eq("host.id", json!("1")),
            eq("host.id", json!("2")),
            eq("host.id", json!("3")),
        ]);
        let (class, rewritten) = classify(&expr);
        assert_eq!(class, PolicyClass::Doc);

        let merged = rewritten.unwrap();
        assert_eq!(merged.op, Operator::In);
        assert_eq!(merged.field, "host.id");
        assert_eq!(merged.value, json!(["1", "2", "3"]));
    }

    #[test]
    fn nested_or_flattens_before_merging() {
        let expr = ExprCell::or(vec![
            ExprCell::or(vec![eq("host.id", json!("1")), eq("host.id", json!("2"))]),
            ExprCell::or(vec![ExprCell::or(vec![eq("host.id", json!("3"))])]),
        ]);
        let (class, rewritten) = classify(&expr);
        assert_eq!(class, PolicyClass::Doc);
        assert_eq!(rewritten.unwrap().value, json!(["1", "2", "3"]));
    }

    #[test]
    fn deeply_nested_or_still_classifies() {
        let mut expr = eq("host.id", json!("0"));
        for i in 1..=12 {
            expr = ExprCell::or(vec![expr, eq("host.id", json!(i.to_string()))]);
        }
        let (class, rewritten) = classify(&expr);
        assert_eq!(class, PolicyClass::Doc);
        let merged = rewritten.unwrap();
        assert_eq!(merged.op, Operator::In);
        assert_eq!(merged.value.as_array().unwrap().len(), 13);
    }

    #[test]
    fn or_mixing_fields_of_one_object_is_doc() {
        let expr = ExprCell::or(vec![
            eq("host.id", json!("1")),
            ExprCell::leaf(Operator::In, "host.owner", json!(["bob"])),
            ExprCell::leaf(Operator::StartsWith, "host._bk_iam_path_", json!("/biz,1/")),
        ]);
        let (class, rewritten) = classify(&expr);
        assert_eq!(class, PolicyClass::Doc);

        let merged = rewritten.unwrap();
        assert_eq!(merged.op, Operator::Or);
        assert_eq!(merged.content.len(), 3);
    }

    #[test]
    fn or_across_objects_is_eval() {
        let expr = ExprCell::or(vec![
            eq("host.id", json!("1")),
            eq("module.id", json!("2")),
        ]);
        let (class, rewritten) = classify(&expr);
        assert_eq!(class, PolicyClass::Eval);
        assert!(rewritten.is_none());
    }

    #[test]
    fn or_containing_plain_starts_with_is_eval() {
        let expr = ExprCell::or(vec![
            eq("host.id", json!("1")),
            ExprCell::leaf(Operator::StartsWith, "host.name", json!("db-")),
        ]);
        let (class, _) = classify(&expr);
        assert_eq!(class, PolicyClass::Eval);
    }

    #[test]
    fn or_containing_unmergeable_op_is_eval() {
        let expr = ExprCell::or(vec![
            eq("host.id", json!("1")),
            ExprCell::leaf(Operator::Gt, "host.cpu", json!(4)),
        ]);
        let (class, _) = classify(&expr);
        assert_eq!(class, PolicyClass::Eval);
    }

    #[test]
    fn or_containing_any_collapses_to_any() {
        let expr = ExprCell::or(vec![eq("host.id", json!("1")), ExprCell::any()]);
        let (class, rewritten) = classify(&expr);
        assert_eq!(class, PolicyClass::Any);
        assert_eq!(rewritten.unwrap(), ExprCell::any());
    }

    #[test]
    fn classification_is_idempotent_over_the_rewrite() {
        let expr = ExprCell::or(vec![
            eq("host.id", json!("1")),
            eq("host.id", json!("2")),
            ExprCell::leaf(Operator::StartsWith, "host._bk_iam_path_", json!("/biz,1/")),
        ]);
        let (class, rewritten) = classify(&expr);
        let rewritten = rewritten.unwrap();

        let (class_again, rewritten_again) = classify(&rewritten);
        assert_eq!(class, class_again);
        let stable = rewritten_again.unwrap_or_else(|| rewritten.clone());
        assert_eq!(
            serde_json::to_string(&stable).unwrap(),
            serde_json::to_string(&rewritten).unwrap()
        );
    }

    #[test]
    fn rewrite_is_deterministic() {
        let build = || {
            ExprCell::or(vec![
                eq("host.owner", json!("bob")),
                eq("host.id", json!("2")),
                eq("host.id", json!("1")),
            ])
        };
        let (_, a) = classify(&build());
        let (_, b) = classify(&build());
        assert_eq!(
            serde_json::to_string(&a.unwrap()).unwrap(),
            serde_json::to_string(&b.unwrap()).unwrap()
        );
    }

    #[test]
    fn split_policies_partitions_by_class() {
        let make = |id: i64, expression: ExprCell| {
            let mut policy: Policy = serde_json::from_value(json!({
                "id": id,
                "system": "bk_cmdb",
                "action": {"id": "edit"},
                "subject": {"type": "user", "id": "alice"},
                "expression": {"op": "any"},
                "expired_at": 4102444800i64,
                "updated_at": 1i64
            }))
            .expect("fixture");
            policy.expression = expression;
            policy
        };

        let policies = vec![
            make(1, ExprCell::any()),
            make(2, eq("host.id", json!("42"))),
            make(3, ExprCell::and(vec![eq("host.id", json!("42")), eq("host.owner", json!("bob"))])),
        ];

        let (eval, doc) = split_policies(policies);
        assert_eq!(eval.len(), 1);
        assert_eq!(doc.len(), 2);
        assert_eq!(eval[0].class, Some(PolicyClass::Eval));
        assert_eq!(doc[0].class, Some(PolicyClass::Any));
        assert_eq!(doc[1].class, Some(PolicyClass::Doc));
        assert!(doc.iter().all(|p| !p.subject.uid.is_empty()));
    }
}
