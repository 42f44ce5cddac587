//! In-memory evaluation of expression cells against a resource's attributes.
//!
//! Evaluation is total: malformed operands, missing objects or attributes,
//! and type mismatches all evaluate to `false` rather than erroring, so a
//! single bad policy can never take down a search.
use crate::expression::{ExprCell, Operator};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// The attribute sets of the resource nodes named in a search request,
/// keyed by resource type.
#[derive(Debug, Default, Clone)]
pub struct ObjectSet {
    objects: HashMap<String, Map<String, Value>>,
}

impl ObjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, object_type: impl Into<String>, attributes: Map<String, Value>) {
        self.objects.insert(object_type.into(), attributes);
    }

    /// Resolves a dotted field like `host.id` to the `id` attribute of the
    /// `host` object.
    pub fn get_attribute(&self, field: &str) -> Option<&Value> {
        let (object, attr) = field.split_once('.')?;
        self.objects.get(object)?.get(attr)
    }
}

impl ExprCell {
    /// Evaluates this expression against the request's object set.
    pub fn eval(&self, objects: &ObjectSet) -> bool {
        match self.op {
            Operator::Any => true,
            Operator::And => {
                !self.content.is_empty() && self.content.iter().all(|c| c.eval(objects))
            }
            Operator::Or => self.content.iter().any(|c| c.eval(objects)),
            _ => self.eval_leaf(objects),
        }
    }

    fn eval_leaf(&self, objects: &ObjectSet) -> bool {
        let Some(attr) = objects.get_attribute(&self.field) else {
            return false;
        };

        match self.op {
            // `contains` asserts membership of the expression value in a
            // multi-valued attribute.
            Operator::Contains => match attr {
                Value::Array(items) => items.iter().any(|item| value_eq(item, &self.value)),
                _ => false,
            },
            Operator::NotContains => match attr {
                Value::Array(items) => !items.iter().any(|item| value_eq(item, &self.value)),
                _ => false,
            },
            op if is_negation(op) => match attr {
                // A multi-valued attribute satisfies a negative operator only
                // when every element does.
                Value::Array(items) => {
                    items.iter().all(|item| match_scalar(op, item, &self.value))
                }
                scalar => match_scalar(op, scalar, &self.value),
            },
            op => match attr {
                // A multi-valued attribute satisfies a positive operator when
                // any element does.
                Value::Array(items) => {
                    items.iter().any(|item| match_scalar(op, item, &self.value))
                }
                scalar => match_scalar(op, scalar, &self.value),
            },
        }
    }
}

fn is_negation(op: Operator) -> bool {
    matches!(
        op,
        Operator::NotEq | Operator::NotIn | Operator::NotStartsWith | Operator::NotEndsWith
    )
}

fn match_scalar(op: Operator, attr: &Value, value: &Value) -> bool {
    match op {
        Operator::Eq => value_eq(attr, value),
        Operator::NotEq => !value_eq(attr, value),
        Operator::In => match value {
            Value::Array(items) => items.iter().any(|item| value_eq(attr, item)),
            _ => false,
        },
        Operator::NotIn => match value {
            Value::Array(items) => !items.iter().any(|item| value_eq(attr, item)),
            _ => false,
        },
        Operator::StartsWith => both_strings(attr, value, |a, v| a.starts_with(v)),
        Operator::NotStartsWith => both_strings(attr, value, |a, v| !a.starts_with(v)),
        Operator::EndsWith => both_strings(attr, value, |a, v| a.ends_with(v)),
        Operator::NotEndsWith => both_strings(attr, value, |a, v| !a.ends_with(v)),
        Operator::StringContains => both_strings(attr, value, |a, v| a.contains(v)),
        Operator::Lt => value_cmp(attr, value) == Some(Ordering::Less),
        Operator::Lte => matches!(
            value_cmp(attr, value),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ),
        Operator::Gt => value_cmp(attr, value) == Some(Ordering::Greater),
        Operator::Gte => matches!(
            value_cmp(attr, value),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ),
        _ => false,
    }
}

fn both_strings(attr: &Value, value: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    match (attr.as_str(), value.as_str()) {
        (Some(a), Some(v)) => f(a, v),
        _ => false,
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().zip(y.as_f64()).is_some_and(|(x, y)| x == y)
        }
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => false,
    }
}

fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn host(attrs: Value) -> ObjectSet {
        let mut objects = ObjectSet::new();
        let Value::Object(map) = attrs else {
            panic!("attrs must be an object")
        };
        objects.set("host", map);
        objects
    }

    #[test]
    fn any_is_always_true() {
        assert!(ExprCell::any().eval(&ObjectSet::new()));
    }

    #[test]
    fn eq_matches_strings_and_numbers() {
        let objects = host(json!({"id": "42", "cpu": 8}));
        assert!(ExprCell::leaf(Operator::Eq, "host.id", json!("42")).eval(&objects));
        assert!(!ExprCell::leaf(Operator::Eq, "host.id", json!("43")).eval(&objects));
        assert!(ExprCell::leaf(Operator::Eq, "host.cpu", json!(8)).eval(&objects));
        // type mismatch never matches
        assert!(!ExprCell::leaf(Operator::Eq, "host.id", json!(42)).eval(&objects));
    }

    #[test]
    fn missing_object_or_attribute_fails_the_leaf() {
        let objects = host(json!({"id": "42"}));
        assert!(!ExprCell::leaf(Operator::Eq, "module.id", json!("42")).eval(&objects));
        assert!(!ExprCell::leaf(Operator::NotEq, "host.owner", json!("bob")).eval(&objects));
    }

    #[test]
    fn in_checks_membership() {
        let objects = host(json!({"id": "2"}));
        assert!(ExprCell::leaf(Operator::In, "host.id", json!(["1", "2", "3"])).eval(&objects));
        assert!(!ExprCell::leaf(Operator::In, "host.id", json!(["4"])).eval(&objects));
        // a non-array operand cannot match
        assert!(!ExprCell::leaf(Operator::In, "host.id", json!("2")).eval(&objects));
    }

    #[test]
    fn multi_valued_attributes_any_match_positive_all_match_negative() {
        let objects = host(json!({"label": ["blue", "green"]}));
        assert!(ExprCell::leaf(Operator::Eq, "host.label", json!("green")).eval(&objects));
        assert!(!ExprCell::leaf(Operator::NotEq, "host.label", json!("green")).eval(&objects));
        assert!(ExprCell::leaf(Operator::NotEq, "host.label", json!("red")).eval(&objects));
    }

    #[test]
    fn contains_requires_an_array_attribute() {
        let objects = host(json!({"labels": ["a", "b"], "name": "ab"}));
        assert!(ExprCell::leaf(Operator::Contains, "host.labels", json!("a")).eval(&objects));
        assert!(!ExprCell::leaf(Operator::Contains, "host.name", json!("a")).eval(&objects));
        assert!(ExprCell::leaf(Operator::NotContains, "host.labels", json!("c")).eval(&objects));
    }

    #[test]
    fn string_operators() {
        let objects = host(json!({"path": "/biz,1/set,2/"}));
        assert!(
            ExprCell::leaf(Operator::StartsWith, "host.path", json!("/biz,1/")).eval(&objects)
        );
        assert!(ExprCell::leaf(Operator::EndsWith, "host.path", json!("set,2/")).eval(&objects));
        assert!(
            ExprCell::leaf(Operator::StringContains, "host.path", json!("set,2")).eval(&objects)
        );
        assert!(
            !ExprCell::leaf(Operator::StartsWith, "host.path", json!("/biz,2/")).eval(&objects)
        );
    }

    #[test]
    fn numeric_ordering() {
        let objects = host(json!({"cpu": 8}));
        assert!(ExprCell::leaf(Operator::Gt, "host.cpu", json!(4)).eval(&objects));
        assert!(ExprCell::leaf(Operator::Gte, "host.cpu", json!(8)).eval(&objects));
        assert!(ExprCell::leaf(Operator::Lt, "host.cpu", json!(9)).eval(&objects));
        assert!(!ExprCell::leaf(Operator::Lte, "host.cpu", json!(7)).eval(&objects));
    }

    #[test]
    fn and_or_compose() {
        let objects = host(json!({"id": "42", "owner": "bob"}));
        let both = ExprCell::and(vec![
            ExprCell::leaf(Operator::Eq, "host.id", json!("42")),
            ExprCell::leaf(Operator::Eq, "host.owner", json!("bob")),
        ]);
        assert!(both.eval(&objects));

        let either = ExprCell::or(vec![
            ExprCell::leaf(Operator::Eq, "host.id", json!("nope")),
            ExprCell::leaf(Operator::Eq, "host.owner", json!("bob")),
        ]);
        assert!(either.eval(&objects));

        let neither = ExprCell::or(vec![
            ExprCell::leaf(Operator::Eq, "host.id", json!("nope")),
            ExprCell::leaf(Operator::Eq, "host.owner", json!("alice")),
        ]);
        assert!(!neither.eval(&objects));

        // an AND with no children grants nothing
        assert!(!ExprCell::and(vec![]).eval(&objects));
    }

    #[test]
    fn cross_object_and() {
        let mut objects = ObjectSet::new();
        let Value::Object(host_attrs) = json!({"id": "42"}) else {
            unreachable!()
        };
        let Value::Object(module_attrs) = json!({"id": "7"}) else {
            unreachable!()
        };
        objects.set("host", host_attrs);
        objects.set("module", module_attrs);

        let expr = ExprCell::and(vec![
            ExprCell::leaf(Operator::Eq, "host.id", json!("42")),
            ExprCell::leaf(Operator::Eq, "module.id", json!("7")),
        ]);
        assert!(expr.eval(&objects));
    }
}
