//! Tree-walking interpreter for conditions

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::net::IpAddr;

use super::error::{ConditionError, Result};
use super::{parse_timestamp, AttributePath, CompareOp, Condition, Operand, MAX_CONDITION_DEPTH};

/// Read-only view of the attributes a condition can reference
pub trait AttributeSource {
    /// Value at `path`, or `None` if absent
    fn attribute(&self, path: &AttributePath) -> Option<Value>;
}

impl Condition {
    /// Evaluate against `source`
    ///
    /// Missing attributes make comparisons false; only authoring problems
    /// (unknown operators, malformed nodes) are errors. Every operand of
    /// `and`/`or` is evaluated so a malformed branch is never skipped by
    /// short-circuiting.
    pub fn evaluate(&self, source: &dyn AttributeSource) -> Result<bool> {
        self.eval_at(source, 0)
    }

    fn eval_at(&self, source: &dyn AttributeSource, depth: usize) -> Result<bool> {
        if depth > MAX_CONDITION_DEPTH {
            return Err(ConditionError::TooDeep(MAX_CONDITION_DEPTH));
        }

        match self {
            Condition::True => Ok(true),
            Condition::False => Ok(false),

            Condition::Equals { attr, value } => Ok(match both(source, attr, value) {
                Some((left, right)) => values_equal(&left, &right),
                None => false,
            }),

            Condition::NotEquals { attr, value } => Ok(match both(source, attr, value) {
                Some((left, right)) => !values_equal(&left, &right),
                None => false,
            }),

            Condition::In { attr, values } => Ok(match source.attribute(attr) {
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| values.iter().any(|v| values_equal(item, v))),
                Some(actual) => values.iter().any(|v| values_equal(&actual, v)),
                None => false,
            }),

            Condition::Contains { attr, value } => Ok(match both(source, attr, value) {
                Some((Value::Array(items), needle)) => items.iter().any(|item| values_equal(item, &needle)),
                _ => false,
            }),

            Condition::Compare { attr, op, value } => Ok(match both(source, attr, value) {
                Some((left, right)) => compare(&left, &right)
                    .map(|ordering| ordering_satisfies(ordering, *op))
                    .unwrap_or(false),
                None => false,
            }),

            Condition::Like { attr, pattern } => Ok(match source.attribute(attr) {
                Some(Value::String(s)) => pattern.is_match(&s),
                _ => false,
            }),

            Condition::IpInRange { attr, cidrs } => Ok(match source.attribute(attr) {
                Some(Value::String(s)) => s
                    .trim()
                    .parse::<IpAddr>()
                    .map(|ip| cidrs.iter().any(|range| range.contains(&ip)))
                    .unwrap_or(false),
                _ => false,
            }),

            Condition::Exists { attr } => Ok(!matches!(source.attribute(attr), None | Some(Value::Null))),

            Condition::And(args) => {
                let mut result = true;
                for arg in args {
                    result &= arg.eval_at(source, depth + 1)?;
                }
                Ok(result)
            }

            Condition::Or(args) => {
                let mut result = false;
                for arg in args {
                    result |= arg.eval_at(source, depth + 1)?;
                }
                Ok(result)
            }

            Condition::Not(arg) => Ok(!arg.eval_at(source, depth + 1)?),

            Condition::Unsupported { operator, .. } => {
                Err(ConditionError::UnsupportedOperator(operator.clone()))
            }

            Condition::Malformed { operator, reason, .. } => Err(ConditionError::Malformed {
                operator: operator.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

fn both(source: &dyn AttributeSource, attr: &AttributePath, operand: &Operand) -> Option<(Value, Value)> {
    let left = source.attribute(attr)?;
    let right = match operand {
        Operand::Literal(v) => v.clone(),
        Operand::Attr(path) => source.attribute(path)?,
    };
    Some((left, right))
}

/// JSON equality with numbers compared by value (`1 == 1.0`)
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// Numeric ordering when both sides are numbers, else timestamp ordering
fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (as_timestamp(left), as_timestamp(right)) {
        return Some(a.cmp(&b));
    }
    None
}

fn ordering_satisfies(ordering: Ordering, op: CompareOp) -> bool {
    match op {
        CompareOp::LessThan => ordering == Ordering::Less,
        CompareOp::LessThanOrEqual => ordering != Ordering::Greater,
        CompareOp::GreaterThan => ordering == Ordering::Greater,
        CompareOp::GreaterThanOrEqual => ordering != Ordering::Less,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct MapSource(HashMap<String, Value>);

    impl AttributeSource for MapSource {
        fn attribute(&self, path: &AttributePath) -> Option<Value> {
            self.0.get(&path.to_string()).cloned()
        }
    }

    fn source(pairs: &[(&str, Value)]) -> MapSource {
        MapSource(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    fn eval(condition: Value, src: &MapSource) -> Result<bool> {
        Condition::from_json(&condition).evaluate(src)
    }

    #[test]
    fn test_equality_and_membership() {
        let src = source(&[
            ("resource.env", json!("prod")),
            ("principal.groups", json!(["eng", "oncall"])),
            ("principal.id", json!("user:alice")),
            ("resource.owner", json!("user:alice")),
        ]);

        assert!(eval(json!({"op": "equals", "attr": "resource.env", "value": "prod"}), &src).unwrap());
        assert!(!eval(json!({"op": "not_equals", "attr": "resource.env", "value": "prod"}), &src).unwrap());
        assert!(eval(json!({"op": "in", "attr": "resource.env", "values": ["dev", "prod"]}), &src).unwrap());
        assert!(eval(json!({"op": "in", "attr": "principal.groups", "values": ["oncall"]}), &src).unwrap());
        assert!(eval(json!({"op": "contains", "attr": "principal.groups", "value": "eng"}), &src).unwrap());
        assert!(eval(
            json!({"op": "equals", "attr": "resource.owner", "value": {"attr": "principal.id"}}),
            &src
        )
        .unwrap());
    }

    #[test]
    fn test_missing_attribute_is_false() {
        let src = source(&[]);
        assert!(!eval(json!({"op": "equals", "attr": "context.env", "value": "prod"}), &src).unwrap());
        assert!(!eval(json!({"op": "not_equals", "attr": "context.env", "value": "prod"}), &src).unwrap());
        assert!(!eval(json!({"op": "exists", "attr": "context.env"}), &src).unwrap());
        assert!(eval(json!({"op": "not", "arg": {"op": "exists", "attr": "context.env"}}), &src).unwrap());
    }

    #[test]
    fn test_numeric_and_time_comparison() {
        let src = source(&[
            ("context.hour", json!("10")),
            ("context.riskScore", json!(42.5)),
            ("context.requestTime", json!("2025-06-01T12:00:00Z")),
        ]);

        assert!(eval(json!({"op": "ge", "attr": "context.hour", "value": 9}), &src).unwrap());
        assert!(eval(json!({"op": "lt", "attr": "context.hour", "value": 17}), &src).unwrap());
        assert!(!eval(json!({"op": "gt", "attr": "context.riskScore", "value": 50}), &src).unwrap());
        assert!(eval(
            json!({"op": "lt", "attr": "context.requestTime", "value": "2026-01-01T00:00:00Z"}),
            &src
        )
        .unwrap());
        assert!(!eval(
            json!({"op": "ge", "attr": "context.requestTime", "value": "2026-01-01T00:00:00+00:00"}),
            &src
        )
        .unwrap());
    }

    #[test]
    fn test_like_and_ip_range() {
        let src = source(&[("context.sourceIp", json!("10.4.2.1")), ("resource.name", json!("prod-db-1"))]);

        assert!(eval(json!({"op": "like", "attr": "resource.name", "pattern": "prod-*"}), &src).unwrap());
        assert!(eval(
            json!({"op": "ip_in_range", "attr": "context.sourceIp", "cidrs": ["192.168.0.0/16", "10.0.0.0/8"]}),
            &src
        )
        .unwrap());
        assert!(!eval(
            json!({"op": "ip_in_range", "attr": "context.sourceIp", "cidrs": ["172.16.0.0/12"]}),
            &src
        )
        .unwrap());
    }

    #[test]
    fn test_boolean_combinators() {
        let src = source(&[("context.mfa", json!(true))]);
        let mfa = json!({"op": "equals", "attr": "context.mfa", "value": true});

        assert!(eval(json!({"op": "and", "args": [mfa.clone(), {"op": "true"}]}), &src).unwrap());
        assert!(!eval(json!({"op": "and", "args": [mfa.clone(), {"op": "false"}]}), &src).unwrap());
        assert!(eval(json!({"op": "or", "args": [{"op": "false"}, mfa]}), &src).unwrap());
    }

    #[test]
    fn test_unknown_operator_fails_even_behind_false_branch() {
        let src = source(&[]);
        let result = eval(
            json!({"op": "and", "args": [{"op": "false"}, {"op": "time_between", "attr": "context.t"}]}),
            &src,
        );
        assert_eq!(
            result,
            Err(ConditionError::UnsupportedOperator("time_between".to_string()))
        );
    }
}
