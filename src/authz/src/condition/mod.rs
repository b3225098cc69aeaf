//! Typed condition language for policy evaluation
//!
//! Conditions are a small tagged-union AST evaluated by a tree-walking
//! interpreter ([`Condition::evaluate`]). The JSON form tags every node with
//! an `op` field:
//!
//! ```json
//! {"op": "and", "args": [
//!     {"op": "equals", "attr": "resource.env", "value": "prod"},
//!     {"op": "ip_in_range", "attr": "context.sourceIp", "cidrs": ["10.0.0.0/8"]},
//!     {"op": "lt", "attr": "context.requestTime", "value": "2030-01-01T00:00:00Z"}
//! ]}
//! ```
//!
//! Parsing never rejects a document outright. Unknown operators and
//! malformed nodes are kept as [`Condition::Unsupported`] and
//! [`Condition::Malformed`] so that a policy carrying them fails *at
//! evaluation time* with a typed error instead of being silently skipped.

pub mod error;
pub mod eval;
pub mod network;

pub use error::ConditionError;
pub use eval::AttributeSource;
pub use network::IpRange;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;

use crate::policy::pattern::Glob;

/// Maximum nesting depth of a condition tree
pub const MAX_CONDITION_DEPTH: usize = 32;

/// Reference to a request attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributePath {
    /// `context.<key>[.<nested>...]`
    Context(Vec<String>),
    /// `principal.<attr>`
    Principal(String),
    /// `resource.<attr>`
    Resource(String),
    /// `action`
    Action,
}

impl AttributePath {
    /// Parse a dotted path
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        if raw == "action" {
            return Ok(AttributePath::Action);
        }

        let (root, rest) = raw
            .split_once('.')
            .ok_or_else(|| format!("attribute path '{}' has no root", raw))?;

        if rest.is_empty() || rest.split('.').any(str::is_empty) {
            return Err(format!("attribute path '{}' has an empty segment", raw));
        }

        match root {
            "context" => Ok(AttributePath::Context(rest.split('.').map(str::to_string).collect())),
            "principal" => Ok(AttributePath::Principal(rest.to_string())),
            "resource" => Ok(AttributePath::Resource(rest.to_string())),
            other => Err(format!("unknown attribute root '{}'", other)),
        }
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributePath::Context(segments) => write!(f, "context.{}", segments.join(".")),
            AttributePath::Principal(attr) => write!(f, "principal.{}", attr),
            AttributePath::Resource(attr) => write!(f, "resource.{}", attr),
            AttributePath::Action => write!(f, "action"),
        }
    }
}

/// Right-hand side of a comparison: a literal or another attribute
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Attr(AttributePath),
}

impl Operand {
    fn parse(value: &Value) -> std::result::Result<Self, String> {
        if let Value::Object(map) = value {
            if map.len() == 1 {
                if let Some(Value::String(path)) = map.get("attr") {
                    return AttributePath::parse(path).map(Operand::Attr);
                }
            }
        }
        Ok(Operand::Literal(value.clone()))
    }

    fn to_json(&self) -> Value {
        match self {
            Operand::Literal(v) => v.clone(),
            Operand::Attr(path) => json!({ "attr": path.to_string() }),
        }
    }
}

/// Ordering operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl CompareOp {
    fn from_op(op: &str) -> Option<Self> {
        match op {
            "lt" => Some(CompareOp::LessThan),
            "le" => Some(CompareOp::LessThanOrEqual),
            "gt" => Some(CompareOp::GreaterThan),
            "ge" => Some(CompareOp::GreaterThanOrEqual),
            _ => None,
        }
    }

    fn as_op(self) -> &'static str {
        match self {
            CompareOp::LessThan => "lt",
            CompareOp::LessThanOrEqual => "le",
            CompareOp::GreaterThan => "gt",
            CompareOp::GreaterThanOrEqual => "ge",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareOp::LessThan => write!(f, "<"),
            CompareOp::LessThanOrEqual => write!(f, "<="),
            CompareOp::GreaterThan => write!(f, ">"),
            CompareOp::GreaterThanOrEqual => write!(f, ">="),
        }
    }
}

/// Condition expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    True,
    False,
    Equals { attr: AttributePath, value: Operand },
    NotEquals { attr: AttributePath, value: Operand },
    /// Attribute value is one of `values` (for a set attribute: any element is)
    In { attr: AttributePath, values: Vec<Value> },
    /// Set attribute contains `value`
    Contains { attr: AttributePath, value: Operand },
    /// Numeric or RFC 3339 timestamp ordering
    Compare { attr: AttributePath, op: CompareOp, value: Operand },
    /// String attribute matches a wildcard pattern
    Like { attr: AttributePath, pattern: Glob },
    /// IP address attribute falls in any of the ranges
    IpInRange { attr: AttributePath, cidrs: Vec<IpRange> },
    /// Attribute is present
    Exists { attr: AttributePath },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    /// Operator this engine does not implement
    Unsupported { operator: String, raw: Value },
    /// Known operator with invalid operands
    Malformed { operator: String, reason: String, raw: Value },
}

impl Condition {
    /// Parse a JSON condition; never fails, see the module docs
    pub fn from_json(value: &Value) -> Self {
        Self::parse_node(value, 0)
    }

    fn parse_node(value: &Value, depth: usize) -> Self {
        let malformed = |operator: &str, reason: String| Condition::Malformed {
            operator: operator.to_string(),
            reason,
            raw: value.clone(),
        };

        if depth > MAX_CONDITION_DEPTH {
            return malformed("", format!("nesting exceeds {} levels", MAX_CONDITION_DEPTH));
        }

        let Value::Object(node) = value else {
            return malformed("", "condition node must be an object".to_string());
        };
        let Some(Value::String(op)) = node.get("op") else {
            return malformed("", "condition node has no 'op' field".to_string());
        };
        let op = op.as_str();

        let attr = || -> std::result::Result<AttributePath, String> {
            match node.get("attr") {
                Some(Value::String(path)) => AttributePath::parse(path),
                _ => Err("missing string field 'attr'".to_string()),
            }
        };
        let operand = |field: &str| -> std::result::Result<Operand, String> {
            node.get(field)
                .ok_or_else(|| format!("missing field '{}'", field))
                .and_then(Operand::parse)
        };
        let children = |field: &str| -> std::result::Result<Vec<Condition>, String> {
            match node.get(field) {
                Some(Value::Array(items)) if !items.is_empty() => {
                    Ok(items.iter().map(|c| Self::parse_node(c, depth + 1)).collect())
                }
                Some(Value::Array(_)) => Err(format!("'{}' must not be empty", field)),
                _ => Err(format!("missing array field '{}'", field)),
            }
        };

        let parsed = match op {
            "true" => Ok(Condition::True),
            "false" => Ok(Condition::False),
            "equals" => attr().and_then(|attr| {
                operand("value").map(|value| Condition::Equals { attr, value })
            }),
            "not_equals" => attr().and_then(|attr| {
                operand("value").map(|value| Condition::NotEquals { attr, value })
            }),
            "in" => attr().and_then(|attr| match node.get("values") {
                Some(Value::Array(values)) => Ok(Condition::In {
                    attr,
                    values: values.clone(),
                }),
                _ => Err("missing array field 'values'".to_string()),
            }),
            "contains" => attr().and_then(|attr| {
                operand("value").map(|value| Condition::Contains { attr, value })
            }),
            "lt" | "le" | "gt" | "ge" => attr().and_then(|attr| {
                let value = operand("value")?;
                if let Operand::Literal(literal) = &value {
                    if !is_orderable_literal(literal) {
                        return Err(format!(
                            "'{}' needs a number or RFC 3339 timestamp, got {}",
                            op, literal
                        ));
                    }
                }
                let cmp = CompareOp::from_op(op).ok_or_else(|| format!("unknown comparison '{}'", op))?;
                Ok(Condition::Compare { attr, op: cmp, value })
            }),
            "like" => attr().and_then(|attr| match node.get("pattern") {
                Some(Value::String(raw)) => Glob::new(raw.as_str()).map(|pattern| Condition::Like { attr, pattern }),
                _ => Err("missing string field 'pattern'".to_string()),
            }),
            "ip_in_range" => attr().and_then(|attr| match node.get("cidrs") {
                Some(Value::Array(items)) if !items.is_empty() => items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.parse::<IpRange>(),
                        other => Err(format!("CIDR must be a string, got {}", other)),
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map(|cidrs| Condition::IpInRange { attr, cidrs }),
                _ => Err("missing non-empty array field 'cidrs'".to_string()),
            }),
            "exists" => attr().map(|attr| Condition::Exists { attr }),
            "and" => children("args").map(Condition::And),
            "or" => children("args").map(Condition::Or),
            "not" => match node.get("arg") {
                Some(child) => Ok(Condition::Not(Box::new(Self::parse_node(child, depth + 1)))),
                None => Err("missing field 'arg'".to_string()),
            },
            unknown => {
                return Condition::Unsupported {
                    operator: unknown.to_string(),
                    raw: value.clone(),
                }
            }
        };

        parsed.unwrap_or_else(|reason| malformed(op, reason))
    }

    /// JSON form of this condition
    pub fn to_json(&self) -> Value {
        match self {
            Condition::True => json!({"op": "true"}),
            Condition::False => json!({"op": "false"}),
            Condition::Equals { attr, value } => {
                json!({"op": "equals", "attr": attr.to_string(), "value": value.to_json()})
            }
            Condition::NotEquals { attr, value } => {
                json!({"op": "not_equals", "attr": attr.to_string(), "value": value.to_json()})
            }
            Condition::In { attr, values } => {
                json!({"op": "in", "attr": attr.to_string(), "values": values})
            }
            Condition::Contains { attr, value } => {
                json!({"op": "contains", "attr": attr.to_string(), "value": value.to_json()})
            }
            Condition::Compare { attr, op, value } => {
                json!({"op": op.as_op(), "attr": attr.to_string(), "value": value.to_json()})
            }
            Condition::Like { attr, pattern } => {
                json!({"op": "like", "attr": attr.to_string(), "pattern": pattern.as_str()})
            }
            Condition::IpInRange { attr, cidrs } => {
                let cidrs: Vec<String> = cidrs.iter().map(|c| c.to_string()).collect();
                json!({"op": "ip_in_range", "attr": attr.to_string(), "cidrs": cidrs})
            }
            Condition::Exists { attr } => json!({"op": "exists", "attr": attr.to_string()}),
            Condition::And(args) => {
                json!({"op": "and", "args": args.iter().map(Condition::to_json).collect::<Vec<_>>()})
            }
            Condition::Or(args) => {
                json!({"op": "or", "args": args.iter().map(Condition::to_json).collect::<Vec<_>>()})
            }
            Condition::Not(arg) => json!({"op": "not", "arg": arg.to_json()}),
            Condition::Unsupported { raw, .. } | Condition::Malformed { raw, .. } => raw.clone(),
        }
    }

    /// Every problem that will make evaluation fail, depth-first
    pub fn problems(&self) -> Vec<ConditionError> {
        let mut out = Vec::new();
        self.collect_problems(&mut out);
        out
    }

    fn collect_problems(&self, out: &mut Vec<ConditionError>) {
        match self {
            Condition::Unsupported { operator, .. } => {
                out.push(ConditionError::UnsupportedOperator(operator.clone()))
            }
            Condition::Malformed { operator, reason, .. } => out.push(ConditionError::Malformed {
                operator: operator.clone(),
                reason: reason.clone(),
            }),
            Condition::And(args) | Condition::Or(args) => {
                args.iter().for_each(|c| c.collect_problems(out))
            }
            Condition::Not(arg) => arg.collect_problems(out),
            _ => {}
        }
    }

    /// Top-level `context.*` keys this condition reads
    pub fn context_keys(&self, out: &mut BTreeSet<String>) {
        match self {
            Condition::Equals { attr, value }
            | Condition::NotEquals { attr, value }
            | Condition::Contains { attr, value }
            | Condition::Compare { attr, value, .. } => {
                add_context_key(attr, out);
                if let Operand::Attr(path) = value {
                    add_context_key(path, out);
                }
            }
            Condition::In { attr, .. }
            | Condition::Like { attr, .. }
            | Condition::IpInRange { attr, .. }
            | Condition::Exists { attr } => add_context_key(attr, out),
            Condition::And(args) | Condition::Or(args) => {
                args.iter().for_each(|c| c.context_keys(out))
            }
            Condition::Not(arg) => arg.context_keys(out),
            Condition::True
            | Condition::False
            | Condition::Unsupported { .. }
            | Condition::Malformed { .. } => {}
        }
    }
}

fn add_context_key(path: &AttributePath, out: &mut BTreeSet<String>) {
    if let AttributePath::Context(segments) = path {
        if let Some(first) = segments.first() {
            out.insert(first.clone());
        }
    }
}

pub(crate) fn is_orderable_literal(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => parse_timestamp(s).is_some(),
        _ => false,
    }
}

pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Condition::from_json(&value))
    }
}

impl From<Condition> for Value {
    fn from(condition: Condition) -> Self {
        condition.to_json()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}
