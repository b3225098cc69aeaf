//! Scope patterns for principals, actions and resources

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::entity::Entity;
use crate::types::AccountId;

/// Shell-style wildcard pattern (`*` any run, `?` one character)
#[derive(Debug, Clone)]
pub struct Glob {
    raw: String,
    regex: Regex,
}

impl Glob {
    /// Compile a wildcard pattern
    pub fn new(raw: impl Into<String>) -> Result<Self, String> {
        let raw = raw.into();
        let regex_pattern = regex::escape(&raw).replace(r"\*", ".*").replace(r"\?", ".");
        let regex = Regex::new(&format!("^{}$", regex_pattern))
            .map_err(|e| format!("invalid wildcard pattern '{}': {}", raw, e))?;
        Ok(Self { raw, regex })
    }

    /// Whether `value` matches
    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    /// The source pattern
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn has_wildcards(raw: &str) -> bool {
        raw.contains('*') || raw.contains('?')
    }
}

impl PartialEq for Glob {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Glob {}

impl fmt::Display for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Pattern selecting principals, resources or actions
///
/// In JSON a plain string is shorthand: `"*"` is [`Pattern::Any`], a string
/// with wildcards is a [`Pattern::Glob`], anything else is
/// [`Pattern::Exact`]. The other forms use an object key:
/// `{"account": "111"}`, `{"attribute": {"name": "groups", "value": "eng"}}`,
/// `{"any_of": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PatternRepr", into = "PatternRepr")]
pub enum Pattern {
    /// Matches everything
    Any,
    /// Matches one identifier
    Exact(String),
    /// Matches identifiers by wildcard
    Glob(Glob),
    /// Matches any entity owned by the account
    Account(AccountId),
    /// Matches entities whose attribute equals (or contains) the value
    Attribute { name: String, value: Value },
    /// Matches if any alternative matches
    AnyOf(Vec<Pattern>),
}

impl Default for Pattern {
    fn default() -> Self {
        Pattern::Any
    }
}

impl Pattern {
    /// Exact identifier pattern
    pub fn exact(id: impl Into<String>) -> Self {
        Pattern::Exact(id.into())
    }

    /// Wildcard pattern; a string without wildcards becomes an exact match
    pub fn glob(raw: &str) -> Result<Self, String> {
        if raw == "*" {
            Ok(Pattern::Any)
        } else if Glob::has_wildcards(raw) {
            Glob::new(raw).map(Pattern::Glob)
        } else {
            Ok(Pattern::Exact(raw.to_string()))
        }
    }

    /// Whole-account pattern
    pub fn account(account: impl Into<AccountId>) -> Self {
        Pattern::Account(account.into())
    }

    /// Attribute-condition pattern
    pub fn attribute(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Pattern::Attribute {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Match against a resolved entity
    pub fn matches_entity(&self, entity: &Entity) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(id) => id == &entity.id,
            Pattern::Glob(glob) => glob.is_match(&entity.id),
            Pattern::Account(account) => account == &entity.account,
            Pattern::Attribute { name, value } => entity.attribute_matches(name, value),
            Pattern::AnyOf(patterns) => patterns.iter().any(|p| p.matches_entity(entity)),
        }
    }

    /// Match against a bare string (actions); account and attribute patterns
    /// never match strings
    pub fn matches_str(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(expected) => expected == value,
            Pattern::Glob(glob) => glob.is_match(value),
            Pattern::Account(_) | Pattern::Attribute { .. } => false,
            Pattern::AnyOf(patterns) => patterns.iter().any(|p| p.matches_str(value)),
        }
    }

    /// Whether the pattern only uses forms that apply to plain strings
    pub fn is_string_pattern(&self) -> bool {
        match self {
            Pattern::Any | Pattern::Exact(_) | Pattern::Glob(_) => true,
            Pattern::Account(_) | Pattern::Attribute { .. } => false,
            Pattern::AnyOf(patterns) => patterns.iter().all(Pattern::is_string_pattern),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => write!(f, "*"),
            Pattern::Exact(id) => write!(f, "{}", id),
            Pattern::Glob(glob) => write!(f, "{}", glob),
            Pattern::Account(account) => write!(f, "account({})", account),
            Pattern::Attribute { name, value } => write!(f, "{}={}", name, value),
            Pattern::AnyOf(patterns) => {
                let parts: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PatternRepr {
    Short(String),
    Tagged(TaggedPattern),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaggedPattern {
    Exact(String),
    Glob(String),
    Account(String),
    Attribute { name: String, value: Value },
    AnyOf(Vec<Pattern>),
}

impl TryFrom<PatternRepr> for Pattern {
    type Error = String;

    fn try_from(repr: PatternRepr) -> Result<Self, Self::Error> {
        match repr {
            PatternRepr::Short(raw) => Pattern::glob(&raw),
            PatternRepr::Tagged(TaggedPattern::Exact(id)) => Ok(Pattern::Exact(id)),
            PatternRepr::Tagged(TaggedPattern::Glob(raw)) => Glob::new(raw).map(Pattern::Glob),
            PatternRepr::Tagged(TaggedPattern::Account(account)) => Ok(Pattern::Account(account)),
            PatternRepr::Tagged(TaggedPattern::Attribute { name, value }) => {
                Ok(Pattern::Attribute { name, value })
            }
            PatternRepr::Tagged(TaggedPattern::AnyOf(patterns)) => Ok(Pattern::AnyOf(patterns)),
        }
    }
}

impl From<Pattern> for PatternRepr {
    fn from(pattern: Pattern) -> Self {
        match pattern {
            Pattern::Any => PatternRepr::Short("*".to_string()),
            Pattern::Exact(id) if !Glob::has_wildcards(&id) => PatternRepr::Short(id),
            Pattern::Exact(id) => PatternRepr::Tagged(TaggedPattern::Exact(id)),
            Pattern::Glob(glob) if Glob::has_wildcards(&glob.raw) => PatternRepr::Short(glob.raw),
            Pattern::Glob(glob) => PatternRepr::Tagged(TaggedPattern::Glob(glob.raw)),
            Pattern::Account(account) => PatternRepr::Tagged(TaggedPattern::Account(account)),
            Pattern::Attribute { name, value } => {
                PatternRepr::Tagged(TaggedPattern::Attribute { name, value })
            }
            Pattern::AnyOf(patterns) => PatternRepr::Tagged(TaggedPattern::AnyOf(patterns)),
        }
    }
}
