//! Error types for condition parsing and evaluation

use thiserror::Error;

/// Condition errors
///
/// Every variant means the policy author wrote something the engine cannot
/// evaluate; the evaluator turns them into `MalformedPolicyCondition`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("unsupported operator '{0}'")]
    UnsupportedOperator(String),

    #[error("malformed '{operator}' node: {reason}")]
    Malformed { operator: String, reason: String },

    #[error("condition nesting exceeds {0} levels")]
    TooDeep(usize),
}

/// Result type for condition operations
pub type Result<T> = std::result::Result<T, ConditionError>;
