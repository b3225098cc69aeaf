//! Error types for the authorization engine

use thiserror::Error;

/// Authorization engine errors
///
/// Most variants are *policy-domain* errors: the engine recovers them into a
/// Deny decision and records them in the factor trail. Only `Internal` (and the
/// I/O and serialization errors raised while loading bundles) reach callers of
/// the decision API as `Err`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthzError {
    /// Principal or resource could not be resolved
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// A policy condition uses an unsupported or invalid operator
    #[error("Malformed condition in policy '{policy_id}': {reason}")]
    MalformedPolicyCondition { policy_id: String, reason: String },

    /// Delegation chain is longer than the configured bound
    #[error("Delegation chain for '{principal}' exceeds {max} hops")]
    DelegationDepthExceeded { principal: String, max: usize },

    /// Session principal is past its expiry
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Policy store could not serve a read
    #[error("Policy store unavailable: {0}")]
    PolicyStoreUnavailable(String),

    /// Decision did not complete within its hard deadline
    #[error("Decision exceeded its {0} ms deadline")]
    TimeoutExceeded(u64),

    /// Invalid policy definition
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthzError {
    /// Whether this error is recovered into a Deny decision rather than
    /// propagated to the caller
    ///
    /// Everything about the request, its entities, its policies or the
    /// policy backend is a domain error. Only `Internal` is a fault.
    pub fn is_policy_domain(&self) -> bool {
        match self {
            AuthzError::EntityNotFound(_)
            | AuthzError::MalformedPolicyCondition { .. }
            | AuthzError::DelegationDepthExceeded { .. }
            | AuthzError::SessionExpired(_)
            | AuthzError::PolicyStoreUnavailable(_)
            | AuthzError::TimeoutExceeded(_)
            | AuthzError::InvalidPolicy(_)
            | AuthzError::InvalidInput(_)
            | AuthzError::Serialization(_)
            | AuthzError::Io(_) => true,
            AuthzError::Internal(_) => false,
        }
    }

    /// Stable machine-readable code, used in factors and audit events
    pub fn code(&self) -> &'static str {
        match self {
            AuthzError::EntityNotFound(_) => "EntityNotFound",
            AuthzError::MalformedPolicyCondition { .. } => "MalformedPolicyCondition",
            AuthzError::DelegationDepthExceeded { .. } => "DelegationDepthExceeded",
            AuthzError::SessionExpired(_) => "SessionExpired",
            AuthzError::PolicyStoreUnavailable(_) => "PolicyStoreUnavailable",
            AuthzError::TimeoutExceeded(_) => "TimeoutExceeded",
            AuthzError::InvalidPolicy(_) => "InvalidPolicy",
            AuthzError::InvalidInput(_) => "InvalidInput",
            AuthzError::Serialization(_) => "Serialization",
            AuthzError::Io(_) => "Io",
            AuthzError::Internal(_) => "Internal",
        }
    }
}

impl From<std::io::Error> for AuthzError {
    fn from(err: std::io::Error) -> Self {
        AuthzError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AuthzError {
    fn from(err: serde_json::Error) -> Self {
        AuthzError::Serialization(err.to_string())
    }
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;
