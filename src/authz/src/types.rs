//! Core authorization types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Unique policy identifier
pub type PolicyId = String;

/// Account identifier (e.g., "111122223333")
pub type AccountId = String;

/// Open attribute bag carried by a request (source IP, timestamp, tags, ...)
pub type ContextMap = HashMap<String, Value>;

/// Kind of principal making a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// Long-lived human or service identity
    User,
    /// Assumable role
    Role,
    /// Temporary session assumed from a role
    Session,
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrincipalKind::User => write!(f, "user"),
            PrincipalKind::Role => write!(f, "role"),
            PrincipalKind::Session => write!(f, "session"),
        }
    }
}

/// Authorization request
///
/// Immutable for the duration of a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthzRequest {
    /// Who is making the request (e.g., "user:alice")
    pub principal: String,

    /// Namespaced action (e.g., "doc:Read")
    pub action: String,

    /// What resource is being accessed (e.g., "doc:123")
    pub resource: String,

    /// Additional context (source IP, time, request tags)
    #[serde(default)]
    pub context: ContextMap,
}

impl AuthzRequest {
    /// Create a request with an empty context
    pub fn new(
        principal: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            principal: principal.into(),
            action: action.into(),
            resource: resource.into(),
            context: HashMap::new(),
        }
    }

    /// Add a context attribute
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Service namespace of the action ("doc" for "doc:Read")
    pub fn action_service(&self) -> Option<&str> {
        self.action.split_once(':').map(|(service, _)| service)
    }
}
