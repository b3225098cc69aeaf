//! Policy definition and storage

pub mod bundle;
pub mod pattern;
pub mod store;

pub use bundle::PolicyBundle;
pub use pattern::{Glob, Pattern};
pub use store::{InMemoryPolicyStore, PolicyChange, PolicySet, PolicyStore};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::condition::Condition;
use crate::error::{AuthzError, Result};
use crate::types::PolicyId;

/// Policy effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Grant the action
    Permit,
    /// Refuse the action; overrides any Permit
    Forbid,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Permit => write!(f, "Permit"),
            Effect::Forbid => write!(f, "Forbid"),
        }
    }
}

/// Class of entity a policy is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// Attached to a user or role
    IdentityPolicy,
    /// Attached to a resource
    ResourcePolicy,
    /// Ceiling on what a user or role may be granted
    PermissionBoundary,
    /// Attached to a session
    SessionPolicy,
    /// Account-wide guardrail
    OrganizationPolicy,
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttachmentKind::IdentityPolicy => "IdentityPolicy",
            AttachmentKind::ResourcePolicy => "ResourcePolicy",
            AttachmentKind::PermissionBoundary => "PermissionBoundary",
            AttachmentKind::SessionPolicy => "SessionPolicy",
            AttachmentKind::OrganizationPolicy => "OrganizationPolicy",
        };
        f.write_str(name)
    }
}

/// Where a policy is attached
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment kind
    pub kind: AttachmentKind,

    /// Principal id, resource id, session id or account id
    pub target: String,
}

impl Attachment {
    pub fn new(kind: AttachmentKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }
}

/// Which principals, actions and resources a policy applies to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    /// Principal pattern (matched against the requester and its delegation chain)
    #[serde(default)]
    pub principal: Pattern,

    /// Action pattern
    #[serde(default)]
    pub action: Pattern,

    /// Resource pattern
    #[serde(default)]
    pub resource: Pattern,
}

/// Immutable, versioned policy document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy identifier
    pub id: PolicyId,

    /// Monotonic version per id
    #[serde(default = "default_version")]
    pub version: u64,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Permit or Forbid
    pub effect: Effect,

    /// Principal / action / resource patterns
    #[serde(default)]
    pub scope: Scope,

    /// Optional condition, evaluated at decision time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Condition>,

    /// Attachment point
    pub attachment: Attachment,
}

fn default_version() -> u64 {
    1
}

impl Policy {
    /// Start building a policy
    pub fn builder(id: impl Into<PolicyId>, effect: Effect, attachment: Attachment) -> PolicyBuilder {
        PolicyBuilder {
            policy: Policy {
                id: id.into(),
                version: 1,
                description: None,
                effect,
                scope: Scope::default(),
                conditions: None,
                attachment,
            },
        }
    }

    /// Attachment kind
    pub fn kind(&self) -> AttachmentKind {
        self.attachment.kind
    }

    /// Reject structurally invalid policies
    ///
    /// Conditions are deliberately not checked here: a policy carrying an
    /// unknown operator is stored and then fails loudly at evaluation.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(AuthzError::InvalidPolicy("policy id cannot be empty".to_string()));
        }
        if self.attachment.target.trim().is_empty() {
            return Err(AuthzError::InvalidPolicy(format!(
                "policy '{}' has an empty attachment target",
                self.id
            )));
        }
        if !self.scope.action.is_string_pattern() {
            return Err(AuthzError::InvalidPolicy(format!(
                "policy '{}' uses an account or attribute pattern for its action",
                self.id
            )));
        }
        Ok(())
    }

    /// Top-level context keys the conditions read
    pub fn context_keys(&self, out: &mut BTreeSet<String>) {
        if let Some(condition) = &self.conditions {
            condition.context_keys(out);
        }
    }
}

/// Fluent policy construction
pub struct PolicyBuilder {
    policy: Policy,
}

impl PolicyBuilder {
    pub fn version(mut self, version: u64) -> Self {
        self.policy.version = version;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.policy.description = Some(description.into());
        self
    }

    pub fn principal(mut self, pattern: Pattern) -> Self {
        self.policy.scope.principal = pattern;
        self
    }

    pub fn action(mut self, pattern: Pattern) -> Self {
        self.policy.scope.action = pattern;
        self
    }

    pub fn resource(mut self, pattern: Pattern) -> Self {
        self.policy.scope.resource = pattern;
        self
    }

    pub fn conditions(mut self, condition: Condition) -> Self {
        self.policy.conditions = Some(condition);
        self
    }

    /// Finish and validate
    pub fn build(self) -> Result<Policy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}
