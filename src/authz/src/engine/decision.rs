//! Authorization decisions and their explanation trail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::AuthzError;
use crate::evaluator::PolicyOutcome;
use crate::policy::AttachmentKind;
use crate::types::PolicyId;

/// Final answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionOutcome {
    Allow,
    Deny,
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionOutcome::Allow => write!(f, "Allow"),
            DecisionOutcome::Deny => write!(f, "Deny"),
        }
    }
}

/// Stage of the decision algorithm a factor was produced by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStep {
    /// Resolving the principal, resource and delegation chain
    Resolution,
    Organization,
    PermissionBoundary,
    Session,
    Identity,
    Resource,
    /// The decision did not finish in time
    Deadline,
}

impl DecisionStep {
    /// Attachment kind consulted by the step, if any
    pub fn attachment(self) -> Option<AttachmentKind> {
        match self {
            DecisionStep::Organization => Some(AttachmentKind::OrganizationPolicy),
            DecisionStep::PermissionBoundary => Some(AttachmentKind::PermissionBoundary),
            DecisionStep::Session => Some(AttachmentKind::SessionPolicy),
            DecisionStep::Identity => Some(AttachmentKind::IdentityPolicy),
            DecisionStep::Resource => Some(AttachmentKind::ResourcePolicy),
            DecisionStep::Resolution | DecisionStep::Deadline => None,
        }
    }
}

/// Typed error recorded in a factor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorError {
    pub code: String,
    pub message: String,
}

impl From<&AuthzError> for FactorError {
    fn from(err: &AuthzError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// One entry of the explanation trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterminingFactor {
    pub step: DecisionStep,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentKind>,

    /// Policies that produced `effect` (all consulted ids when NotApplicable)
    #[serde(default)]
    pub policy_ids: Vec<PolicyId>,

    pub effect: PolicyOutcome,

    /// Identity the step was evaluated for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FactorError>,
}

impl DeterminingFactor {
    pub fn new(step: DecisionStep, effect: PolicyOutcome, policy_ids: Vec<PolicyId>) -> Self {
        Self {
            step,
            attachment: step.attachment(),
            policy_ids,
            effect,
            identity: None,
            error: None,
        }
    }

    /// Factor recording a failure; failures never contribute a Permit
    pub fn failure(step: DecisionStep, err: &AuthzError) -> Self {
        Self {
            error: Some(err.into()),
            ..Self::new(step, PolicyOutcome::NotApplicable, Vec::new())
        }
    }

    pub fn for_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Whether the factor swayed the decision (Permit, Forbid or an error)
    pub fn is_contributing(&self) -> bool {
        self.effect != PolicyOutcome::NotApplicable || self.error.is_some()
    }
}

impl fmt::Display for DeterminingFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.attachment, &self.error) {
            (_, Some(err)) => write!(f, "{:?}:{}", self.step, err.code),
            (Some(kind), None) => write!(f, "{}:{}", kind, self.effect),
            (None, None) => write!(f, "{:?}:{}", self.step, self.effect),
        }
    }
}

/// Authorization decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Unique per call, including cache hits
    pub request_id: String,

    pub decision: DecisionOutcome,

    /// Ordered trail, one or more entries per evaluated step
    pub determining_factors: Vec<DeterminingFactor>,

    pub evaluated_at: DateTime<Utc>,

    /// Served from the decision cache
    #[serde(default)]
    pub cached: bool,
}

impl Decision {
    fn new(
        decision: DecisionOutcome,
        determining_factors: Vec<DeterminingFactor>,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            decision,
            determining_factors,
            evaluated_at,
            cached: false,
        }
    }

    /// Create an allow decision
    pub fn allow(factors: Vec<DeterminingFactor>, evaluated_at: DateTime<Utc>) -> Self {
        Self::new(DecisionOutcome::Allow, factors, evaluated_at)
    }

    /// Create a deny decision
    pub fn deny(factors: Vec<DeterminingFactor>, evaluated_at: DateTime<Utc>) -> Self {
        Self::new(DecisionOutcome::Deny, factors, evaluated_at)
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == DecisionOutcome::Allow
    }

    /// Factors that contributed Permit, Forbid or an error
    pub fn contributing_factors(&self) -> Vec<&DeterminingFactor> {
        self.determining_factors
            .iter()
            .filter(|f| f.is_contributing())
            .collect()
    }

    /// Errors recorded during evaluation
    pub fn errors(&self) -> impl Iterator<Item = &FactorError> {
        self.determining_factors.iter().filter_map(|f| f.error.as_ref())
    }

    /// Whether an error with `code` was recorded
    pub fn has_error(&self, code: &str) -> bool {
        self.errors().any(|e| e.code == code)
    }

    /// Copy handed out for a cache hit
    pub(crate) fn replay(&self) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cached: true,
            ..self.clone()
        }
    }
}
