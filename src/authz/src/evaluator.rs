//! Single-policy evaluation
//!
//! Evaluation is pure and synchronous: all entities are resolved before a
//! policy is looked at, so the evaluator never blocks and never touches a
//! store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::error;

use crate::condition::{AttributePath, AttributeSource};
use crate::entity::Entity;
use crate::error::{AuthzError, Result};
use crate::policy::{Effect, Policy};
use crate::types::{AuthzRequest, PolicyId};

/// Tri-state result of evaluating one policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyOutcome {
    Permit,
    Forbid,
    NotApplicable,
}

impl From<Effect> for PolicyOutcome {
    fn from(effect: Effect) -> Self {
        match effect {
            Effect::Permit => PolicyOutcome::Permit,
            Effect::Forbid => PolicyOutcome::Forbid,
        }
    }
}

impl fmt::Display for PolicyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyOutcome::Permit => write!(f, "Permit"),
            PolicyOutcome::Forbid => write!(f, "Forbid"),
            PolicyOutcome::NotApplicable => write!(f, "NotApplicable"),
        }
    }
}

/// Outcome plus the reasons that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub policy_id: PolicyId,
    pub outcome: PolicyOutcome,
    pub trail: Vec<String>,
}

/// Everything a policy can be matched against
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub request: &'a AuthzRequest,

    /// Effective identities, requester first
    pub chain: &'a [Entity],

    pub resource: &'a Entity,
}

impl<'a> EvalContext<'a> {
    pub fn new(request: &'a AuthzRequest, chain: &'a [Entity], resource: &'a Entity) -> Self {
        Self {
            request,
            chain,
            resource,
        }
    }

    /// The identity that made the request
    pub fn requester(&self) -> Option<&'a Entity> {
        self.chain.first()
    }
}

impl AttributeSource for EvalContext<'_> {
    fn attribute(&self, path: &AttributePath) -> Option<Value> {
        match path {
            AttributePath::Context(segments) => {
                let (first, rest) = segments.split_first()?;
                let mut value = self.request.context.get(first)?;
                for segment in rest {
                    value = value.get(segment.as_str())?;
                }
                Some(value.clone())
            }
            AttributePath::Principal(name) => self.requester()?.attribute(name),
            AttributePath::Resource(name) => self.resource.attribute(name),
            AttributePath::Action => Some(Value::String(self.request.action.clone())),
        }
    }
}

/// Evaluate `policy` against `ctx`
///
/// Scope is checked first; a scope miss is `NotApplicable` without looking
/// at conditions. A condition that cannot be evaluated is an error, never a
/// quiet `false`.
pub fn evaluate(policy: &Policy, ctx: &EvalContext<'_>) -> Result<Evaluation> {
    let mut trail = Vec::new();
    let not_applicable = |trail| Evaluation {
        policy_id: policy.id.clone(),
        outcome: PolicyOutcome::NotApplicable,
        trail,
    };

    let matched = ctx
        .chain
        .iter()
        .find(|identity| policy.scope.principal.matches_entity(identity));
    match matched {
        Some(identity) => trail.push(format!("principal matched via {}", identity.id)),
        None => {
            trail.push(format!("principal pattern {} did not match", policy.scope.principal));
            return Ok(not_applicable(trail));
        }
    }

    if !policy.scope.action.matches_str(&ctx.request.action) {
        trail.push(format!("action pattern {} did not match", policy.scope.action));
        return Ok(not_applicable(trail));
    }

    if !policy.scope.resource.matches_entity(ctx.resource) {
        trail.push(format!("resource pattern {} did not match", policy.scope.resource));
        return Ok(not_applicable(trail));
    }

    if let Some(condition) = &policy.conditions {
        let satisfied = condition.evaluate(ctx).map_err(|e| {
            error!("Policy '{}' has a malformed condition: {}", policy.id, e);
            AuthzError::MalformedPolicyCondition {
                policy_id: policy.id.clone(),
                reason: e.to_string(),
            }
        })?;
        if !satisfied {
            trail.push("conditions evaluated to false".to_string());
            return Ok(not_applicable(trail));
        }
        trail.push("conditions satisfied".to_string());
    }

    trail.push(format!("effect {}", policy.effect));
    Ok(Evaluation {
        policy_id: policy.id.clone(),
        outcome: policy.effect.into(),
        trail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::policy::{Attachment, AttachmentKind, Pattern};
    use serde_json::json;

    fn read_policy() -> crate::policy::PolicyBuilder {
        Policy::builder(
            "alice-read",
            Effect::Permit,
            Attachment::new(AttachmentKind::IdentityPolicy, "user:alice"),
        )
        .action(Pattern::exact("doc:Read"))
        .resource(Pattern::glob("doc:*").unwrap())
    }

    #[test]
    fn test_scope_match() {
        let alice = Entity::user("user:alice", "111");
        let doc = Entity::resource("doc:123", "111");
        let chain = [alice];
        let request = AuthzRequest::new("user:alice", "doc:Read", "doc:123");
        let ctx = EvalContext::new(&request, &chain, &doc);

        let evaluation = evaluate(&read_policy().build().unwrap(), &ctx).unwrap();
        assert_eq!(evaluation.outcome, PolicyOutcome::Permit);

        let write = AuthzRequest::new("user:alice", "doc:Write", "doc:123");
        let ctx = EvalContext::new(&write, &chain, &doc);
        let evaluation = evaluate(&read_policy().build().unwrap(), &ctx).unwrap();
        assert_eq!(evaluation.outcome, PolicyOutcome::NotApplicable);
    }

    #[test]
    fn test_principal_matches_chain_member() {
        let session = Entity::session("session:s1", "111", "role:RoleA", chrono::Utc::now());
        let role = Entity::role("role:RoleA", "111");
        let chain = [session, role];
        let bucket = Entity::resource("bucket:photos", "222");
        let request = AuthzRequest::new("session:s1", "bucket:GetObject", "bucket:photos");
        let ctx = EvalContext::new(&request, &chain, &bucket);

        let policy = Policy::builder(
            "trust-111",
            Effect::Permit,
            Attachment::new(AttachmentKind::ResourcePolicy, "bucket:photos"),
        )
        .principal(Pattern::exact("role:RoleA"))
        .build()
        .unwrap();

        assert_eq!(evaluate(&policy, &ctx).unwrap().outcome, PolicyOutcome::Permit);
    }

    #[test]
    fn test_conditions() {
        let alice = Entity::user("user:alice", "111").with_attribute("department", "eng");
        let doc = Entity::resource("doc:123", "111").with_attribute("env", "prod");
        let chain = [alice];
        let policy = read_policy()
            .conditions(Condition::from_json(&json!({"op": "and", "args": [
                {"op": "equals", "attr": "principal.department", "value": "eng"},
                {"op": "equals", "attr": "resource.env", "value": "prod"},
                {"op": "equals", "attr": "context.net.zone", "value": "corp"}
            ]})))
            .build()
            .unwrap();

        let inside = AuthzRequest::new("user:alice", "doc:Read", "doc:123")
            .with_context("net", json!({"zone": "corp"}));
        let ctx = EvalContext::new(&inside, &chain, &doc);
        assert_eq!(evaluate(&policy, &ctx).unwrap().outcome, PolicyOutcome::Permit);

        let outside = AuthzRequest::new("user:alice", "doc:Read", "doc:123")
            .with_context("net", json!({"zone": "public"}));
        let ctx = EvalContext::new(&outside, &chain, &doc);
        let evaluation = evaluate(&policy, &ctx).unwrap();
        assert_eq!(evaluation.outcome, PolicyOutcome::NotApplicable);
        assert!(evaluation.trail.iter().any(|t| t.contains("false")));
    }

    #[test]
    fn test_malformed_condition_is_error() {
        let alice = Entity::user("user:alice", "111");
        let doc = Entity::resource("doc:123", "111");
        let chain = [alice];
        let request = AuthzRequest::new("user:alice", "doc:Read", "doc:123");
        let ctx = EvalContext::new(&request, &chain, &doc);

        let policy = read_policy()
            .conditions(Condition::from_json(&json!({"op": "regex_match", "attr": "context.x"})))
            .build()
            .unwrap();

        let err = evaluate(&policy, &ctx).unwrap_err();
        assert!(matches!(err, AuthzError::MalformedPolicyCondition { ref policy_id, .. } if policy_id == "alice-read"));
    }
}
