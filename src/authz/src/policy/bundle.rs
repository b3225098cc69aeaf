//! JSON policy bundles
//!
//! A bundle seeds a policy store and an entity directory from one file:
//!
//! ```json
//! {
//!   "policies": [{"id": "...", "effect": "permit", "attachment": {...}}],
//!   "entities": [{"id": "user:alice", "kind": "user", "account": "111"}]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use super::{store::InMemoryPolicyStore, Policy};
use crate::entity::{Entity, InMemoryEntityDirectory};
use crate::error::{AuthzError, Result};

/// Policies and entities loaded together
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyBundle {
    #[serde(default)]
    pub policies: Vec<Policy>,

    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl PolicyBundle {
    /// Parse a bundle from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let bundle: PolicyBundle = serde_json::from_str(text)?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Read and parse a bundle file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let bundle = Self::from_json(&text)?;
        info!(
            "Loaded bundle {} ({} policies, {} entities)",
            path.display(),
            bundle.policies.len(),
            bundle.entities.len()
        );
        Ok(bundle)
    }

    /// Reject duplicate ids and invalid policies
    pub fn validate(&self) -> Result<()> {
        let mut policy_ids = HashSet::new();
        for policy in &self.policies {
            policy.validate()?;
            if !policy_ids.insert(policy.id.as_str()) {
                return Err(AuthzError::InvalidPolicy(format!(
                    "duplicate policy id '{}' in bundle",
                    policy.id
                )));
            }
        }

        let mut entity_ids = HashSet::new();
        for entity in &self.entities {
            if entity.id.trim().is_empty() {
                return Err(AuthzError::InvalidInput("entity id cannot be empty".to_string()));
            }
            if !entity_ids.insert(entity.id.as_str()) {
                return Err(AuthzError::InvalidInput(format!(
                    "duplicate entity id '{}' in bundle",
                    entity.id
                )));
            }
        }
        Ok(())
    }

    /// Build a policy store and an entity directory from the bundle
    pub async fn into_stores(self) -> Result<(InMemoryPolicyStore, InMemoryEntityDirectory)> {
        let store = InMemoryPolicyStore::with_policies(self.policies).await?;
        let directory = InMemoryEntityDirectory::with_entities(self.entities);
        Ok((store, directory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::store::PolicyStore;
    use crate::policy::AttachmentKind;

    const BUNDLE: &str = r#"{
        "policies": [
            {
                "id": "alice-read",
                "effect": "permit",
                "scope": {"action": "doc:Read", "resource": "doc:*"},
                "attachment": {"kind": "identity_policy", "target": "user:alice"}
            }
        ],
        "entities": [
            {"id": "user:alice", "kind": "user", "account": "111"},
            {"id": "doc:123", "kind": "resource", "account": "111"}
        ]
    }"#;

    #[tokio::test]
    async fn test_bundle_into_stores() {
        let bundle = PolicyBundle::from_json(BUNDLE).unwrap();
        let (store, directory) = bundle.into_stores().await.unwrap();

        let set = store
            .get_policies_for(AttachmentKind::IdentityPolicy, "user:alice")
            .await
            .unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(directory.len().await, 2);
    }

    #[test]
    fn test_duplicate_policy_rejected() {
        let text = r#"{"policies": [
            {"id": "p", "effect": "permit", "attachment": {"kind": "identity_policy", "target": "user:a"}},
            {"id": "p", "effect": "forbid", "attachment": {"kind": "identity_policy", "target": "user:b"}}
        ]}"#;
        assert!(matches!(
            PolicyBundle::from_json(text),
            Err(AuthzError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            PolicyBundle::from_json("{not json"),
            Err(AuthzError::Serialization(_))
        ));
    }
}
