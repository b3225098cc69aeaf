//! Policy storage
//!
//! The engine only reads through [`PolicyStore`]. Mutations arrive from an
//! external management plane and are applied to the in-memory store as
//! copy-on-write snapshot swaps, so every read observes one consistent
//! snapshot and never a half-applied batch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use super::{AttachmentKind, Policy};
use crate::error::{AuthzError, Result};
use crate::types::PolicyId;

/// Policies read from one snapshot, ordered by id
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    /// Snapshot version the policies were read from
    pub version: u64,

    /// Policies, sorted by id
    pub policies: Vec<Arc<Policy>>,
}

impl PolicySet {
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.policies.iter()
    }
}

/// Policy store trait
///
/// Reads must be snapshot-consistent per call. A store that cannot serve a
/// read returns [`AuthzError::PolicyStoreUnavailable`]; the engine then
/// fails closed.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Policies of `kind` attached to `target_id`
    async fn get_policies_for(&self, kind: AttachmentKind, target_id: &str) -> Result<PolicySet>;

    /// Organization guardrails of an account
    async fn get_all_organization_policies(&self, account_id: &str) -> Result<PolicySet> {
        self.get_policies_for(AttachmentKind::OrganizationPolicy, account_id)
            .await
    }
}

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Upsert,
    Remove,
}

/// Notification published for every accepted mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyChange {
    /// Snapshot version that contains the change
    pub version: u64,

    /// Changed policy
    pub policy_id: PolicyId,

    /// Attachment kind of the changed policy
    pub kind: AttachmentKind,

    /// Principal, resource, session or account the policy is attached to
    pub target: String,

    pub op: ChangeOp,
}

/// One step of an atomic batch
#[derive(Debug, Clone)]
pub enum PolicyMutation {
    Put(Policy),
    Remove(PolicyId),
}

type IndexKey = (AttachmentKind, String);

#[derive(Debug, Clone, Default)]
struct StoreState {
    version: u64,
    by_id: HashMap<PolicyId, Arc<Policy>>,
    index: HashMap<IndexKey, BTreeMap<PolicyId, Arc<Policy>>>,
}

impl StoreState {
    fn insert(&mut self, policy: Policy, changes: &mut Vec<PolicyChange>) -> Result<()> {
        policy.validate()?;

        if let Some(existing) = self.by_id.get(&policy.id) {
            if existing.version >= policy.version {
                return Err(AuthzError::InvalidPolicy(format!(
                    "policy '{}' version {} is not newer than stored version {}",
                    policy.id, policy.version, existing.version
                )));
            }
        }

        // Re-attachment: the old target loses the policy
        if let Some(previous) = self.remove_entry(&policy.id) {
            if previous.attachment != policy.attachment {
                changes.push(PolicyChange {
                    version: 0,
                    policy_id: previous.id.clone(),
                    kind: previous.attachment.kind,
                    target: previous.attachment.target.clone(),
                    op: ChangeOp::Remove,
                });
            }
        }

        let policy = Arc::new(policy);
        changes.push(PolicyChange {
            version: 0,
            policy_id: policy.id.clone(),
            kind: policy.attachment.kind,
            target: policy.attachment.target.clone(),
            op: ChangeOp::Upsert,
        });
        self.index
            .entry((policy.attachment.kind, policy.attachment.target.clone()))
            .or_default()
            .insert(policy.id.clone(), policy.clone());
        self.by_id.insert(policy.id.clone(), policy);
        Ok(())
    }

    fn remove(&mut self, id: &str, changes: &mut Vec<PolicyChange>) -> Option<Arc<Policy>> {
        let removed = self.remove_entry(id)?;
        changes.push(PolicyChange {
            version: 0,
            policy_id: removed.id.clone(),
            kind: removed.attachment.kind,
            target: removed.attachment.target.clone(),
            op: ChangeOp::Remove,
        });
        Some(removed)
    }

    fn remove_entry(&mut self, id: &str) -> Option<Arc<Policy>> {
        let removed = self.by_id.remove(id)?;
        let key = (removed.attachment.kind, removed.attachment.target.clone());
        if let Some(bucket) = self.index.get_mut(&key) {
            bucket.remove(id);
            if bucket.is_empty() {
                self.index.remove(&key);
            }
        }
        Some(removed)
    }
}

/// In-memory policy store implementation
pub struct InMemoryPolicyStore {
    state: RwLock<Arc<StoreState>>,
    changes: broadcast::Sender<PolicyChange>,
}

impl InMemoryPolicyStore {
    /// Create a new in-memory policy store
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            state: RwLock::new(Arc::new(StoreState::default())),
            changes,
        }
    }

    /// Create a store holding `policies`
    pub async fn with_policies(policies: impl IntoIterator<Item = Policy>) -> Result<Self> {
        let store = Self::new();
        store
            .apply(policies.into_iter().map(PolicyMutation::Put).collect())
            .await?;
        Ok(store)
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PolicyChange> {
        self.changes.subscribe()
    }

    /// Store a policy; its version must be newer than any stored version
    pub async fn put(&self, policy: Policy) -> Result<()> {
        self.apply(vec![PolicyMutation::Put(policy)]).await.map(|_| ())
    }

    /// Delete a policy
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let changes = self
            .apply(vec![PolicyMutation::Remove(id.to_string())])
            .await?;
        Ok(!changes.is_empty())
    }

    /// Apply a batch atomically: either every mutation lands in one new
    /// snapshot or none does
    pub async fn apply(&self, mutations: Vec<PolicyMutation>) -> Result<Vec<PolicyChange>> {
        let mut guard = self.state.write().await;
        let mut next: StoreState = (**guard).clone();
        let mut changes = Vec::new();

        for mutation in mutations {
            match mutation {
                PolicyMutation::Put(policy) => next.insert(policy, &mut changes)?,
                PolicyMutation::Remove(id) => {
                    if next.remove(&id, &mut changes).is_none() {
                        debug!("Remove of unknown policy '{}' ignored", id);
                    }
                }
            }
        }

        if changes.is_empty() {
            return Ok(changes);
        }

        next.version += 1;
        for change in &mut changes {
            change.version = next.version;
        }
        *guard = Arc::new(next);
        drop(guard);

        info!("Policy store advanced with {} change(s)", changes.len());
        for change in &changes {
            // No subscribers is fine
            let _ = self.changes.send(change.clone());
        }
        Ok(changes)
    }

    /// Get a policy by ID
    pub async fn get(&self, id: &str) -> Option<Arc<Policy>> {
        self.snapshot().await.by_id.get(id).cloned()
    }

    /// List all policies, sorted by id
    pub async fn list(&self) -> Vec<Arc<Policy>> {
        let snapshot = self.snapshot().await;
        let mut policies: Vec<_> = snapshot.by_id.values().cloned().collect();
        policies.sort_by(|a, b| a.id.cmp(&b.id));
        policies
    }

    /// Current snapshot version
    pub async fn snapshot_version(&self) -> u64 {
        self.snapshot().await.version
    }

    async fn snapshot(&self) -> Arc<StoreState> {
        self.state.read().await.clone()
    }
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get_policies_for(&self, kind: AttachmentKind, target_id: &str) -> Result<PolicySet> {
        let snapshot = self.snapshot().await;
        let policies = snapshot
            .index
            .get(&(kind, target_id.to_string()))
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default();

        Ok(PolicySet {
            version: snapshot.version,
            policies,
        })
    }
}
