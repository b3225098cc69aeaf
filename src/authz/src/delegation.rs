//! Delegation chain resolution
//!
//! A session acts with the permissions of the role it was assumed from, and
//! that role may itself have been assumed from another one. The chain is
//! walked by following `session_of` back-references with a plain hop counter:
//! a cycle simply runs into the depth cap.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::entity::{Entity, EntityResolver};
use crate::error::{AuthzError, Result};

/// Default bound on delegation hops
pub const DEFAULT_MAX_DELEGATION_DEPTH: usize = 5;

/// Computes the effective identities of a principal
pub struct DelegationResolver {
    entities: Arc<dyn EntityResolver>,
    max_depth: usize,
    clock: SharedClock,
}

impl DelegationResolver {
    pub fn new(entities: Arc<dyn EntityResolver>, max_depth: usize, clock: SharedClock) -> Self {
        Self {
            entities,
            max_depth,
            clock,
        }
    }

    /// Ordered identities, requester first and origin last
    ///
    /// A user yields `[user]`. Fails with `DelegationDepthExceeded` when the
    /// chain has more than `max_depth` hops, and with `SessionExpired` when
    /// any session on the chain is past its expiry.
    pub async fn effective_identities(&self, principal: &Entity) -> Result<Vec<Entity>> {
        let now = self.clock.now();
        self.check_expiry(principal, now)?;

        let mut chain = vec![principal.clone()];
        let mut hops = 0;

        loop {
            let next_id = match chain.last().and_then(|e| e.session_of.clone()) {
                Some(id) => id,
                None => break,
            };

            if hops >= self.max_depth {
                warn!(
                    "Delegation chain for {} exceeds {} hops",
                    principal.id, self.max_depth
                );
                return Err(AuthzError::DelegationDepthExceeded {
                    principal: principal.id.clone(),
                    max: self.max_depth,
                });
            }

            let next = self.entities.resolve(&next_id).await?;
            if !next.is_principal() {
                return Err(AuthzError::EntityNotFound(format!(
                    "{} (delegation target is not a principal)",
                    next_id
                )));
            }
            self.check_expiry(&next, now)?;

            chain.push(next);
            hops += 1;
        }

        debug!(
            "Resolved {} effective identities for {}",
            chain.len(),
            principal.id
        );
        Ok(chain)
    }

    fn check_expiry(&self, entity: &Entity, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        if entity.is_expired_at(now) {
            return Err(AuthzError::SessionExpired(entity.id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::entity::InMemoryEntityDirectory;
    use chrono::Duration;

    fn resolver(entities: Vec<Entity>, clock: &ManualClock) -> DelegationResolver {
        DelegationResolver::new(
            Arc::new(InMemoryEntityDirectory::with_entities(entities)),
            DEFAULT_MAX_DELEGATION_DEPTH,
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_user_is_its_own_chain() {
        let clock = ManualClock::default();
        let alice = Entity::user("user:alice", "111");
        let chain = resolver(vec![], &clock).effective_identities(&alice).await.unwrap();
        assert_eq!(chain, vec![alice]);
    }

    #[tokio::test]
    async fn test_session_to_role_chain() {
        let clock = ManualClock::default();
        let session = Entity::session(
            "session:s1",
            "111",
            "role:RoleA",
            clock.now() + Duration::hours(1),
        );
        let role = Entity::role("role:RoleA", "111");
        let delegation = resolver(vec![role], &clock);

        let chain = delegation.effective_identities(&session).await.unwrap();
        let ids: Vec<_> = chain.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["session:s1", "role:RoleA"]);
    }

    #[tokio::test]
    async fn test_cycle_hits_depth_cap() {
        let clock = ManualClock::default();
        let a = Entity::role("role:a", "111").with_session_of("role:b");
        let b = Entity::role("role:b", "111").with_session_of("role:a");
        let delegation = resolver(vec![a.clone(), b], &clock);

        let err = delegation.effective_identities(&a).await.unwrap_err();
        assert!(matches!(err, AuthzError::DelegationDepthExceeded { max: 5, .. }));
    }

    #[tokio::test]
    async fn test_expired_session() {
        let clock = ManualClock::default();
        let session = Entity::session("session:s1", "111", "role:RoleA", clock.now() + Duration::minutes(5));
        let delegation = resolver(vec![Entity::role("role:RoleA", "111")], &clock);

        assert!(delegation.effective_identities(&session).await.is_ok());

        clock.advance(Duration::minutes(10));
        let err = delegation.effective_identities(&session).await.unwrap_err();
        assert_eq!(err, AuthzError::SessionExpired("session:s1".to_string()));
    }

    #[tokio::test]
    async fn test_missing_hop() {
        let clock = ManualClock::default();
        let role = Entity::role("role:a", "111").with_session_of("role:gone");
        let err = resolver(vec![], &clock).effective_identities(&role).await.unwrap_err();
        assert_eq!(err, AuthzError::EntityNotFound("role:gone".to_string()));
    }
}
