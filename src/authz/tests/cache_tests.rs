//! Decision cache tests
//!
//! TTL expiry, session-bounded lifetimes, invalidation through inherited
//! resources and capacity handling, driven through the engine with a manual
//! clock.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use trustgate_authz::{
    Attachment, AttachmentKind, AuthzRequest, Clock, ContextMap, DecisionEngine, Effect, EngineConfig, Entity,
    InMemoryEntityDirectory, InMemoryPolicyStore, ManualClock, Pattern, Policy, PolicySet, PolicyStore, Result,
};

fn permit(id: &str, kind: AttachmentKind, target: &str) -> Policy {
    Policy::builder(id, Effect::Permit, Attachment::new(kind, target))
        .build()
        .unwrap()
}

async fn engine_at(
    clock: &ManualClock,
    config: EngineConfig,
    policies: Vec<Policy>,
    entities: Vec<Entity>,
) -> (DecisionEngine, Arc<InMemoryPolicyStore>) {
    let store = Arc::new(InMemoryPolicyStore::with_policies(policies).await.unwrap());
    let engine = DecisionEngine::builder(
        store.clone(),
        Arc::new(InMemoryEntityDirectory::with_entities(entities)),
    )
    .config(config)
    .clock(Arc::new(clock.clone()))
    .build()
    .unwrap();
    (engine, store)
}

async fn read(engine: &DecisionEngine, principal: &str, resource: &str) -> trustgate_authz::Decision {
    engine
        .is_authorized(principal, "doc:Read", resource, ContextMap::new())
        .await
        .unwrap()
}

// ============================================================================
// TTL
// ============================================================================

#[tokio::test]
async fn test_cached_decision_expires() {
    let clock = ManualClock::default();
    let mut config = EngineConfig::default();
    config.cache.ttl_secs = 30;
    let (engine, _store) = engine_at(
        &clock,
        config,
        vec![permit("alice-all", AttachmentKind::IdentityPolicy, "user:alice")],
        vec![Entity::user("user:alice", "111"), Entity::resource("doc:1", "111")],
    )
    .await;

    assert!(!read(&engine, "user:alice", "doc:1").await.cached);
    assert!(read(&engine, "user:alice", "doc:1").await.cached);

    clock.advance(ChronoDuration::seconds(31));
    let decision = read(&engine, "user:alice", "doc:1").await;
    assert!(!decision.cached);
    assert!(decision.is_allowed());

    let stats = engine.cache_stats().unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.expirations, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn test_cache_never_outlives_session() {
    let clock = ManualClock::default();
    let expires_at = clock.now() + ChronoDuration::seconds(10);
    let (engine, _store) = engine_at(
        &clock,
        EngineConfig::default(),
        vec![permit("ops-all", AttachmentKind::IdentityPolicy, "role:ops")],
        vec![
            Entity::role("role:ops", "111"),
            Entity::session("session:s1", "111", "role:ops", expires_at),
            Entity::resource("doc:1", "111"),
        ],
    )
    .await;

    assert!(read(&engine, "session:s1", "doc:1").await.is_allowed());
    assert!(read(&engine, "session:s1", "doc:1").await.cached);

    clock.advance(ChronoDuration::seconds(11));
    let decision = read(&engine, "session:s1", "doc:1").await;
    assert!(!decision.cached);
    assert!(!decision.is_allowed());
    assert!(decision.has_error("SessionExpired"));
}

#[tokio::test]
async fn test_disabled_cache_reports_no_stats() {
    let clock = ManualClock::default();
    let mut config = EngineConfig::default();
    config.cache.enabled = false;
    let (engine, _store) = engine_at(
        &clock,
        config,
        vec![],
        vec![Entity::user("user:alice", "111"), Entity::resource("doc:1", "111")],
    )
    .await;

    read(&engine, "user:alice", "doc:1").await;
    assert!(!read(&engine, "user:alice", "doc:1").await.cached);
    assert!(engine.cache_stats().is_none());
}

// ============================================================================
// INVALIDATION
// ============================================================================

#[tokio::test]
async fn test_invalidation_through_parent_resource() {
    let clock = ManualClock::default();
    let (engine, store) = engine_at(
        &clock,
        EngineConfig::default(),
        vec![permit("alice-all", AttachmentKind::IdentityPolicy, "user:alice")],
        vec![
            Entity::user("user:alice", "111"),
            Entity::resource("folder:reports", "111"),
            Entity::resource("doc:q3", "111").with_parent("folder:reports"),
        ],
    )
    .await;

    assert!(read(&engine, "user:alice", "doc:q3").await.is_allowed());

    let lockdown = Policy::builder(
        "reports-lockdown",
        Effect::Forbid,
        Attachment::new(AttachmentKind::ResourcePolicy, "folder:reports"),
    )
    .principal(Pattern::Any)
    .build()
    .unwrap();
    store.put(lockdown).await.unwrap();

    // The decision on the document depends on its folder
    assert_eq!(engine.invalidate("folder:reports"), 1);

    let decision = read(&engine, "user:alice", "doc:q3").await;
    assert!(!decision.is_allowed());
    assert_eq!(
        decision.determining_factors.last().unwrap().policy_ids,
        vec!["reports-lockdown"]
    );
}

#[tokio::test]
async fn test_invalidate_unrelated_id_keeps_entries() {
    let clock = ManualClock::default();
    let (engine, _store) = engine_at(
        &clock,
        EngineConfig::default(),
        vec![permit("alice-all", AttachmentKind::IdentityPolicy, "user:alice")],
        vec![Entity::user("user:alice", "111"), Entity::resource("doc:1", "111")],
    )
    .await;

    read(&engine, "user:alice", "doc:1").await;
    assert_eq!(engine.invalidate("user:bob"), 0);
    assert!(read(&engine, "user:alice", "doc:1").await.cached);

    // Account-level changes reach every decision in the account
    assert_eq!(engine.invalidate("111"), 1);
    assert!(!read(&engine, "user:alice", "doc:1").await.cached);
}

#[tokio::test]
async fn test_invalidate_all() {
    let clock = ManualClock::default();
    let (engine, _store) = engine_at(
        &clock,
        EngineConfig::default(),
        vec![],
        vec![
            Entity::user("user:alice", "111"),
            Entity::user("user:bob", "111"),
            Entity::resource("doc:1", "111"),
        ],
    )
    .await;

    read(&engine, "user:alice", "doc:1").await;
    read(&engine, "user:bob", "doc:1").await;
    assert_eq!(engine.cache_stats().unwrap().entries, 2);

    engine.invalidate_all();
    assert_eq!(engine.cache_stats().unwrap().entries, 0);
}

/// Store that reads its snapshot and then holds the first identity-policy
/// read until released
struct GatedStore {
    inner: Arc<InMemoryPolicyStore>,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl PolicyStore for GatedStore {
    async fn get_policies_for(&self, kind: AttachmentKind, target_id: &str) -> Result<PolicySet> {
        let set = self.inner.get_policies_for(kind, target_id).await?;
        if kind == AttachmentKind::IdentityPolicy && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(set)
    }
}

#[tokio::test]
async fn test_invalidation_during_evaluation_is_not_masked() {
    let inner = Arc::new(
        InMemoryPolicyStore::with_policies(vec![permit("alice-all", AttachmentKind::IdentityPolicy, "user:alice")])
            .await
            .unwrap(),
    );
    let store = Arc::new(GatedStore {
        inner: inner.clone(),
        armed: AtomicBool::new(true),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let mut config = EngineConfig::default();
    config.hard_timeout_ms = 5_000;
    let engine = Arc::new(
        DecisionEngine::new(
            config,
            store.clone(),
            Arc::new(InMemoryEntityDirectory::with_entities(vec![
                Entity::user("user:alice", "111"),
                Entity::resource("doc:1", "111"),
            ])),
        )
        .unwrap(),
    );

    let in_flight = {
        let engine = engine.clone();
        tokio::spawn(async move { read(&engine, "user:alice", "doc:1").await })
    };
    tokio::time::timeout(Duration::from_secs(1), store.entered.notified())
        .await
        .unwrap();

    // Policy changes while the decision above still works from the old snapshot
    let forbid = Policy::builder(
        "alice-suspended",
        Effect::Forbid,
        Attachment::new(AttachmentKind::IdentityPolicy, "user:alice"),
    )
    .build()
    .unwrap();
    inner.put(forbid).await.unwrap();
    engine.invalidate("user:alice");
    store.release.notify_one();

    let stale = in_flight.await.unwrap();
    assert!(stale.is_allowed());

    let decision = read(&engine, "user:alice", "doc:1").await;
    assert!(!decision.cached);
    assert!(!decision.is_allowed());
    assert_eq!(engine.cache_stats().unwrap().hits, 0);
}

// ============================================================================
// CAPACITY
// ============================================================================

#[tokio::test]
async fn test_capacity_evicts_oldest() {
    let clock = ManualClock::default();
    let mut config = EngineConfig::default();
    config.cache.capacity = 4;

    let mut entities = vec![Entity::user("user:alice", "111")];
    for i in 0..6 {
        entities.push(Entity::resource(format!("doc:{}", i), "111"));
    }
    let (engine, _store) = engine_at(&clock, config, vec![], entities).await;

    for i in 0..6 {
        read(&engine, "user:alice", &format!("doc:{}", i)).await;
        clock.advance(ChronoDuration::milliseconds(10));
    }

    let stats = engine.cache_stats().unwrap();
    assert!(stats.entries <= 4);
    assert_eq!(stats.evictions, 2);

    // The newest decision survived
    assert!(read(&engine, "user:alice", "doc:5").await.cached);
}

#[tokio::test]
async fn test_context_shape_follows_policies() {
    let clock = ManualClock::default();
    let mfa_only = Policy::builder(
        "alice-mfa",
        Effect::Permit,
        Attachment::new(AttachmentKind::IdentityPolicy, "user:alice"),
    )
    .conditions(trustgate_authz::Condition::from_json(&serde_json::json!(
        {"op": "equals", "attr": "context.mfa", "value": true}
    )))
    .build()
    .unwrap();
    let (engine, _store) = engine_at(
        &clock,
        EngineConfig::default(),
        vec![mfa_only],
        vec![Entity::user("user:alice", "111"), Entity::resource("doc:1", "111")],
    )
    .await;

    let with_mfa = AuthzRequest::new("user:alice", "doc:Read", "doc:1").with_context("mfa", true);
    let without_mfa = AuthzRequest::new("user:alice", "doc:Read", "doc:1").with_context("mfa", false);

    assert!(engine.authorize(&with_mfa).await.unwrap().is_allowed());
    let denied = engine.authorize(&without_mfa).await.unwrap();
    assert!(!denied.is_allowed());
    assert!(!denied.cached);

    assert!(engine.authorize(&with_mfa).await.unwrap().cached);
    assert!(engine.authorize(&without_mfa).await.unwrap().cached);
}
