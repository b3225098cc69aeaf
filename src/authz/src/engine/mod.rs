//! Decision engine
//!
//! Combines every policy source with a fixed precedence and emits an
//! Allow/Deny decision plus the trail that explains it.
//!
//! ```text
//! Request → [Cache] → resolve principal/resource → delegation chain
//!         → Organization → PermissionBoundary → Session → Identity → Resource
//!         → combine → [Cache] → Audit / Metrics
//! ```
//!
//! Every step short-circuits to Deny on a Forbid. Any error met on the way
//! (unknown entity, malformed condition, store outage, deadline) is recorded
//! in the trail and turns into a Deny. Only internal faults are returned as
//! `Err`.

pub mod audit;
pub mod cache;
pub mod decision;
pub mod metrics;

pub use audit::{AuditEvent, AuditSink, ChannelAuditSink, MemoryAuditSink, TracingAuditSink};
pub use cache::{fingerprint, CacheStats, DecisionCache, Fingerprint};
pub use decision::{Decision, DecisionOutcome, DecisionStep, DeterminingFactor, FactorError};
pub use metrics::{EngineMetrics, MetricsCollector};

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{system_clock, SharedClock};
use crate::config::{CombiningAlgorithm, EngineConfig};
use crate::delegation::DelegationResolver;
use crate::entity::{CachingEntityResolver, Entity, EntityKind, EntityResolver};
use crate::error::{AuthzError, Result};
use crate::evaluator::{self, EvalContext, PolicyOutcome};
use crate::policy::{AttachmentKind, Policy, PolicyChange, PolicySet, PolicyStore};
use crate::types::{AuthzRequest, ContextMap, PolicyId};

/// Policies of one step and what they contributed
#[derive(Debug, Default)]
struct SetResult {
    consulted: Vec<PolicyId>,
    permits: Vec<PolicyId>,
    forbids: Vec<PolicyId>,
}

impl SetResult {
    fn is_empty(&self) -> bool {
        self.consulted.is_empty()
    }

    fn permitted(&self) -> bool {
        !self.permits.is_empty()
    }

    fn forbidden(&self) -> bool {
        !self.forbids.is_empty()
    }

    fn factor(&self, step: DecisionStep) -> DeterminingFactor {
        if self.forbidden() {
            DeterminingFactor::new(step, PolicyOutcome::Forbid, self.forbids.clone())
        } else if self.permitted() {
            DeterminingFactor::new(step, PolicyOutcome::Permit, self.permits.clone())
        } else {
            DeterminingFactor::new(step, PolicyOutcome::NotApplicable, self.consulted.clone())
        }
    }
}

/// Error raised at a given step
struct StepFailure {
    step: DecisionStep,
    error: AuthzError,
}

fn at(step: DecisionStep) -> impl Fn(AuthzError) -> StepFailure {
    move |error| StepFailure { step, error }
}

type StepResult<T> = std::result::Result<T, StepFailure>;

/// State accumulated while a request is evaluated
#[derive(Default)]
struct Trail {
    factors: Vec<DeterminingFactor>,

    /// Context keys read by every consulted policy
    context_keys: BTreeSet<String>,

    /// Entity and account ids the decision depends on
    referenced_ids: Vec<String>,

    /// Earliest session expiry on the delegation chain
    expires_at: Option<DateTime<Utc>>,
}

impl Trail {
    fn reference(&mut self, id: &str) {
        if !self.referenced_ids.iter().any(|r| r == id) {
            self.referenced_ids.push(id.to_string());
        }
    }

    fn cap_expiry(&mut self, expires_at: Option<DateTime<Utc>>) {
        if let Some(exp) = expires_at {
            self.expires_at = Some(self.expires_at.map_or(exp, |cur| cur.min(exp)));
        }
    }
}

/// A freshly computed decision and what is needed to cache it
struct Computed {
    decision: Decision,
    trail: Trail,
    cacheable: bool,
}

/// Main decision engine
pub struct DecisionEngine {
    policy_store: Arc<dyn PolicyStore>,

    /// Entity resolver as seen by the engine (cached when enabled)
    entities: Arc<dyn EntityResolver>,

    /// Entity cache, kept for invalidation
    entity_cache: Option<Arc<CachingEntityResolver>>,

    delegation: DelegationResolver,

    cache: Option<Arc<DecisionCache>>,

    audit: Arc<dyn AuditSink>,

    metrics: Arc<MetricsCollector>,

    clock: SharedClock,

    config: EngineConfig,
}

/// Builder for [`DecisionEngine`]
pub struct DecisionEngineBuilder {
    config: EngineConfig,
    policy_store: Arc<dyn PolicyStore>,
    entities: Arc<dyn EntityResolver>,
    clock: Option<SharedClock>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl DecisionEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn build(self) -> Result<DecisionEngine> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(system_clock);

        let (entities, entity_cache): (Arc<dyn EntityResolver>, _) = if config.entity_cache_ttl_secs > 0 {
            let cache = Arc::new(
                CachingEntityResolver::new(self.entities, config.entity_cache_ttl(), clock.clone())
                    .with_capacity(config.entity_cache_capacity),
            );
            (cache.clone() as Arc<dyn EntityResolver>, Some(cache))
        } else {
            (self.entities, None)
        };

        let cache = if config.cache.enabled {
            Some(Arc::new(DecisionCache::new(config.cache.clone(), clock.clone())))
        } else {
            None
        };

        info!(
            "DecisionEngine initialized with cache={}, max_delegation_depth={}, combining={:?}",
            config.cache.enabled, config.max_delegation_depth, config.combining
        );

        Ok(DecisionEngine {
            policy_store: self.policy_store,
            delegation: DelegationResolver::new(entities.clone(), config.max_delegation_depth, clock.clone()),
            entities,
            entity_cache,
            cache,
            audit: self.audit.unwrap_or_else(|| Arc::new(audit::TracingAuditSink) as Arc<dyn AuditSink>),
            metrics: Arc::new(MetricsCollector::new()),
            clock,
            config,
        })
    }
}

impl DecisionEngine {
    /// Start building an engine over the given store and resolver
    pub fn builder(policy_store: Arc<dyn PolicyStore>, entities: Arc<dyn EntityResolver>) -> DecisionEngineBuilder {
        DecisionEngineBuilder {
            config: EngineConfig::default(),
            policy_store,
            entities,
            clock: None,
            audit: None,
        }
    }

    /// Create an engine with the system clock and the tracing audit sink
    pub fn new(
        config: EngineConfig,
        policy_store: Arc<dyn PolicyStore>,
        entities: Arc<dyn EntityResolver>,
    ) -> Result<Self> {
        Self::builder(policy_store, entities).config(config).build()
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Decide whether `principal_id` may perform `action` on `resource_id`
    pub async fn is_authorized(
        &self,
        principal_id: &str,
        action: &str,
        resource_id: &str,
        context: ContextMap,
    ) -> Result<Decision> {
        let request = AuthzRequest {
            principal: principal_id.to_string(),
            action: action.to_string(),
            resource: resource_id.to_string(),
            context,
        };
        self.authorize(&request).await
    }

    /// Decide a request
    ///
    /// Always yields a decision for domain failures; `Err` is reserved for
    /// internal faults.
    pub async fn authorize(&self, request: &AuthzRequest) -> Result<Decision> {
        let start = Instant::now();

        debug!(
            "Authorization request: principal={}, action={}, resource={}",
            request.principal, request.action, request.resource
        );

        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.lookup(request) {
                debug!("Cache hit for request");
                let decision = cached.replay();
                self.finish(request, &decision, start).await;
                return Ok(decision);
            }
        }

        let epoch = self.cache.as_ref().map_or(0, |cache| cache.epoch());
        let computed = match tokio::time::timeout(self.config.hard_timeout(), self.evaluate(request)).await {
            Ok(computed) => computed?,
            Err(_) => {
                let err = AuthzError::TimeoutExceeded(self.config.hard_timeout_ms);
                warn!(
                    "Decision for {} {} {} timed out after {} ms",
                    request.principal, request.action, request.resource, self.config.hard_timeout_ms
                );
                Computed {
                    decision: Decision::deny(
                        vec![DeterminingFactor::failure(DecisionStep::Deadline, &err)],
                        self.clock.now(),
                    ),
                    trail: Trail::default(),
                    cacheable: false,
                }
            }
        };

        if computed.cacheable {
            if let Some(cache) = &self.cache {
                let ttl = self.cache_ttl(cache, computed.trail.expires_at);
                cache.store(
                    request,
                    epoch,
                    computed.trail.context_keys,
                    computed.decision.clone(),
                    ttl,
                    computed.trail.referenced_ids,
                );
            }
        }

        self.finish(request, &computed.decision, start).await;
        Ok(computed.decision)
    }

    /// Drop cached decisions and entities that depend on `id`
    pub fn invalidate(&self, id: &str) -> usize {
        if let Some(entity_cache) = &self.entity_cache {
            entity_cache.invalidate(id);
        }
        self.cache.as_ref().map_or(0, |cache| cache.invalidate(id))
    }

    /// Drop every cached decision and entity
    pub fn invalidate_all(&self) {
        if let Some(entity_cache) = &self.entity_cache {
            entity_cache.clear();
        }
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        info!("Decision and entity caches cleared");
    }

    /// Invalidate on every policy change until the channel closes or the
    /// engine is dropped
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        mut changes: broadcast::Receiver<PolicyChange>,
    ) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let received = changes.recv().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match received {
                    Ok(change) => {
                        let removed = engine.invalidate(&change.target);
                        debug!(
                            "Policy {} changed on {} (v{}), {} decision(s) invalidated",
                            change.policy_id, change.target, change.version, removed
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} policy change(s), clearing caches", missed);
                        engine.invalidate_all();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Invalidation listener stopped");
        })
    }

    /// Current metrics snapshot
    pub async fn metrics(&self) -> EngineMetrics {
        self.metrics.get_metrics().await
    }

    /// Metrics and cache statistics in Prometheus text format
    pub async fn export_prometheus(&self) -> String {
        let stats = self.cache_stats();
        self.metrics.export_prometheus(stats.as_ref()).await
    }

    /// Decision cache statistics, if the cache is enabled
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| cache.stats())
    }

    async fn finish(&self, request: &AuthzRequest, decision: &Decision, start: Instant) {
        let elapsed = start.elapsed();
        let over_budget = elapsed > self.config.soft_budget();
        if over_budget {
            warn!(
                "Decision {} took {:?}, over the {} ms budget",
                decision.request_id, elapsed, self.config.soft_budget_ms
            );
        }

        self.metrics.record_decision(decision.is_allowed(), decision.cached).await;
        self.metrics.record_latency(elapsed, over_budget).await;
        for err in decision.errors() {
            self.metrics.record_error(&err.code).await;
        }

        self.audit.publish(AuditEvent::new(
            request,
            decision,
            elapsed.as_micros() as u64,
            self.clock.now(),
        ));

        info!(
            "Decision {}: {} {} {} -> {}{}",
            decision.request_id,
            request.principal,
            request.action,
            request.resource,
            decision.decision,
            if decision.cached { " (cached)" } else { "" }
        );
    }

    fn cache_ttl(&self, cache: &DecisionCache, expires_at: Option<DateTime<Utc>>) -> Duration {
        let ttl = cache.default_ttl();
        match expires_at {
            Some(exp) => (exp - self.clock.now())
                .to_std()
                .map(|left| ttl.min(left))
                .unwrap_or(Duration::ZERO),
            None => ttl,
        }
    }

    async fn evaluate(&self, request: &AuthzRequest) -> Result<Computed> {
        let evaluated_at = self.clock.now();
        let mut trail = Trail::default();

        match self.run_steps(request, &mut trail).await {
            Ok(outcome) => {
                let factors = std::mem::take(&mut trail.factors);
                let decision = match outcome {
                    DecisionOutcome::Allow => Decision::allow(factors, evaluated_at),
                    DecisionOutcome::Deny => Decision::deny(factors, evaluated_at),
                };
                Ok(Computed {
                    decision,
                    trail,
                    cacheable: true,
                })
            }
            Err(StepFailure { error, .. }) if !error.is_policy_domain() => {
                error!("Internal error while deciding: {}", error);
                Err(error)
            }
            Err(StepFailure { step, error }) => {
                if let AuthzError::MalformedPolicyCondition { .. } = error {
                    error!("Denying at {:?}: {}", step, error);
                } else {
                    warn!("Denying at {:?}: {}", step, error);
                }
                trail.factors.push(DeterminingFactor::failure(step, &error));
                let factors = std::mem::take(&mut trail.factors);
                Ok(Computed {
                    decision: Decision::deny(factors, evaluated_at),
                    trail,
                    cacheable: false,
                })
            }
        }
    }

    async fn run_steps(&self, request: &AuthzRequest, trail: &mut Trail) -> StepResult<DecisionOutcome> {
        validate_request(request).map_err(at(DecisionStep::Resolution))?;

        let principal = self
            .resolve_principal(&request.principal)
            .await
            .map_err(at(DecisionStep::Resolution))?;
        let resource = self
            .entities
            .resolve(&request.resource)
            .await
            .map_err(at(DecisionStep::Resolution))?;
        let chain = self
            .delegation
            .effective_identities(&principal)
            .await
            .map_err(at(DecisionStep::Resolution))?;
        let ancestors = self
            .ancestors(&resource)
            .await
            .map_err(at(DecisionStep::Resolution))?;

        for identity in &chain {
            trail.reference(&identity.id);
            trail.reference(&identity.account);
            trail.cap_expiry(identity.expires_at);
        }
        for node in std::iter::once(&resource).chain(ancestors.iter()) {
            trail.reference(&node.id);
            trail.reference(&node.account);
        }

        let ctx = EvalContext::new(request, &chain, &resource);

        // 1. Organization guardrails of both accounts involved
        let step = DecisionStep::Organization;
        let mut accounts = vec![principal.account.as_str()];
        if resource.account != principal.account {
            accounts.push(resource.account.as_str());
        }
        let mut org_policies = Vec::new();
        for account in accounts {
            let set = self.read_organization(account).await.map_err(at(step))?;
            merge_policies(&mut org_policies, set);
        }
        let org = self.evaluate_set(&org_policies, &ctx, trail).map_err(at(step))?;
        trail.factors.push(org.factor(step));
        if org.forbidden() || (!org.is_empty() && !org.permitted()) {
            debug!("Organization policies deny {}", request.action);
            return Ok(DecisionOutcome::Deny);
        }

        // 2. Permission boundaries cap every identity on the chain
        let step = DecisionStep::PermissionBoundary;
        for identity in &chain {
            let set = self
                .read_policies(AttachmentKind::PermissionBoundary, &identity.id)
                .await
                .map_err(at(step))?;
            let boundary = self.evaluate_set(&set.policies, &ctx, trail).map_err(at(step))?;
            trail.factors.push(boundary.factor(step).for_identity(&identity.id));
            if boundary.forbidden() || (!boundary.is_empty() && !boundary.permitted()) {
                debug!("Permission boundary of {} denies {}", identity.id, request.action);
                return Ok(DecisionOutcome::Deny);
            }
        }

        // 3. Session policies narrow a session further
        let step = DecisionStep::Session;
        if principal.kind == EntityKind::Session {
            let set = self
                .read_policies(AttachmentKind::SessionPolicy, &principal.id)
                .await
                .map_err(at(step))?;
            let session = self.evaluate_set(&set.policies, &ctx, trail).map_err(at(step))?;
            trail.factors.push(session.factor(step).for_identity(&principal.id));
            if session.forbidden() || (!session.is_empty() && !session.permitted()) {
                debug!("Session policies of {} deny {}", principal.id, request.action);
                return Ok(DecisionOutcome::Deny);
            }
        } else {
            trail
                .factors
                .push(DeterminingFactor::new(step, PolicyOutcome::NotApplicable, Vec::new()));
        }

        // 4. Identity policies of every effective identity
        let step = DecisionStep::Identity;
        let mut identity_allow = false;
        for identity in &chain {
            let set = self
                .read_policies(AttachmentKind::IdentityPolicy, &identity.id)
                .await
                .map_err(at(step))?;
            let grants = self.evaluate_set(&set.policies, &ctx, trail).map_err(at(step))?;
            trail.factors.push(grants.factor(step).for_identity(&identity.id));
            if grants.forbidden() {
                debug!("Identity policy of {} forbids {}", identity.id, request.action);
                return Ok(DecisionOutcome::Deny);
            }
            identity_allow |= grants.permitted();
        }

        // 5. Resource policies, inherited from ancestors
        let step = DecisionStep::Resource;
        let mut resource_policies = Vec::new();
        for node in std::iter::once(&resource).chain(ancestors.iter()) {
            let set = self
                .read_policies(AttachmentKind::ResourcePolicy, &node.id)
                .await
                .map_err(at(step))?;
            merge_policies(&mut resource_policies, set);
        }
        let grants = self.evaluate_set(&resource_policies, &ctx, trail).map_err(at(step))?;
        trail.factors.push(grants.factor(step));
        if grants.forbidden() {
            debug!("Resource policy on {} forbids {}", resource.id, request.action);
            return Ok(DecisionOutcome::Deny);
        }
        let resource_allow = grants.permitted();

        // 6. Combine
        let allowed = match self.config.combining {
            CombiningAlgorithm::Affirmative => identity_allow || resource_allow,
            CombiningAlgorithm::Unanimous => identity_allow && (resource_allow || grants.is_empty()),
        };
        debug!(
            "Combined identity_allow={} resource_allow={} -> {}",
            identity_allow, resource_allow, allowed
        );

        Ok(if allowed {
            DecisionOutcome::Allow
        } else {
            DecisionOutcome::Deny
        })
    }

    fn evaluate_set(&self, policies: &[Arc<Policy>], ctx: &EvalContext<'_>, trail: &mut Trail) -> Result<SetResult> {
        let mut result = SetResult::default();

        for policy in policies {
            policy.context_keys(&mut trail.context_keys);
            result.consulted.push(policy.id.clone());

            let evaluation = evaluator::evaluate(policy, ctx)?;
            debug!(
                "Policy {} -> {} ({})",
                policy.id,
                evaluation.outcome,
                evaluation.trail.join("; ")
            );
            match evaluation.outcome {
                PolicyOutcome::Permit => result.permits.push(policy.id.clone()),
                PolicyOutcome::Forbid => result.forbids.push(policy.id.clone()),
                PolicyOutcome::NotApplicable => {}
            }
        }

        Ok(result)
    }

    async fn resolve_principal(&self, id: &str) -> Result<Entity> {
        let entity = self.entities.resolve(id).await?;
        if !entity.is_principal() {
            return Err(AuthzError::EntityNotFound(format!("{} (not a principal)", id)));
        }
        Ok(entity)
    }

    /// Parent resources, nearest first, bounded by the delegation depth
    async fn ancestors(&self, resource: &Entity) -> Result<Vec<Entity>> {
        let mut ancestors: Vec<Entity> = Vec::new();
        let mut next = resource.parent.clone();

        while let Some(parent_id) = next {
            if ancestors.len() >= self.config.max_delegation_depth {
                debug!("Resource ancestry of {} truncated at {} levels", resource.id, ancestors.len());
                break;
            }
            let parent = self.entities.resolve(&parent_id).await?;
            next = parent.parent.clone();
            ancestors.push(parent);
        }

        Ok(ancestors)
    }

    async fn read_organization(&self, account: &str) -> Result<PolicySet> {
        self.read_policies(AttachmentKind::OrganizationPolicy, account).await
    }

    /// Store read, retried while the store reports itself unavailable
    async fn read_policies(&self, kind: AttachmentKind, target: &str) -> Result<PolicySet> {
        let attempts = self.config.store_retry_attempts.max(1);
        let mut attempt = 1;

        loop {
            let read = match kind {
                AttachmentKind::OrganizationPolicy => {
                    self.policy_store.get_all_organization_policies(target).await
                }
                _ => self.policy_store.get_policies_for(kind, target).await,
            };

            match read {
                Err(AuthzError::PolicyStoreUnavailable(reason)) if attempt < attempts => {
                    warn!(
                        "Policy store read failed (attempt {}/{}): {}",
                        attempt, attempts, reason
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn merge_policies(into: &mut Vec<Arc<Policy>>, set: PolicySet) {
    for policy in set.policies {
        if !into.iter().any(|p| p.id == policy.id) {
            into.push(policy);
        }
    }
}

fn validate_request(request: &AuthzRequest) -> Result<()> {
    for (field, value) in [
        ("principal", &request.principal),
        ("action", &request.action),
        ("resource", &request.resource),
    ] {
        if value.trim().is_empty() {
            return Err(AuthzError::InvalidInput(format!("{} cannot be empty", field)));
        }
    }
    Ok(())
}
