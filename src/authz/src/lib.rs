//! # TrustGate Authorization Engine
//!
//! Policy-based authorization decisions with cross-account delegation.
//!
//! ## Features
//!
//! - **Multiple policy sources**: organization guardrails, permission
//!   boundaries, session policies, identity policies and resource policies
//! - **Deny overrides allow**: any applicable Forbid wins, and the default is
//!   Deny
//! - **Delegation chains**: sessions act through the roles they were assumed
//!   from, with a bounded hop count
//! - **Typed conditions**: a small condition language that fails loudly on
//!   unknown operators
//! - **Explainable decisions**: every decision carries an ordered trail of
//!   determining factors
//! - **Decision cache**: BLAKE3 fingerprints with TTL and id-based
//!   invalidation
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trustgate_authz::{
//!     Attachment, AttachmentKind, DecisionEngine, Effect, EngineConfig, Entity,
//!     InMemoryEntityDirectory, InMemoryPolicyStore, Pattern, Policy,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryPolicyStore::new();
//!     store
//!         .put(
//!             Policy::builder(
//!                 "alice-read-docs",
//!                 Effect::Permit,
//!                 Attachment::new(AttachmentKind::IdentityPolicy, "user:alice"),
//!             )
//!             .action(Pattern::exact("doc:Read"))
//!             .build()?,
//!         )
//!         .await?;
//!
//!     let directory = InMemoryEntityDirectory::with_entities(vec![
//!         Entity::user("user:alice", "111"),
//!         Entity::resource("doc:123", "111"),
//!     ]);
//!
//!     let engine = DecisionEngine::new(EngineConfig::default(), Arc::new(store), Arc::new(directory))?;
//!     let decision = engine
//!         .is_authorized("user:alice", "doc:Read", "doc:123", Default::default())
//!         .await?;
//!
//!     if decision.is_allowed() {
//!         println!("Access granted!");
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod condition;
pub mod config;
pub mod delegation;
pub mod engine;
pub mod entity;
pub mod error;
pub mod evaluator;
pub mod policy;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use condition::{AttributePath, Condition, ConditionError};
pub use config::{CacheConfig, CombiningAlgorithm, EngineConfig};
pub use delegation::DelegationResolver;
pub use engine::{
    AuditEvent, AuditSink, CacheStats, Decision, DecisionCache, DecisionEngine, DecisionOutcome,
    DecisionStep, DeterminingFactor, EngineMetrics, MemoryAuditSink,
};
pub use entity::{CachingEntityResolver, Entity, EntityKind, EntityResolver, InMemoryEntityDirectory};
pub use error::{AuthzError, Result};
pub use evaluator::{EvalContext, Evaluation, PolicyOutcome};
pub use policy::{
    Attachment, AttachmentKind, Effect, InMemoryPolicyStore, Pattern, Policy, PolicyBundle, PolicyChange,
    PolicySet, PolicyStore,
};
pub use types::{AuthzRequest, ContextMap, PolicyId, PrincipalKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
