//! Decision cache keyed by a BLAKE3 request fingerprint

use blake3::Hasher;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::decision::Decision;
use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::types::AuthzRequest;

/// Cache key type (BLAKE3 hash)
pub type Fingerprint = [u8; 32];

/// Fingerprint of a request
///
/// Covers the principal, action and resource plus the values of the given
/// context keys only, so unrelated context (request ids, trace headers) does
/// not fragment the cache.
pub fn fingerprint(request: &AuthzRequest, context_keys: &BTreeSet<String>) -> Fingerprint {
    let mut hasher = Hasher::new();

    for part in [&request.principal, &request.action, &request.resource] {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }

    for key in context_keys {
        hasher.update(&(key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        match request.context.get(key) {
            Some(value) => {
                // serde_json maps are ordered, so this is canonical
                let encoded = value.to_string();
                hasher.update(&[1]);
                hasher.update(&(encoded.len() as u64).to_le_bytes());
                hasher.update(encoded.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
    }

    *hasher.finalize().as_bytes()
}

fn shape_key(request: &AuthzRequest) -> String {
    format!(
        "{}\u{1f}{}\u{1f}{}",
        request.principal, request.action, request.resource
    )
}

/// Cached entry with TTL
#[derive(Clone)]
struct CachedEntry {
    decision: Decision,
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    referenced_ids: Vec<String>,
    shape: Option<String>,
}

/// Decision cache
///
/// Entries remember every entity id their decision depended on so that
/// `invalidate(id)` can drop all of them at once. Over-invalidation only
/// costs a re-evaluation.
///
/// Every invalidation bumps an epoch. A decision computed while the epoch
/// moved is never stored, so a policy change that lands mid-evaluation
/// cannot be masked by the decision computed from the old snapshot.
pub struct DecisionCache {
    entries: DashMap<Fingerprint, CachedEntry>,

    /// Entity id -> fingerprints that depend on it
    references: DashMap<String, HashSet<Fingerprint>>,

    /// (principal, action, resource) -> context keys its policies read
    shapes: DashMap<String, Arc<BTreeSet<String>>>,

    /// Bumped by every `invalidate` and `clear`
    epoch: AtomicU64,

    config: CacheConfig,
    clock: SharedClock,

    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

impl DecisionCache {
    /// Create a new decision cache
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            references: DashMap::new(),
            shapes: DashMap::new(),
            epoch: AtomicU64::new(0),
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Current invalidation epoch; read it before evaluating a request that
    /// will be passed to [`DecisionCache::store`]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Configured TTL
    pub fn default_ttl(&self) -> Duration {
        self.config.ttl()
    }

    /// Get a cached decision
    pub fn get(&self, key: &Fingerprint) -> Option<Decision> {
        let now = self.clock.now();

        if let Some(entry) = self.entries.get(key) {
            if now >= entry.expires_at {
                drop(entry);
                self.remove_entry(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.decision.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a decision
    pub fn put(&self, key: Fingerprint, decision: Decision, ttl: Duration, referenced_ids: Vec<String>) {
        self.insert(key, decision, ttl, referenced_ids, None);
    }

    /// Look a request up using the context-key shape recorded for it
    ///
    /// Without a recorded shape there is no way to know which context keys
    /// matter, so the lookup is a miss.
    pub fn lookup(&self, request: &AuthzRequest) -> Option<Decision> {
        let shape = self.shapes.get(&shape_key(request)).map(|s| Arc::clone(s.value()));
        match shape {
            Some(keys) => self.get(&fingerprint(request, &keys)),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a decision for `request` and record its context-key shape
    ///
    /// `observed_epoch` is the epoch read before the decision was computed.
    /// Returns false when an invalidation happened in between and the
    /// decision was dropped.
    pub fn store(
        &self,
        request: &AuthzRequest,
        observed_epoch: u64,
        context_keys: BTreeSet<String>,
        decision: Decision,
        ttl: Duration,
        referenced_ids: Vec<String>,
    ) -> bool {
        if self.epoch() != observed_epoch {
            debug!("Decision {} invalidated while evaluating, not cached", decision.request_id);
            return false;
        }

        let key = fingerprint(request, &context_keys);
        let shape = shape_key(request);
        self.shapes.insert(shape.clone(), Arc::new(context_keys));
        self.insert(key, decision, ttl, referenced_ids, Some(shape));

        // An invalidation racing the insert may have run before our
        // references were visible
        if self.epoch() != observed_epoch {
            self.remove_entry(&key);
            return false;
        }
        true
    }

    fn insert(
        &self,
        key: Fingerprint,
        decision: Decision,
        ttl: Duration,
        referenced_ids: Vec<String>,
        shape: Option<String>,
    ) {
        if self.config.capacity == 0 {
            return;
        }
        let ttl = match chrono::Duration::from_std(ttl) {
            Ok(ttl) if ttl > chrono::Duration::zero() => ttl,
            _ => return,
        };

        // Evict old entries if at capacity
        if self.entries.len() >= self.config.capacity && !self.entries.contains_key(&key) {
            self.evict_oldest();
        }

        let now = self.clock.now();
        for id in &referenced_ids {
            self.references.entry(id.clone()).or_default().insert(key);
        }
        self.entries.insert(
            key,
            CachedEntry {
                decision,
                cached_at: now,
                expires_at: now + ttl,
                referenced_ids,
                shape,
            },
        );
    }

    /// Drop every entry that depends on `id`; returns how many were removed
    pub fn invalidate(&self, id: &str) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let keys = match self.references.remove(id) {
            Some((_, keys)) => keys,
            None => return 0,
        };

        let removed = keys.iter().filter(|key| self.remove_entry(key)).count();
        if removed > 0 {
            self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Invalidated {} cached decision(s) referencing {}", removed, id);
        }
        removed
    }

    /// Clear the entire cache
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
        self.references.clear();
        self.shapes.clear();
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
            max_entries: self.config.capacity,
        }
    }

    fn remove_entry(&self, key: &Fingerprint) -> bool {
        let (_, entry) = match self.entries.remove(key) {
            Some(removed) => removed,
            None => return false,
        };

        for id in &entry.referenced_ids {
            if let Some(mut keys) = self.references.get_mut(id) {
                keys.remove(key);
            }
            self.references.remove_if(id, |_, keys| keys.is_empty());
        }

        if let Some(shape) = &entry.shape {
            self.shapes.remove(shape);
        }
        true
    }

    /// Evict the oldest tenth of the entries (at least one)
    fn evict_oldest(&self) {
        let mut by_age: Vec<(DateTime<Utc>, Fingerprint)> = self
            .entries
            .iter()
            .map(|entry| (entry.cached_at, *entry.key()))
            .collect();
        by_age.sort();

        let to_remove = (self.config.capacity / 10).max(1);
        for (_, key) in by_age.into_iter().take(to_remove) {
            if self.remove_entry(&key) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub entries: usize,
    pub max_entries: usize,
}

impl CacheStats {
    /// Calculate cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn cache_with(capacity: usize) -> (DecisionCache, ManualClock) {
        let clock = ManualClock::default();
        let config = CacheConfig {
            capacity,
            ..Default::default()
        };
        (DecisionCache::new(config, Arc::new(clock.clone())), clock)
    }

    fn allow() -> Decision {
        Decision::allow(vec![], Utc::now())
    }

    #[test]
    fn test_fingerprint_ignores_unreferenced_context() {
        let base = AuthzRequest::new("user:alice", "doc:Read", "doc:1").with_context("sourceIp", "10.0.0.1");
        let noisy = base.clone().with_context("traceId", "abc");
        let moved = AuthzRequest::new("user:alice", "doc:Read", "doc:1").with_context("sourceIp", "10.9.9.9");

        let keys: BTreeSet<String> = ["sourceIp".to_string()].into_iter().collect();
        assert_eq!(fingerprint(&base, &keys), fingerprint(&noisy, &keys));
        assert_ne!(fingerprint(&base, &keys), fingerprint(&moved, &keys));

        // Missing and null are different
        let null = AuthzRequest::new("user:alice", "doc:Read", "doc:1").with_context("sourceIp", json!(null));
        let absent = AuthzRequest::new("user:alice", "doc:Read", "doc:1");
        assert_ne!(fingerprint(&null, &keys), fingerprint(&absent, &keys));
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        let a = AuthzRequest::new("user:ab", "c", "d");
        let b = AuthzRequest::new("user:a", "bc", "d");
        let keys = BTreeSet::new();
        assert_ne!(fingerprint(&a, &keys), fingerprint(&b, &keys));
    }

    #[test]
    fn test_put_get_and_ttl() {
        let (cache, clock) = cache_with(100);
        let key = [7u8; 32];

        assert!(cache.get(&key).is_none());
        cache.put(key, allow(), Duration::from_secs(30), vec!["user:alice".to_string()]);
        assert!(cache.get(&key).is_some());

        clock.advance(chrono::Duration::seconds(31));
        assert!(cache.get(&key).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_invalidate_by_reference() {
        let (cache, _) = cache_with(100);
        cache.put([1; 32], allow(), Duration::from_secs(30), vec!["user:alice".into(), "doc:1".into()]);
        cache.put([2; 32], allow(), Duration::from_secs(30), vec!["user:bob".into(), "doc:1".into()]);
        cache.put([3; 32], allow(), Duration::from_secs(30), vec!["user:bob".into(), "doc:2".into()]);

        assert_eq!(cache.invalidate("doc:1"), 2);
        assert!(cache.get(&[1; 32]).is_none());
        assert!(cache.get(&[2; 32]).is_none());
        assert!(cache.get(&[3; 32]).is_some());
        assert_eq!(cache.invalidate("doc:1"), 0);
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[test]
    fn test_lookup_needs_shape() {
        let (cache, _) = cache_with(100);
        let request = AuthzRequest::new("user:alice", "doc:Read", "doc:1").with_context("mfa", true);

        assert!(cache.lookup(&request).is_none());

        let keys: BTreeSet<String> = ["mfa".to_string()].into_iter().collect();
        assert!(cache.store(&request, cache.epoch(), keys, allow(), Duration::from_secs(30), vec!["user:alice".into()]));
        assert!(cache.lookup(&request).is_some());

        let without_mfa = AuthzRequest::new("user:alice", "doc:Read", "doc:1");
        assert!(cache.lookup(&without_mfa).is_none());

        cache.invalidate("user:alice");
        assert!(cache.lookup(&request).is_none());
    }

    #[test]
    fn test_store_skipped_after_invalidation() {
        let (cache, _) = cache_with(100);
        let request = AuthzRequest::new("user:alice", "doc:Read", "doc:1");
        let before = cache.epoch();

        // Any invalidation, even one that matches nothing yet
        assert_eq!(cache.invalidate("user:alice"), 0);

        let stored = cache.store(&request, before, BTreeSet::new(), allow(), Duration::from_secs(30), vec![
            "user:alice".into(),
        ]);
        assert!(!stored);
        assert!(cache.lookup(&request).is_none());
        assert_eq!(cache.stats().entries, 0);

        cache.clear();
        assert!(!cache.store(&request, before + 1, BTreeSet::new(), allow(), Duration::from_secs(30), vec![]));
        assert!(cache.store(&request, cache.epoch(), BTreeSet::new(), allow(), Duration::from_secs(30), vec![]));
    }

    #[test]
    fn test_capacity_eviction() {
        let (cache, clock) = cache_with(3);
        for i in 0..3u8 {
            cache.put([i; 32], allow(), Duration::from_secs(30), vec![]);
            clock.advance(chrono::Duration::milliseconds(1));
        }
        cache.put([9; 32], allow(), Duration::from_secs(30), vec![]);

        let stats = cache.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.evictions, 1);
        assert!(cache.get(&[0; 32]).is_none());
        assert!(cache.get(&[9; 32]).is_some());
    }

    #[test]
    fn test_zero_ttl_not_stored() {
        let (cache, _) = cache_with(10);
        cache.put([1; 32], allow(), Duration::ZERO, vec![]);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_clear() {
        let (cache, _) = cache_with(10);
        cache.put([1; 32], allow(), Duration::from_secs(30), vec!["user:alice".into()]);
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.invalidate("user:alice"), 0);
    }
}
