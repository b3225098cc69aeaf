//! TTL cache in front of an entity resolver

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Entity, EntityResolver};
use crate::clock::SharedClock;
use crate::error::Result;

#[derive(Clone)]
struct CachedEntity {
    entity: Entity,
    cached_at: DateTime<Utc>,
}

/// Default bound on cached entities
pub const DEFAULT_ENTITY_CACHE_CAPACITY: usize = 10_000;

/// Entity cache statistics
#[derive(Debug, Clone, Default)]
pub struct EntityCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Caches successful resolutions for a bounded time
///
/// The TTL must stay below the policy propagation window so attribute
/// changes are not masked for longer than policy changes. Failed lookups are
/// never cached. When full, expired entries are swept first and then the
/// oldest tenth is evicted.
pub struct CachingEntityResolver {
    inner: Arc<dyn EntityResolver>,
    entries: DashMap<String, CachedEntity>,
    ttl: chrono::Duration,
    capacity: usize,
    clock: SharedClock,

    /// Bumped by `invalidate` and `clear`; lookups that straddle a bump are
    /// not cached
    epoch: AtomicU64,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CachingEntityResolver {
    /// Wrap `inner` with a cache of the given TTL
    pub fn new(inner: Arc<dyn EntityResolver>, ttl: Duration, clock: SharedClock) -> Self {
        Self {
            inner,
            entries: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(5)),
            capacity: DEFAULT_ENTITY_CACHE_CAPACITY,
            clock,
            epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Bound the number of cached entities (0 disables caching)
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Drop a cached entity
    pub fn invalidate(&self, id: &str) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.entries.remove(id);
    }

    /// Drop every cached entity
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
    }

    /// Cache statistics
    pub fn stats(&self) -> EntityCacheStats {
        EntityCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    fn is_fresh(&self, entry: &CachedEntity, now: DateTime<Utc>) -> bool {
        now - entry.cached_at < self.ttl
    }

    /// Make room for one more entry
    fn make_room(&self, now: DateTime<Utc>) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| self.is_fresh(entry, now));
        let swept = before.saturating_sub(self.entries.len());
        if swept > 0 {
            debug!("Swept {} expired entities", swept);
        }
        if self.entries.len() < self.capacity {
            return;
        }

        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.cached_at, entry.key().clone()))
            .collect();
        by_age.sort();

        let to_remove = (self.capacity / 10).max(1);
        for (_, id) in by_age.into_iter().take(to_remove) {
            if self.entries.remove(&id).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[async_trait]
impl EntityResolver for CachingEntityResolver {
    async fn resolve(&self, id: &str) -> Result<Entity> {
        let now = self.clock.now();

        if let Some(cached) = self.entries.get(id) {
            if self.is_fresh(&cached, now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cached.entity.clone());
            }
            drop(cached);
            self.entries.remove(id);
            debug!("Entity cache entry expired: {}", id);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let epoch = self.epoch.load(Ordering::SeqCst);
        let entity = self.inner.resolve(id).await?;
        if self.capacity == 0 {
            return Ok(entity);
        }

        if self.entries.len() >= self.capacity && !self.entries.contains_key(id) {
            self.make_room(now);
        }
        self.entries.insert(
            id.to_string(),
            CachedEntity {
                entity: entity.clone(),
                cached_at: now,
            },
        );
        if self.epoch.load(Ordering::SeqCst) != epoch {
            self.entries.remove(id);
        }
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entity::InMemoryEntityDirectory;
    use crate::error::AuthzError;

    #[tokio::test]
    async fn test_cache_hit_until_ttl() {
        let directory = Arc::new(InMemoryEntityDirectory::with_entities(vec![Entity::user(
            "user:alice",
            "111",
        )]));
        let clock = ManualClock::default();
        let resolver = CachingEntityResolver::new(
            directory.clone(),
            Duration::from_secs(5),
            Arc::new(clock.clone()),
        );

        resolver.resolve("user:alice").await.unwrap();
        directory
            .insert(Entity::user("user:alice", "111").with_attribute("groups", serde_json::json!(["admins"])))
            .await;

        // Still served from cache
        let cached = resolver.resolve("user:alice").await.unwrap();
        assert!(cached.attributes.is_empty());

        clock.advance(chrono::Duration::seconds(6));
        let fresh = resolver.resolve("user:alice").await.unwrap();
        assert!(fresh.attributes.contains_key("groups"));

        let stats = resolver.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_failures_not_cached() {
        let directory = Arc::new(InMemoryEntityDirectory::new());
        let resolver = CachingEntityResolver::new(
            directory.clone(),
            Duration::from_secs(5),
            Arc::new(ManualClock::default()),
        );

        assert!(matches!(
            resolver.resolve("user:late").await,
            Err(AuthzError::EntityNotFound(_))
        ));

        directory.insert(Entity::user("user:late", "111")).await;
        assert!(resolver.resolve("user:late").await.is_ok());
    }

    #[tokio::test]
    async fn test_capacity_bounds_memory() {
        let ids: Vec<String> = (0..1_000).map(|i| format!("user:u{}", i)).collect();
        let directory = Arc::new(InMemoryEntityDirectory::with_entities(
            ids.iter().map(|id| Entity::user(id.clone(), "111")),
        ));
        let clock = ManualClock::default();
        let resolver = CachingEntityResolver::new(directory.clone(), Duration::from_secs(5), Arc::new(clock.clone()))
            .with_capacity(100);

        for id in &ids {
            resolver.resolve(id).await.unwrap();
            clock.advance(chrono::Duration::milliseconds(1));
        }
        let stats = resolver.stats();
        assert!(stats.entries <= 100);
        assert!(stats.evictions >= 900);

        // Once everything has expired the next insert sweeps it all
        clock.advance(chrono::Duration::hours(1));
        directory.insert(Entity::user("user:late", "111")).await;
        resolver.resolve("user:late").await.unwrap();
        assert_eq!(resolver.stats().entries, 1);
    }

    #[tokio::test]
    async fn test_zero_capacity_disables_caching() {
        let directory = Arc::new(InMemoryEntityDirectory::with_entities(vec![Entity::user(
            "user:alice",
            "111",
        )]));
        let resolver =
            CachingEntityResolver::new(directory, Duration::from_secs(5), Arc::new(ManualClock::default()))
                .with_capacity(0);

        resolver.resolve("user:alice").await.unwrap();
        resolver.resolve("user:alice").await.unwrap();
        assert_eq!(resolver.stats().entries, 0);
        assert_eq!(resolver.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let directory = Arc::new(InMemoryEntityDirectory::with_entities(vec![Entity::user(
            "user:alice",
            "111",
        )]));
        let resolver =
            CachingEntityResolver::new(directory.clone(), Duration::from_secs(60), Arc::new(ManualClock::default()));

        resolver.resolve("user:alice").await.unwrap();
        directory.insert(Entity::user("user:alice", "999")).await;
        resolver.invalidate("user:alice");

        assert_eq!(resolver.resolve("user:alice").await.unwrap().account, "999");
    }
}
