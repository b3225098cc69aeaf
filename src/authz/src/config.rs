//! Engine configuration
//!
//! All settings have production defaults; [`EngineConfig::from_env`] overrides
//! them from `AUTHZ_*` environment variables the same way the server reads its
//! own settings.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::error::{AuthzError, Result};

/// How identity-side and resource-side grants are combined once no Forbid
/// has been found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombiningAlgorithm {
    /// Allow if either the identity side or the resource side permits
    #[default]
    Affirmative,
    /// Allow only if the identity side permits and, when the resource carries
    /// resource policies, the resource side permits too
    Unanimous,
}

impl FromStr for CombiningAlgorithm {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "affirmative" => Ok(Self::Affirmative),
            "unanimous" => Ok(Self::Unanimous),
            other => Err(AuthzError::InvalidInput(format!(
                "unknown combining algorithm '{}'",
                other
            ))),
        }
    }
}

/// Decision cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the decision cache
    pub enabled: bool,

    /// Maximum number of entries in the cache
    pub capacity: usize,

    /// Time-to-live for cached decisions, in seconds
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 10_000,
            ttl_secs: 30,
        }
    }
}

impl CacheConfig {
    /// TTL as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Decision engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Decision cache settings
    pub cache: CacheConfig,

    /// Maximum number of delegation hops (and resource ancestry hops)
    pub max_delegation_depth: usize,

    /// Latency budget after which a warning is logged, in milliseconds
    pub soft_budget_ms: u64,

    /// Hard deadline after which the decision fails closed, in milliseconds
    pub hard_timeout_ms: u64,

    /// Attempts per policy store read before giving up
    pub store_retry_attempts: u32,

    /// TTL for resolved entities, in seconds
    pub entity_cache_ttl_secs: u64,

    /// Maximum number of cached entities
    pub entity_cache_capacity: usize,

    /// Identity/resource combining rule
    pub combining: CombiningAlgorithm,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            max_delegation_depth: 5,
            soft_budget_ms: 10,
            hard_timeout_ms: 50,
            store_retry_attempts: 2,
            entity_cache_ttl_secs: 5,
            entity_cache_capacity: 10_000,
            combining: CombiningAlgorithm::Affirmative,
        }
    }
}

impl EngineConfig {
    /// Soft latency budget
    pub fn soft_budget(&self) -> Duration {
        Duration::from_millis(self.soft_budget_ms)
    }

    /// Hard decision deadline
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }

    /// Entity cache TTL
    pub fn entity_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.entity_cache_ttl_secs)
    }

    /// Load configuration from `AUTHZ_*` environment variables, falling back
    /// to defaults for anything unset
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "AUTHZ_CACHE_ENABLED")? {
            config.cache.enabled = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTHZ_CACHE_CAPACITY")? {
            config.cache.capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTHZ_CACHE_TTL_SECS")? {
            config.cache.ttl_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTHZ_MAX_DELEGATION_DEPTH")? {
            config.max_delegation_depth = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTHZ_SOFT_BUDGET_MS")? {
            config.soft_budget_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTHZ_HARD_TIMEOUT_MS")? {
            config.hard_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTHZ_STORE_RETRIES")? {
            config.store_retry_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTHZ_ENTITY_CACHE_TTL_SECS")? {
            config.entity_cache_ttl_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "AUTHZ_ENTITY_CACHE_CAPACITY")? {
            config.entity_cache_capacity = v;
        }
        if let Some(raw) = lookup("AUTHZ_COMBINING") {
            config.combining = raw.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_delegation_depth == 0 {
            return Err(AuthzError::InvalidInput(
                "max_delegation_depth must be at least 1".to_string(),
            ));
        }
        if self.hard_timeout_ms == 0 {
            return Err(AuthzError::InvalidInput(
                "hard_timeout_ms must be positive".to_string(),
            ));
        }
        if self.soft_budget_ms > self.hard_timeout_ms {
            warn!(
                "soft budget ({} ms) exceeds hard timeout ({} ms)",
                self.soft_budget_ms, self.hard_timeout_ms
            );
        }
        if self.store_retry_attempts == 0 {
            return Err(AuthzError::InvalidInput(
                "store_retry_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AuthzError::InvalidInput(format!("{} has invalid value '{}'", key, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_delegation_depth, 5);
        assert_eq!(config.hard_timeout(), Duration::from_millis(50));
        assert_eq!(config.cache.ttl(), Duration::from_secs(30));
        assert_eq!(config.combining, CombiningAlgorithm::Affirmative);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("AUTHZ_CACHE_ENABLED", "false"),
            ("AUTHZ_MAX_DELEGATION_DEPTH", "3"),
            ("AUTHZ_COMBINING", "Unanimous"),
            ("AUTHZ_ENTITY_CACHE_CAPACITY", "500"),
        ]))
        .unwrap();

        assert_eq!(config.entity_cache_capacity, 500);

        assert!(!config.cache.enabled);
        assert_eq!(config.max_delegation_depth, 3);
        assert_eq!(config.combining, CombiningAlgorithm::Unanimous);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = EngineConfig::from_lookup(lookup_from(&[("AUTHZ_HARD_TIMEOUT_MS", "soon")]));
        assert!(matches!(result, Err(AuthzError::InvalidInput(_))));

        let result = EngineConfig::from_lookup(lookup_from(&[("AUTHZ_MAX_DELEGATION_DEPTH", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"hard_timeout_ms": 80, "cache": {"ttl_secs": 60}}"#).unwrap();
        assert_eq!(config.hard_timeout_ms, 80);
        assert_eq!(config.cache.ttl_secs, 60);
        assert!(config.cache.enabled);
    }
}
