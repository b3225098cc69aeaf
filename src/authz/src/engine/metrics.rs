//! In-process decision metrics, exported in Prometheus text format

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::cache::CacheStats;

/// Engine performance metrics
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    /// Total number of authorization requests
    pub total_requests: u64,

    /// Number of allowed decisions
    pub allowed_decisions: u64,

    /// Number of denied decisions
    pub denied_decisions: u64,

    /// Decisions served from the cache
    pub cached_decisions: u64,

    /// Decisions that exceeded the soft latency budget
    pub over_budget: u64,

    /// Recovered errors, keyed by error code
    pub errors: BTreeMap<String, u64>,

    /// Latency percentiles (p50, p90, p99)
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p99_ms: f64,

    /// Average latency
    pub avg_latency_ms: f64,
}

impl EngineMetrics {
    /// Calculate allow rate
    pub fn allow_rate(&self) -> f64 {
        let total = self.allowed_decisions + self.denied_decisions;
        if total == 0 {
            0.0
        } else {
            self.allowed_decisions as f64 / total as f64
        }
    }

    /// Total recovered errors
    pub fn error_count(&self) -> u64 {
        self.errors.values().sum()
    }
}

/// Metrics collector
pub struct MetricsCollector {
    metrics: Arc<RwLock<EngineMetrics>>,

    /// Recent latency samples, in milliseconds
    latency_samples: Arc<RwLock<Vec<f64>>>,

    max_samples: usize,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(EngineMetrics::default())),
            latency_samples: Arc::new(RwLock::new(Vec::with_capacity(10_000))),
            max_samples: 10_000,
        }
    }

    /// Record an authorization decision
    pub async fn record_decision(&self, allowed: bool, cached: bool) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;

        if allowed {
            metrics.allowed_decisions += 1;
        } else {
            metrics.denied_decisions += 1;
        }
        if cached {
            metrics.cached_decisions += 1;
        }
    }

    /// Record a recovered error by code
    pub async fn record_error(&self, code: &str) {
        let mut metrics = self.metrics.write().await;
        *metrics.errors.entry(code.to_string()).or_insert(0) += 1;
    }

    /// Record request latency
    pub async fn record_latency(&self, latency: Duration, over_budget: bool) {
        let latency_ms = latency.as_secs_f64() * 1000.0;

        let mut samples = self.latency_samples.write().await;
        samples.push(latency_ms);

        // Keep only recent samples
        if samples.len() > self.max_samples {
            samples.drain(0..1_000);
        }

        let mut sorted = samples.clone();
        drop(samples);
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mut metrics = self.metrics.write().await;
        if over_budget {
            metrics.over_budget += 1;
        }
        metrics.avg_latency_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
        metrics.latency_p50_ms = Self::percentile(&sorted, 0.50);
        metrics.latency_p90_ms = Self::percentile(&sorted, 0.90);
        metrics.latency_p99_ms = Self::percentile(&sorted, 0.99);
    }

    /// Get current metrics snapshot
    pub async fn get_metrics(&self) -> EngineMetrics {
        self.metrics.read().await.clone()
    }

    /// Reset all metrics
    pub async fn reset(&self) {
        *self.metrics.write().await = EngineMetrics::default();
        self.latency_samples.write().await.clear();
    }

    /// Export metrics (and cache statistics) in Prometheus format
    pub async fn export_prometheus(&self, cache: Option<&CacheStats>) -> String {
        let metrics = self.metrics.read().await;
        let mut out = String::new();

        counter(&mut out, "authz_requests_total", "Total number of authorization requests", metrics.total_requests);
        counter(&mut out, "authz_allowed_total", "Number of allowed decisions", metrics.allowed_decisions);
        counter(&mut out, "authz_denied_total", "Number of denied decisions", metrics.denied_decisions);
        counter(&mut out, "authz_cached_decisions_total", "Decisions served from the cache", metrics.cached_decisions);
        counter(&mut out, "authz_over_budget_total", "Decisions slower than the soft budget", metrics.over_budget);

        let _ = writeln!(out, "# HELP authz_errors_total Recovered errors by code");
        let _ = writeln!(out, "# TYPE authz_errors_total counter");
        for (code, count) in &metrics.errors {
            let _ = writeln!(out, "authz_errors_total{{code=\"{}\"}} {}", code, count);
        }
        out.push('\n');

        let _ = writeln!(out, "# HELP authz_latency_seconds Decision latency percentiles");
        let _ = writeln!(out, "# TYPE authz_latency_seconds summary");
        for (quantile, value) in [
            ("0.5", metrics.latency_p50_ms),
            ("0.9", metrics.latency_p90_ms),
            ("0.99", metrics.latency_p99_ms),
        ] {
            let _ = writeln!(out, "authz_latency_seconds{{quantile=\"{}\"}} {}", quantile, value / 1000.0);
        }
        out.push('\n');

        if let Some(cache) = cache {
            counter(&mut out, "authz_cache_hits_total", "Cache hits", cache.hits);
            counter(&mut out, "authz_cache_misses_total", "Cache misses", cache.misses);
            counter(&mut out, "authz_cache_invalidations_total", "Entries dropped by invalidation", cache.invalidations);
            counter(&mut out, "authz_cache_evictions_total", "Entries dropped for capacity", cache.evictions);
            let _ = writeln!(out, "# HELP authz_cache_entries Current cache entries");
            let _ = writeln!(out, "# TYPE authz_cache_entries gauge");
            let _ = writeln!(out, "authz_cache_entries {}", cache.entries);
        }

        out
    }

    /// Calculate percentile from sorted data
    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }

        let idx = ((sorted.len() as f64) * p) as usize;
        let idx = idx.min(sorted.len() - 1);
        sorted[idx]
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}\n", name, value);
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
