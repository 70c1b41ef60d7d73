use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
use crate::error::SyncResult;

/// Aggregate health across every breaker in a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No breaker is OPEN or HALF_OPEN
    Healthy,
    /// None OPEN, some HALF_OPEN
    Recovering,
    /// Some but not all OPEN
    Degraded,
    /// Every breaker OPEN
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Recovering => write!(f, "recovering"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    #[serde(flatten)]
    pub stats: CircuitBreakerStats,
    pub success_rate: f64,
}

/// Health report for a registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub overall_health: HealthStatus,
    pub total_breakers: usize,
    pub closed_breakers: usize,
    pub half_open_breakers: usize,
    pub open_breakers: usize,
    pub breaker_details: BTreeMap<String, BreakerSnapshot>,
}

/// Owns the named circuit breakers of a process.
///
/// Construct one at startup and hand it to every component that needs
/// resilience; breakers are created lazily on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose lazily created breakers use `config` unless a call
    /// supplies its own
    pub fn with_default_config(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config: config,
        }
    }

    /// Config used for breakers created without one
    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }

    /// Get the breaker for `name`, creating it on first use. `config` is
    /// only consulted when the breaker does not exist yet.
    pub fn get_or_create(&self, name: &str, config: Option<CircuitBreakerConfig>) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            let config = config.unwrap_or_else(|| self.default_config.clone());
            info!(name, "Created new circuit breaker");
            Arc::new(CircuitBreaker::new(name, config))
        });
        Arc::clone(entry.value())
    }

    /// Run `f` through the named breaker
    pub fn call_through<F, T>(&self, name: &str, f: F, config: Option<CircuitBreakerConfig>) -> SyncResult<T>
    where
        F: FnOnce() -> SyncResult<T>,
    {
        self.get_or_create(name, config).call(f)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Copy out the breakers so no map guard is held while their own
    /// locks are taken
    fn snapshot(&self) -> Vec<(String, Arc<CircuitBreaker>)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Per-breaker state and statistics
    pub fn all_stats(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.snapshot()
            .into_iter()
            .map(|(name, breaker)| {
                let state = breaker.state();
                let stats = breaker.stats();
                let success_rate = stats.success_rate();
                (
                    name,
                    BreakerSnapshot {
                        state,
                        stats,
                        success_rate,
                    },
                )
            })
            .collect()
    }

    pub fn reset_all(&self) {
        for (_, breaker) in self.snapshot() {
            breaker.reset();
        }
        info!(count = self.len(), "Reset all circuit breakers");
    }

    pub fn health_summary(&self) -> HealthSummary {
        let details = self.all_stats();

        let total = details.len();
        let open = details.values().filter(|s| s.state == CircuitState::Open).count();
        let half_open = details
            .values()
            .filter(|s| s.state == CircuitState::HalfOpen)
            .count();

        let overall_health = if open > 0 {
            if open < total {
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            }
        } else if half_open > 0 {
            HealthStatus::Recovering
        } else {
            HealthStatus::Healthy
        };

        debug!(%overall_health, total, open, half_open, "Computed circuit breaker health");

        HealthSummary {
            overall_health,
            total_breakers: total,
            closed_breakers: total - open - half_open,
            half_open_breakers: half_open,
            open_breakers: open,
            breaker_details: details,
        }
    }
}

/// Wrap `f` so every invocation goes through the named breaker
pub fn wrap<F, T>(
    registry: Arc<CircuitBreakerRegistry>,
    name: impl Into<String>,
    config: Option<CircuitBreakerConfig>,
    f: F,
) -> impl Fn() -> SyncResult<T>
where
    F: Fn() -> SyncResult<T>,
{
    let name = name.into();
    move || registry.call_through(&name, &f, config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errors;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = CircuitBreakerRegistry::new();
        let first = registry.get_or_create("op", Some(CircuitBreakerConfig::new(2, 10.0)));
        let second = registry.get_or_create("op", Some(CircuitBreakerConfig::new(9, 99.0)));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().failure_threshold, 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_creation_yields_one_breaker() {
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.get_or_create("shared", None))
            })
            .collect();

        let breakers: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect();
        assert!(breakers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_health_summary_states() {
        let registry = CircuitBreakerRegistry::new();
        assert_eq!(registry.health_summary().overall_health, HealthStatus::Healthy);

        let a = registry.get_or_create("a", None);
        let b = registry.get_or_create("b", None);
        assert_eq!(registry.health_summary().overall_health, HealthStatus::Healthy);

        a.force_open();
        let summary = registry.health_summary();
        assert_eq!(summary.overall_health, HealthStatus::Degraded);
        assert_eq!(summary.open_breakers, 1);
        assert_eq!(summary.closed_breakers, 1);

        b.force_open();
        assert_eq!(registry.health_summary().overall_health, HealthStatus::Unhealthy);

        registry.reset_all();
        assert_eq!(registry.health_summary().overall_health, HealthStatus::Healthy);
    }

    #[test]
    fn test_health_recovering_when_half_open() {
        let registry = CircuitBreakerRegistry::new();
        let breaker = registry.get_or_create("flaky", Some(CircuitBreakerConfig::new(1, 0.02)));
        let _ = breaker.call(|| -> SyncResult<()> { Err(errors::internal("boom")) });
        assert_eq!(registry.health_summary().overall_health, HealthStatus::Unhealthy);

        thread::sleep(std::time::Duration::from_millis(30));
        let summary = registry.health_summary();
        assert_eq!(summary.overall_health, HealthStatus::Recovering);
        assert_eq!(summary.half_open_breakers, 1);
        assert_eq!(summary.breaker_details["flaky"].state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_wrap_routes_through_named_breaker() {
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let guarded = {
            let calls = Arc::clone(&calls);
            wrap(
                Arc::clone(&registry),
                "wrapped",
                Some(CircuitBreakerConfig::new(2, 60.0)),
                move || -> SyncResult<u32> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(errors::service("InternalServerError", "oops"))
                },
            )
        };

        assert!(guarded().is_err());
        assert!(guarded().is_err());
        assert!(matches!(guarded(), Err(e) if e.is_circuit_open()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.names(), vec!["wrapped".to_string()]);
    }
}
