//! Provider registry and health tracking.
//!
//! Each provider carries a small circuit breaker:
//!
//! - success: `healthy`, counters reset, circuit closed
//! - failure: `degraded`
//! - `failure_threshold` consecutive failures: `down` until the cooldown ends
//! - after the cooldown one trial call is let through; its outcome closes or
//!   re-opens the circuit

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use knowledge_hub_core::config::RouterConfig;
use knowledge_hub_core::{Clock, LlmProvider, ProviderDescriptor, ProviderHealth, SystemClock};

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl From<&RouterConfig> for HealthPolicy {
    fn from(config: &RouterConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_secs(config.cooldown_secs),
        }
    }
}

/// Live status of one provider.
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub health: ProviderHealth,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    /// Circuit open until this instant.
    pub down_until: Option<Instant>,
    /// A half-open trial is currently running.
    probing: bool,
}

impl ProviderStatus {
    pub fn new() -> Self {
        Self {
            health: ProviderHealth::Healthy,
            consecutive_failures: 0,
            total_calls: 0,
            total_failures: 0,
            down_until: None,
            probing: false,
        }
    }

    pub fn record_success(&mut self) {
        self.total_calls += 1;
        self.health = ProviderHealth::Healthy;
        self.consecutive_failures = 0;
        self.down_until = None;
        self.probing = false;
    }

    pub fn record_failure(&mut self, now: Instant, policy: &HealthPolicy) {
        self.total_calls += 1;
        self.total_failures += 1;
        self.consecutive_failures += 1;

        if self.probing || self.consecutive_failures >= policy.failure_threshold {
            self.health = ProviderHealth::Down;
            self.down_until = Some(now + policy.cooldown);
        } else {
            self.health = ProviderHealth::Degraded;
        }
        self.probing = false;
    }

    /// Circuit is open and the cooldown has not yet elapsed.
    pub fn is_circuit_open(&self, now: Instant) -> bool {
        self.health == ProviderHealth::Down && self.down_until.map_or(false, |until| now < until)
    }

    /// Claim the right to call this provider now.
    ///
    /// Always granted while the circuit is closed. Once a `down` provider's
    /// cooldown has elapsed, exactly one caller gets the trial slot.
    fn try_acquire(&mut self, now: Instant) -> bool {
        if self.health != ProviderHealth::Down {
            return true;
        }
        if self.is_circuit_open(now) || self.probing {
            return false;
        }
        self.probing = true;
        true
    }
}

impl Default for ProviderStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// One registered provider, in priority order.
#[derive(Clone)]
pub struct RegisteredProvider {
    pub provider: Arc<dyn LlmProvider>,
    pub priority_rank: usize,
}

impl RegisteredProvider {
    pub fn name(&self) -> &str {
        self.provider.name()
    }
}

/// Registry of providers and their health.
pub struct ProviderRegistry {
    providers: Vec<RegisteredProvider>,
    status: DashMap<String, ProviderStatus>,
    policy: HealthPolicy,
    clock: Arc<dyn Clock>,
}

impl ProviderRegistry {
    pub fn new(policy: HealthPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: HealthPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            providers: Vec::new(),
            status: DashMap::new(),
            policy,
            clock,
        }
    }

    /// Register a provider after the existing ones.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        let name = provider.name().to_string();
        let priority_rank = self.providers.len();
        tracing::info!(provider = %name, priority_rank, "Registered LLM provider");
        self.status.insert(name, ProviderStatus::new());
        self.providers.push(RegisteredProvider {
            provider,
            priority_rank,
        });
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Call order for a new request: priority rank, with providers whose
    /// circuit is open moved behind the others. Once the cooldown elapses a
    /// provider is back at its rank, so the next request tries it.
    pub fn call_order(&self) -> Vec<RegisteredProvider> {
        let now = self.clock.now();
        let mut ordered = self.providers.clone();
        ordered.sort_by_key(|p| {
            let open = self
                .status
                .get(p.name())
                .map_or(false, |s| s.is_circuit_open(now));
            (open, p.priority_rank)
        });
        ordered
    }

    /// Claim a call slot for `name`; false while its circuit is open.
    pub fn try_acquire(&self, name: &str) -> bool {
        let now = self.clock.now();
        match self.status.get_mut(name) {
            Some(mut status) => {
                let granted = status.try_acquire(now);
                if granted && status.health == ProviderHealth::Down {
                    tracing::info!(provider = name, "Circuit half-open, probing provider");
                }
                granted
            }
            None => false,
        }
    }

    pub fn record_success(&self, name: &str) {
        if let Some(mut status) = self.status.get_mut(name) {
            if status.health != ProviderHealth::Healthy {
                tracing::info!(provider = name, "Provider recovered");
            }
            status.record_success();
        }
    }

    pub fn record_failure(&self, name: &str) {
        let now = self.clock.now();
        if let Some(mut status) = self.status.get_mut(name) {
            let was_down = status.health == ProviderHealth::Down;
            status.record_failure(now, &self.policy);
            if status.health == ProviderHealth::Down {
                tracing::warn!(
                    provider = name,
                    consecutive_failures = status.consecutive_failures,
                    cooldown_secs = self.policy.cooldown.as_secs(),
                    reopened = was_down,
                    "Circuit breaker OPENED"
                );
            }
        }
    }

    /// Give back a trial slot that ended without a verdict (cancellation).
    pub fn release(&self, name: &str) {
        if let Some(mut status) = self.status.get_mut(name) {
            status.probing = false;
        }
    }

    pub fn health(&self, name: &str) -> Option<ProviderHealth> {
        self.status.get(name).map(|s| s.health)
    }

    /// Snapshot of every provider, in registration order.
    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers
            .iter()
            .map(|p| {
                let status = self
                    .status
                    .get(p.name())
                    .map(|s| s.clone())
                    .unwrap_or_default();
                ProviderDescriptor {
                    name: p.name().to_string(),
                    priority_rank: p.priority_rank,
                    health: status.health,
                    consecutive_failures: status.consecutive_failures,
                    total_calls: status.total_calls,
                    total_failures: status.total_failures,
                }
            })
            .collect()
    }

    /// At least one provider can currently take a call.
    pub fn any_available(&self) -> bool {
        let now = self.clock.now();
        self.providers.iter().any(|p| {
            self.status
                .get(p.name())
                .map_or(false, |s| !s.is_circuit_open(now))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use knowledge_hub_core::ManualClock;

    fn registry(clock: Arc<ManualClock>) -> ProviderRegistry {
        ProviderRegistry::with_clock(HealthPolicy::default(), clock)
            .with_provider(Arc::new(MockProvider::named("primary")))
            .with_provider(Arc::new(MockProvider::named("secondary")))
    }

    #[test]
    fn test_status_transitions() {
        let policy = HealthPolicy::default();
        let now = Instant::now();
        let mut status = ProviderStatus::new();

        status.record_failure(now, &policy);
        assert_eq!(status.health, ProviderHealth::Degraded);
        status.record_failure(now, &policy);
        assert_eq!(status.health, ProviderHealth::Degraded);
        status.record_failure(now, &policy);
        assert_eq!(status.health, ProviderHealth::Down);
        assert!(status.is_circuit_open(now));
        assert!(!status.is_circuit_open(now + Duration::from_secs(30)));

        status.record_success();
        assert_eq!(status.health, ProviderHealth::Healthy);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.total_failures, 3);
        assert_eq!(status.total_calls, 4);
    }

    #[test]
    fn test_down_providers_sort_last() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock);
        for _ in 0..3 {
            registry.record_failure("primary");
        }

        let order: Vec<_> = registry.call_order().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(order, vec!["secondary", "primary"]);
        assert!(!registry.try_acquire("primary"));
        assert!(registry.try_acquire("secondary"));
    }

    #[test]
    fn test_single_trial_after_cooldown() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock.clone());
        for _ in 0..3 {
            registry.record_failure("primary");
        }

        clock.advance(Duration::from_secs(30));
        assert_eq!(registry.call_order()[0].name(), "primary");
        assert!(registry.try_acquire("primary"));
        // Only one caller gets through at a time
        assert!(!registry.try_acquire("primary"));

        registry.record_failure("primary");
        assert_eq!(registry.health("primary"), Some(ProviderHealth::Down));
        assert!(!registry.try_acquire("primary"));

        clock.advance(Duration::from_secs(30));
        assert!(registry.try_acquire("primary"));
        registry.record_success("primary");
        assert_eq!(registry.health("primary"), Some(ProviderHealth::Healthy));
        assert_eq!(registry.call_order()[0].name(), "primary");
    }

    #[test]
    fn test_descriptors_and_availability() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock);
        assert!(registry.any_available());

        for name in ["primary", "secondary"] {
            for _ in 0..3 {
                registry.record_failure(name);
            }
        }
        assert!(!registry.any_available());

        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].priority_rank, 0);
        assert_eq!(descriptors[0].health, ProviderHealth::Down);
        assert_eq!(descriptors[1].total_failures, 3);
    }
}
