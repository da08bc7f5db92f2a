use serde::{Deserialize, Serialize};

/// Live health of a provider, driven by call outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderHealth {
    /// Last call succeeded.
    Healthy,
    /// Recent failures, still first-class eligible.
    Degraded,
    /// Circuit open: deprioritized until the cooldown elapses.
    Down,
}

/// Snapshot of a registered provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderDescriptor {
    pub name: String,
    /// Lower rank is tried first.
    pub priority_rank: usize,
    pub health: ProviderHealth,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
}
