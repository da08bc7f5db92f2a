//! Per-user quota ledger: sliding request window plus rolling token budget.
//!
//! Every check-and-record runs while holding the user's map entry, so two
//! concurrent requests for the same user never both act on a stale count.
//! Different users live on independent entries and do not contend.

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use knowledge_hub_core::config::QuotaConfig;
use knowledge_hub_core::{AdmissionDecision, BudgetDecision, Clock, QuotaSnapshot, SystemClock};

/// Limits applied to every user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub requests_per_window: u32,
    pub window: Duration,
    pub daily_token_limit: u64,
    pub budget_window: Duration,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            requests_per_window: 60,
            window: Duration::from_secs(60),
            daily_token_limit: 100_000,
            budget_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl From<&QuotaConfig> for QuotaPolicy {
    fn from(config: &QuotaConfig) -> Self {
        Self {
            requests_per_window: config.requests_per_minute,
            window: Duration::from_secs(config.window_secs),
            daily_token_limit: config.daily_token_limit,
            budget_window: Duration::from_secs(config.budget_window_secs),
        }
    }
}

/// Counters for one user.
#[derive(Debug)]
struct QuotaEntry {
    /// Admission times inside the current window, oldest first.
    request_times: VecDeque<Instant>,
    tokens_used: u64,
    budget_window_start: Instant,
    last_activity: Instant,
}

impl QuotaEntry {
    fn new(now: Instant) -> Self {
        Self {
            request_times: VecDeque::new(),
            tokens_used: 0,
            budget_window_start: now,
            last_activity: now,
        }
    }

    /// Drop expired admissions and reset the token budget when its window ends.
    fn roll(&mut self, now: Instant, policy: &QuotaPolicy) {
        while let Some(oldest) = self.request_times.front() {
            if now.saturating_duration_since(*oldest) >= policy.window {
                self.request_times.pop_front();
            } else {
                break;
            }
        }
        if now.saturating_duration_since(self.budget_window_start) >= policy.budget_window {
            self.tokens_used = 0;
            self.budget_window_start = now;
        }
    }

    fn requests_remaining(&self, policy: &QuotaPolicy) -> u32 {
        policy
            .requests_per_window
            .saturating_sub(self.request_times.len() as u32)
    }
}

/// In-memory quota ledger.
pub struct QuotaLedger {
    entries: DashMap<String, QuotaEntry>,
    policy: QuotaPolicy,
    clock: Arc<dyn Clock>,
}

impl QuotaLedger {
    pub fn new(policy: QuotaPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: QuotaPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    fn entry(&self, user_id: &str, now: Instant) -> RefMut<'_, String, QuotaEntry> {
        self.entries
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaEntry::new(now))
    }

    /// Admit one request against the sliding window, recording it when admitted.
    pub fn try_admit(&self, user_id: &str) -> AdmissionDecision {
        let now = self.clock.now();
        let mut entry = self.entry(user_id, now);
        entry.roll(now, &self.policy);
        entry.last_activity = now;

        if (entry.request_times.len() as u32) < self.policy.requests_per_window {
            entry.request_times.push_back(now);
            let requests_remaining = entry.requests_remaining(&self.policy);
            tracing::debug!(user_id = user_id, requests_remaining, "Request admitted");
            AdmissionDecision::Admitted { requests_remaining }
        } else {
            let retry_after = entry
                .request_times
                .front()
                .map(|oldest| now.saturating_duration_since(*oldest))
                .map(|age| self.policy.window.saturating_sub(age))
                .unwrap_or(self.policy.window);
            let retry_after_secs = ceil_secs(retry_after).max(1);
            tracing::warn!(user_id = user_id, retry_after_secs, "Rate limit exceeded");
            AdmissionDecision::RateLimited {
                requests_remaining: 0,
                retry_after_secs,
            }
        }
    }

    /// Pre-flight budget check: rejects once prior usage has reached the limit.
    pub fn check_budget(&self, user_id: &str) -> BudgetDecision {
        let now = self.clock.now();
        let mut entry = self.entry(user_id, now);
        entry.roll(now, &self.policy);
        self.budget_decision(entry.tokens_used)
    }

    /// Record the tokens of a completed request.
    ///
    /// Usage is always recorded. The request that crosses the limit is
    /// reported as within budget; only when the limit was already reached
    /// before this call is `BudgetExceeded` returned.
    pub fn try_consume(&self, user_id: &str, tokens: u64) -> BudgetDecision {
        let now = self.clock.now();
        let mut entry = self.entry(user_id, now);
        entry.roll(now, &self.policy);
        entry.last_activity = now;

        let prior = entry.tokens_used;
        entry.tokens_used = prior.saturating_add(tokens);

        tracing::debug!(
            user_id = user_id,
            tokens = tokens,
            total = entry.tokens_used,
            "Recorded token usage"
        );

        if prior >= self.policy.daily_token_limit {
            BudgetDecision::BudgetExceeded {
                tokens_used_today: entry.tokens_used,
                daily_limit: self.policy.daily_token_limit,
            }
        } else {
            BudgetDecision::Within {
                tokens_used_today: entry.tokens_used,
                tokens_remaining: self.policy.daily_token_limit.saturating_sub(entry.tokens_used),
            }
        }
    }

    /// Read-only view of a user's counters as of now.
    pub fn peek(&self, user_id: &str) -> QuotaSnapshot {
        let now = self.clock.now();
        let (tokens_used_today, requests_in_window) = match self.entries.get(user_id) {
            Some(entry) => {
                let tokens = if now.saturating_duration_since(entry.budget_window_start)
                    >= self.policy.budget_window
                {
                    0
                } else {
                    entry.tokens_used
                };
                let requests = entry
                    .request_times
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < self.policy.window)
                    .count() as u32;
                (tokens, requests)
            }
            None => (0, 0),
        };

        QuotaSnapshot {
            user_id: user_id.to_string(),
            tokens_used_today,
            daily_limit: self.policy.daily_token_limit,
            tokens_remaining: self.policy.daily_token_limit.saturating_sub(tokens_used_today),
            requests_remaining: self.policy.requests_per_window.saturating_sub(requests_in_window),
            requests_per_window: self.policy.requests_per_window,
        }
    }

    /// Drop users idle for at least `max_idle`. Returns how many were removed.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_activity) < max_idle);
        before - self.entries.len()
    }

    pub fn tracked_users(&self) -> usize {
        self.entries.len()
    }

    fn budget_decision(&self, tokens_used: u64) -> BudgetDecision {
        if tokens_used >= self.policy.daily_token_limit {
            BudgetDecision::BudgetExceeded {
                tokens_used_today: tokens_used,
                daily_limit: self.policy.daily_token_limit,
            }
        } else {
            BudgetDecision::Within {
                tokens_used_today: tokens_used,
                tokens_remaining: self.policy.daily_token_limit - tokens_used,
            }
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
