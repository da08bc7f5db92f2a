use serde::Serialize;

/// Outcome of the rate-limit gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admitted {
        requests_remaining: u32,
    },
    RateLimited {
        requests_remaining: u32,
        retry_after_secs: u64,
    },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    pub fn requests_remaining(&self) -> u32 {
        match self {
            Self::Admitted { requests_remaining }
            | Self::RateLimited {
                requests_remaining, ..
            } => *requests_remaining,
        }
    }
}

/// Outcome of a token-budget check or update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum BudgetDecision {
    Within {
        tokens_used_today: u64,
        tokens_remaining: u64,
    },
    BudgetExceeded {
        tokens_used_today: u64,
        daily_limit: u64,
    },
}

impl BudgetDecision {
    pub fn is_within(&self) -> bool {
        matches!(self, Self::Within { .. })
    }

    pub fn tokens_used_today(&self) -> u64 {
        match self {
            Self::Within {
                tokens_used_today, ..
            }
            | Self::BudgetExceeded {
                tokens_used_today, ..
            } => *tokens_used_today,
        }
    }
}

/// Read-only view of a user's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub user_id: String,
    pub tokens_used_today: u64,
    pub daily_limit: u64,
    pub tokens_remaining: u64,
    pub requests_remaining: u32,
    pub requests_per_window: u32,
}
