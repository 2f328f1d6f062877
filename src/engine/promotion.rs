use std::time::Duration;

use crate::format::FilterVerdict;

/// Wait budgets enforcing forward progress for every group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotionPolicy {
    pub tick_interval: Duration,
    pub max_retry_wait: Duration,
    pub unclaimed_expiry: Duration,
}

/// What the scheduler decides after a verdict has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// Leave the group where it is.
    Keep,
    /// Retry budget spent; resolve to this terminal verdict.
    Force(FilterVerdict),
    /// Nobody claimed the group within the idle budget.
    Expire,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(2),
            max_retry_wait: Duration::from_secs(60),
            unclaimed_expiry: Duration::from_secs(300),
        }
    }
}

impl PromotionPolicy {
    /// Advance the retry clock. A repeat of the previous verdict adds one
    /// tick; any change (including a changed dependency set) restarts it.
    pub fn advance(
        &self,
        previous: Option<FilterVerdict>,
        current: FilterVerdict,
        elapsed: Duration,
        inputs_changed: bool,
    ) -> Duration {
        if previous == Some(current) && !inputs_changed {
            elapsed.saturating_add(self.tick_interval)
        } else {
            Duration::ZERO
        }
    }

    pub fn decide(&self, verdict: FilterVerdict, elapsed: Duration) -> Promotion {
        match verdict {
            FilterVerdict::RetryOrImport | FilterVerdict::RetryOrDiscard
                if elapsed >= self.max_retry_wait =>
            {
                verdict.promoted().map_or(Promotion::Keep, Promotion::Force)
            }
            FilterVerdict::None if elapsed >= self.unclaimed_expiry => Promotion::Expire,
            _ => Promotion::Keep,
        }
    }
}
