//! Header-driven adaptive rate limiting.
//!
//! Tracks the remaining request budget per resource class from
//! `x-ratelimit-*` response headers and tells callers how long to wait
//! before issuing the next request. Requests flow freely while the budget is
//! comfortable, get spread out proportionally as it runs low, and block for
//! the reset window (or a server-supplied `retry-after`) once exhausted.

use crate::clock::{Clock, SystemClock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Resource class used when the upstream doesn't name one.
pub const DEFAULT_RESOURCE: &str = "core";

/// Floor for the throttling threshold, in requests.
const MIN_THRESHOLD: u32 = 50;

/// Cap on the per-request spreading delay.
const MAX_SPREAD_DELAY: Duration = Duration::from_secs(5);

/// Margin added past the reset instant before trying again.
const RESET_MARGIN: Duration = Duration::from_secs(1);

/// Tracked budget for one resource class.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceBudget {
    pub resource: String,
    pub remaining: u32,
    pub limit: u32,
    /// Epoch milliseconds at which the budget resets.
    pub reset_at: u64,
    pub is_limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    /// Epoch milliseconds until which the resource stays blocked; the later
    /// of the reset instant (plus margin) and any `retry-after` deadline.
    #[serde(skip)]
    limited_until: u64,
}

impl ResourceBudget {
    fn threshold(&self) -> u32 {
        (self.limit / 10).max(MIN_THRESHOLD)
    }
}

/// Process-wide rate-limit state for one upstream service.
#[derive(Debug)]
pub struct RateLimitTracker {
    budgets: Mutex<HashMap<String, ResourceBudget>>,
    clock: Arc<dyn Clock>,
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self { budgets: Mutex::new(HashMap::new()), clock: Arc::new(SystemClock) }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Required wait before the caller may issue a request against `resource`.
    ///
    /// Zero while `remaining` exceeds the threshold (10% of the limit or 50,
    /// whichever is larger). Once limited, the wait runs to one second past
    /// the reset instant, or the server's `retry-after`, whichever is later.
    /// In between, the remaining budget is spread over the time to reset,
    /// capped at five seconds per request.
    pub fn acquire(&self, resource: &str) -> Duration {
        let mut budgets = self.budgets.lock().unwrap_or_else(|p| p.into_inner());
        let Some(budget) = budgets.get_mut(resource) else {
            return Duration::ZERO;
        };

        let now = self.clock.now_millis();

        if budget.is_limited {
            if now >= budget.limited_until {
                // Block window has passed; the next response re-establishes
                // real state.
                budget.is_limited = false;
                budget.retry_after = None;
            } else {
                return Duration::from_millis(budget.limited_until - now);
            }
        }

        if budget.remaining > budget.threshold() {
            return Duration::ZERO;
        }

        // Low on budget: spread the remainder over the time to reset.
        let to_reset = budget.reset_at.saturating_sub(now);
        if to_reset == 0 {
            return Duration::ZERO;
        }
        let per_request = to_reset / u64::from(budget.remaining.max(1));
        Duration::from_millis(per_request).min(MAX_SPREAD_DELAY)
    }

    /// Fold the rate-limit headers of a response into the tracked state.
    ///
    /// Recognized (case-insensitive): `x-ratelimit-remaining`,
    /// `x-ratelimit-limit`, `x-ratelimit-reset` (epoch seconds),
    /// `x-ratelimit-resource`, `retry-after` (seconds).
    pub fn update_from_headers(&self, headers: &HashMap<String, String>) {
        let get = |name: &str| headers.get(name).map(|v| v.trim());
        let resource =
            get("x-ratelimit-resource").unwrap_or(DEFAULT_RESOURCE).to_string();

        let now = self.clock.now_millis();
        let mut budgets = self.budgets.lock().unwrap_or_else(|p| p.into_inner());
        let budget = budgets.entry(resource.clone()).or_insert_with(|| ResourceBudget {
            resource,
            remaining: u32::MAX,
            limit: 0,
            reset_at: 0,
            is_limited: false,
            retry_after: None,
            limited_until: 0,
        });

        if let Some(remaining) = get("x-ratelimit-remaining").and_then(|v| v.parse().ok()) {
            budget.remaining = remaining;
        }
        if let Some(limit) = get("x-ratelimit-limit").and_then(|v| v.parse().ok()) {
            budget.limit = limit;
        }
        if let Some(reset) = get("x-ratelimit-reset").and_then(|v| v.parse::<u64>().ok()) {
            budget.reset_at = reset.saturating_mul(1000);
        }

        let until_reset = budget
            .reset_at
            .saturating_add(RESET_MARGIN.as_millis() as u64);

        if let Some(secs) = get("retry-after").and_then(|v| v.parse::<u64>().ok()) {
            budget.is_limited = true;
            budget.retry_after = Some(Duration::from_secs(secs));
            budget.limited_until = until_reset.max(now.saturating_add(secs * 1000));
            tracing::warn!(
                resource = %budget.resource,
                retry_after_s = secs,
                "rate limited by upstream"
            );
        } else if budget.remaining == 0 {
            budget.is_limited = true;
            budget.limited_until = until_reset;
        } else {
            budget.is_limited = false;
            budget.retry_after = None;
            budget.limited_until = 0;
        }
    }

    /// Fold a rate-limited error into the tracked state.
    pub fn update_from_error(&self, resource: &str, retry_after: Option<Duration>) {
        let now = self.clock.now_millis();
        let mut budgets = self.budgets.lock().unwrap_or_else(|p| p.into_inner());
        let budget = budgets.entry(resource.to_string()).or_insert_with(|| ResourceBudget {
            resource: resource.to_string(),
            remaining: 0,
            limit: 0,
            reset_at: 0,
            is_limited: true,
            retry_after: None,
            limited_until: 0,
        });
        budget.remaining = 0;
        budget.is_limited = true;
        if let Some(wait) = retry_after {
            budget.retry_after = Some(wait);
        }
        let wait = budget.retry_after.unwrap_or(RESET_MARGIN);
        let deadline = now.saturating_add(wait.as_millis() as u64);
        budget.limited_until = budget.limited_until.max(deadline).max(
            budget.reset_at.saturating_add(RESET_MARGIN.as_millis() as u64),
        );
    }

    /// Snapshot of one resource's budget, if it has been observed.
    pub fn budget(&self, resource: &str) -> Option<ResourceBudget> {
        self.budgets.lock().unwrap_or_else(|p| p.into_inner()).get(resource).cloned()
    }

    /// Remaining requests for `resource`; `None` until first observed.
    pub fn remaining(&self, resource: &str) -> Option<u32> {
        self.budget(resource).map(|b| b.remaining)
    }

    pub fn is_limited(&self, resource: &str) -> bool {
        self.budget(resource).map(|b| b.is_limited).unwrap_or(false)
    }
}
