//! Local admission policy: a per-identifier window quota plus a minimum
//! interval between admitted requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

use super::decision::{ceil_secs, RateLimitDecision};
use super::identifier::Identifier;
use super::window::{WindowEntry, WindowStore};

/// How the request counter behaves at the end of a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountMode {
    /// The counter resets once the window expires and is enforced locally.
    #[default]
    Windowed,
    /// The counter is an attempts tally that only eviction or a manual
    /// reset clears. Only the cooldown is enforced locally; the hard window
    /// belongs to the external decision service.
    CooldownOnly,
}

/// Parameters of the local admission policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    pub count_mode: CountMode,
    /// Requests admitted per window
    pub max_requests: u32,
    /// Window length (ignored in cooldown-only mode)
    pub window: Duration,
    /// Minimum spacing between admitted requests
    pub min_interval: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            count_mode: CountMode::Windowed,
            max_requests: 5,
            window: Duration::from_secs(15 * 60),
            min_interval: Duration::from_secs(60),
        }
    }
}

/// Read-only view of an identifier's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub count: u32,
    pub remaining: u32,
    pub last_request_at: Option<DateTime<Utc>>,
    /// When the cooldown ends; `None` if no cooldown is active
    pub next_allowed_at: Option<DateTime<Utc>>,
}

/// Evaluates requests against a [`WindowStore`].
#[derive(Debug, Clone)]
pub struct LocalPolicy {
    config: PolicyConfig,
    window: chrono::Duration,
    min_interval: chrono::Duration,
}

impl LocalPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        let window = to_delta(config.window);
        let min_interval = to_delta(config.min_interval);
        Self {
            config,
            window,
            min_interval,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Evaluate one request for `id` at `now`, recording it if admitted.
    ///
    /// Denials leave the stored entry untouched.
    pub fn evaluate(
        &self,
        store: &WindowStore,
        id: &Identifier,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let decision = store.update(id, |current| self.decide(current, now));
        trace!(
            identifier = %id,
            allowed = decision.allowed,
            remaining = decision.remaining,
            retry_after_secs = decision.retry_after_secs,
            "Evaluated local admission policy"
        );
        decision
    }

    fn decide(
        &self,
        current: Option<&WindowEntry>,
        now: DateTime<Utc>,
    ) -> (Option<WindowEntry>, RateLimitDecision) {
        let entry = match current {
            Some(entry) if !self.is_stale(entry, now) => *entry,
            _ => {
                let fresh = WindowEntry::first(now, self.window_end(now));
                return (Some(fresh), RateLimitDecision::allow(self.remaining(fresh.count)));
            }
        };

        // An exhausted quota outlasts any cooldown, so it is the wait worth
        // reporting when both apply.
        if self.config.count_mode == CountMode::Windowed && entry.count >= self.config.max_requests {
            let reset_at = entry.window_reset_at.unwrap_or(now);
            return (None, RateLimitDecision::quota_exceeded(ceil_secs(reset_at - now)));
        }

        let since_last = now - entry.last_request_at;
        if since_last < self.min_interval {
            let retry_after = ceil_secs(self.min_interval - since_last);
            return (
                None,
                RateLimitDecision::cooldown(retry_after, self.remaining(entry.count)),
            );
        }

        let next = WindowEntry {
            count: entry.count.saturating_add(1),
            window_reset_at: entry.window_reset_at,
            last_request_at: now,
        };
        (Some(next), RateLimitDecision::allow(self.remaining(next.count)))
    }

    /// Current state of `id` as an evaluation at `now` would see it.
    pub fn stats(&self, store: &WindowStore, id: &Identifier, now: DateTime<Utc>) -> RateLimitStats {
        let Some(entry) = store.get(id) else {
            return RateLimitStats {
                count: 0,
                remaining: self.config.max_requests,
                last_request_at: None,
                next_allowed_at: None,
            };
        };

        if self.is_stale(&entry, now) {
            return RateLimitStats {
                count: 0,
                remaining: self.config.max_requests,
                last_request_at: Some(entry.last_request_at),
                next_allowed_at: None,
            };
        }

        let cooldown_ends = add(entry.last_request_at, self.min_interval);
        RateLimitStats {
            count: entry.count,
            remaining: self.remaining(entry.count),
            last_request_at: Some(entry.last_request_at),
            next_allowed_at: (now < cooldown_ends).then_some(cooldown_ends),
        }
    }

    /// Time left on the cooldown of `id`; zero if none is active.
    pub fn time_until_next_request(
        &self,
        store: &WindowStore,
        id: &Identifier,
        now: DateTime<Utc>,
    ) -> Duration {
        self.stats(store, id, now)
            .next_allowed_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Whether the stored entry belongs to a window that has ended.
    fn is_stale(&self, entry: &WindowEntry, now: DateTime<Utc>) -> bool {
        match self.config.count_mode {
            CountMode::Windowed => entry.window_reset_at.map_or(true, |reset_at| now >= reset_at),
            CountMode::CooldownOnly => false,
        }
    }

    fn window_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.config.count_mode {
            CountMode::Windowed => Some(add(now, self.window)),
            CountMode::CooldownOnly => None,
        }
    }

    fn remaining(&self, count: u32) -> u32 {
        self.config.max_requests.saturating_sub(count)
    }
}

fn to_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::max_value())
}

fn add(instant: DateTime<Utc>, delta: chrono::Duration) -> DateTime<Utc> {
    instant
        .checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
