//! Composite OTP rate limiter.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::OtpGuardConfig;

use super::clock::{Clock, SystemClock};
use super::decision::{ExternalDecision, RateLimitDecision, RequestContext};
use super::external::{AdapterError, AdapterSettings, ExternalDecisionAdapter};
use super::identifier::Identifier;
use super::policy::{LocalPolicy, PolicyConfig, RateLimitStats};
use super::reaper::{Reaper, ReaperConfig, ReaperHandle};
use super::window::WindowStore;

/// Admission controller for passcode issuance.
///
/// Consults the external decision adapter (when configured and the caller
/// supplied a request context), then the local policy. The first denial
/// wins. The limiter is cheap to share behind an `Arc` and safe to call from
/// many tasks at once.
pub struct OtpRateLimiter {
    policy: LocalPolicy,
    store: Arc<WindowStore>,
    clock: Arc<dyn Clock>,
    adapter: Option<Arc<dyn ExternalDecisionAdapter>>,
    adapter_settings: AdapterSettings,
}

impl OtpRateLimiter {
    /// Create a limiter with its own store, the system clock and no adapter.
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            policy: LocalPolicy::new(config),
            store: Arc::new(WindowStore::new()),
            clock: Arc::new(SystemClock),
            adapter: None,
            adapter_settings: AdapterSettings::default(),
        }
    }

    /// Create a limiter from service configuration. The external adapter,
    /// if any, is attached separately.
    pub fn from_config(config: &OtpGuardConfig) -> Self {
        Self::new(config.rate_limiting.policy())
    }

    /// Use `store` instead of a private one.
    pub fn with_store(mut self, store: Arc<WindowStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_adapter(
        mut self,
        adapter: Arc<dyn ExternalDecisionAdapter>,
        settings: AdapterSettings,
    ) -> Self {
        self.adapter = Some(adapter);
        self.adapter_settings = settings;
        self
    }

    /// Decide whether `identifier` may be sent a code now.
    ///
    /// Admission is recorded; denials are not.
    pub async fn is_allowed(
        &self,
        identifier: &Identifier,
        context: Option<&RequestContext>,
    ) -> RateLimitDecision {
        trace!(identifier = %identifier, "Checking OTP rate limit");

        let external = match (&self.adapter, context) {
            (Some(adapter), Some(context)) => {
                self.consult(adapter.as_ref(), identifier, context).await
            }
            _ => None,
        };

        if let Some(external) = &external {
            if !external.allowed {
                let retry_after = external
                    .retry_after_secs
                    .unwrap_or(self.adapter_settings.default_retry_after_secs);
                debug!(
                    identifier = %identifier,
                    reason = ?external.reason,
                    retry_after_secs = retry_after,
                    "External decision service denied request"
                );
                return RateLimitDecision::external_denied(external.clone(), retry_after);
            }
        }

        let decision = self
            .policy
            .evaluate(&self.store, identifier, self.clock.now())
            .with_external(external);

        if !decision.allowed {
            debug!(
                identifier = %identifier,
                reason = ?decision.reason,
                retry_after_secs = decision.retry_after_secs,
                "OTP rate limit exceeded"
            );
        }
        decision
    }

    /// Call the adapter once, bounded by the configured timeout. Faults are
    /// logged and reported as `None` so evaluation falls back to the local
    /// policy.
    async fn consult(
        &self,
        adapter: &dyn ExternalDecisionAdapter,
        identifier: &Identifier,
        context: &RequestContext,
    ) -> Option<ExternalDecision> {
        let timeout = self.adapter_settings.timeout;
        let result = match tokio::time::timeout(timeout, adapter.decide(identifier, context)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(timeout)),
        };

        match result {
            Ok(decision) => Some(decision),
            Err(e) => {
                warn!(
                    adapter = adapter.name(),
                    identifier = %identifier,
                    error = %e,
                    "External decision unavailable, using local policy only"
                );
                None
            }
        }
    }

    /// Current counters for `identifier`.
    pub fn stats(&self, identifier: &Identifier) -> RateLimitStats {
        self.policy.stats(&self.store, identifier, self.clock.now())
    }

    /// Time until the cooldown of `identifier` ends; zero if none is active.
    pub fn time_until_next_request(&self, identifier: &Identifier) -> Duration {
        self.policy
            .time_until_next_request(&self.store, identifier, self.clock.now())
    }

    /// Forget everything about `identifier`. Returns whether it was tracked.
    pub fn reset(&self, identifier: &Identifier) -> bool {
        let removed = self.store.remove(identifier);
        debug!(identifier = %identifier, removed = removed, "Reset OTP rate limit");
        removed
    }

    /// Forget every identifier.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Number of identifiers with live state.
    pub fn tracked_identifiers(&self) -> usize {
        self.store.len()
    }

    pub fn policy(&self) -> &PolicyConfig {
        self.policy.config()
    }

    pub fn store(&self) -> &Arc<WindowStore> {
        &self.store
    }

    /// Start evicting idle entries from this limiter's store.
    pub fn spawn_reaper(&self, config: ReaperConfig) -> ReaperHandle {
        Reaper::spawn(self.store.clone(), self.clock.clone(), config)
    }
}

impl Default for OtpRateLimiter {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::decision::{DenialReason, ReasonKind};
    use crate::ratelimit::policy::CountMode;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Adapter returning a fixed verdict and counting calls.
    struct FixedAdapter {
        result: fn() -> Result<ExternalDecision, AdapterError>,
        calls: AtomicUsize,
    }

    impl FixedAdapter {
        fn new(result: fn() -> Result<ExternalDecision, AdapterError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExternalDecisionAdapter for FixedAdapter {
        async fn decide(
            &self,
            _identifier: &Identifier,
            _context: &RequestContext,
        ) -> Result<ExternalDecision, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    /// Adapter that never answers in time.
    struct StalledAdapter;

    #[async_trait]
    impl ExternalDecisionAdapter for StalledAdapter {
        async fn decide(
            &self,
            _identifier: &Identifier,
            _context: &RequestContext,
        ) -> Result<ExternalDecision, AdapterError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ExternalDecision::deny(ReasonKind::RateLimit))
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    fn limiter_with_clock() -> (OtpRateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch());
        let limiter = OtpRateLimiter::new(PolicyConfig::default()).with_clock(clock.clone());
        (limiter, clock)
    }

    fn fast_settings() -> AdapterSettings {
        AdapterSettings {
            timeout: Duration::from_millis(50),
            default_retry_after_secs: 900,
        }
    }

    #[tokio::test]
    async fn test_first_request_allowed() {
        let (limiter, _clock) = limiter_with_clock();
        let decision = limiter.is_allowed(&Identifier::otp("a@x.com"), None).await;
        assert!(decision.allowed);
        assert_eq!(limiter.tracked_identifiers(), 1);
    }

    #[tokio::test]
    async fn test_concrete_quota_scenario() {
        let (limiter, clock) = limiter_with_clock();
        let id = Identifier::otp("a@x.com");

        for (i, offset) in [0u64, 61, 61, 61, 61].into_iter().enumerate() {
            clock.advance(Duration::from_secs(offset));
            let decision = limiter.is_allowed(&id, None).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 4 - i as u32);
            assert_eq!(limiter.stats(&id).remaining, 4 - i as u32);
        }

        clock.advance(Duration::from_secs(1));
        let decision = limiter.is_allowed(&id, None).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenialReason::QuotaExceeded));
        assert_eq!(decision.retry_after_secs, 15 * 60 - 245);

        let stats = limiter.stats(&id);
        assert_eq!(stats.count, 5);
        assert_eq!(stats.remaining, 0);
    }

    #[tokio::test]
    async fn test_reset_restores_admission() {
        let (limiter, _clock) = limiter_with_clock();
        let id = Identifier::otp("a@x.com");

        assert!(limiter.is_allowed(&id, None).await.allowed);
        assert!(!limiter.is_allowed(&id, None).await.allowed);

        assert!(limiter.reset(&id));
        assert!(limiter.is_allowed(&id, None).await.allowed);
        assert!(!limiter.reset(&Identifier::otp("unknown@x.com")));
    }

    #[tokio::test]
    async fn test_time_until_next_request() {
        let (limiter, clock) = limiter_with_clock();
        let id = Identifier::otp("a@x.com");
        assert_eq!(limiter.time_until_next_request(&id), Duration::ZERO);

        limiter.is_allowed(&id, None).await;
        clock.advance(Duration::from_secs(45));
        assert_eq!(limiter.time_until_next_request(&id), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_case_insensitive_identifiers_share_state() {
        let (limiter, _clock) = limiter_with_clock();
        assert!(limiter.is_allowed(&Identifier::otp("A@X.com"), None).await.allowed);
        assert!(!limiter.is_allowed(&Identifier::otp("a@x.COM"), None).await.allowed);
    }

    #[tokio::test]
    async fn test_external_denial_short_circuits() {
        let (limiter, _clock) = limiter_with_clock();
        let adapter = FixedAdapter::new(|| {
            Ok(ExternalDecision::deny(ReasonKind::BotSuspected).with_retry_after(30))
        });
        let limiter = limiter.with_adapter(adapter.clone(), fast_settings());
        let id = Identifier::otp("a@x.com");

        let decision = limiter.is_allowed(&id, Some(&RequestContext::new())).await;
        assert!(!decision.allowed);
        assert_eq!(
            decision.reason,
            Some(DenialReason::External(ReasonKind::BotSuspected))
        );
        assert_eq!(decision.retry_after_secs, 30);
        assert!(decision.external.is_some());
        assert_eq!(adapter.calls(), 1);
        // Local state untouched.
        assert_eq!(limiter.tracked_identifiers(), 0);
    }

    #[tokio::test]
    async fn test_external_denial_default_retry_after() {
        let (limiter, _clock) = limiter_with_clock();
        let adapter = FixedAdapter::new(|| Ok(ExternalDecision::deny(ReasonKind::RateLimit)));
        let limiter = limiter.with_adapter(adapter, fast_settings());

        let decision = limiter
            .is_allowed(&Identifier::otp("a@x.com"), Some(&RequestContext::new()))
            .await;
        assert_eq!(decision.retry_after_secs, 900);
    }

    #[tokio::test]
    async fn test_external_allow_then_local_policy() {
        let (limiter, _clock) = limiter_with_clock();
        let adapter = FixedAdapter::new(|| Ok(ExternalDecision::allow().with_id("dec-1")));
        let limiter = limiter.with_adapter(adapter.clone(), fast_settings());
        let id = Identifier::otp("a@x.com");
        let ctx = RequestContext::new();

        let first = limiter.is_allowed(&id, Some(&ctx)).await;
        assert!(first.allowed);
        assert_eq!(first.external.and_then(|e| e.id).as_deref(), Some("dec-1"));

        let second = limiter.is_allowed(&id, Some(&ctx)).await;
        assert_eq!(second.reason, Some(DenialReason::Cooldown));
        assert_eq!(adapter.calls(), 2);
    }

    #[tokio::test]
    async fn test_adapter_skipped_without_context() {
        let (limiter, _clock) = limiter_with_clock();
        let adapter = FixedAdapter::new(|| Ok(ExternalDecision::deny(ReasonKind::RateLimit)));
        let limiter = limiter.with_adapter(adapter.clone(), fast_settings());

        let decision = limiter.is_allowed(&Identifier::otp("a@x.com"), None).await;
        assert!(decision.allowed);
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_adapter_error_falls_back_to_local() {
        let (limiter, _clock) = limiter_with_clock();
        let adapter = FixedAdapter::new(|| Err(AdapterError::Unavailable("down".to_string())));
        let limiter = limiter.with_adapter(adapter.clone(), fast_settings());

        let decision = limiter
            .is_allowed(&Identifier::otp("a@x.com"), Some(&RequestContext::new()))
            .await;
        assert!(decision.allowed);
        assert!(decision.external.is_none());
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_adapter_timeout_falls_back_to_local() {
        let (limiter, _clock) = limiter_with_clock();
        let limiter = limiter.with_adapter(Arc::new(StalledAdapter), fast_settings());

        let started = std::time::Instant::now();
        let decision = limiter
            .is_allowed(&Identifier::otp("a@x.com"), Some(&RequestContext::new()))
            .await;
        assert!(decision.allowed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cooldown_only_mode_via_limiter() {
        let clock = Arc::new(ManualClock::at_epoch());
        let limiter = OtpRateLimiter::new(PolicyConfig {
            count_mode: CountMode::CooldownOnly,
            ..PolicyConfig::default()
        })
        .with_clock(clock.clone());
        let id = Identifier::otp("a@x.com");

        for _ in 0..7 {
            assert!(limiter.is_allowed(&id, None).await.allowed);
            clock.advance(Duration::from_secs(60));
        }
        assert_eq!(limiter.stats(&id).count, 7);
        assert_eq!(limiter.stats(&id).remaining, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_admit_exactly_one() {
        const CALLERS: usize = 32;
        let clock = Arc::new(ManualClock::at_epoch());
        let limiter = Arc::new(OtpRateLimiter::default().with_clock(clock));
        let id = Identifier::otp("race@x.com");
        let start = Arc::new(tokio::sync::Barrier::new(CALLERS));

        let checks = (0..CALLERS).map(|_| {
            let limiter = limiter.clone();
            let id = id.clone();
            let start = start.clone();
            tokio::spawn(async move {
                start.wait().await;
                limiter.is_allowed(&id, None).await.allowed
            })
        });
        let results = futures::future::join_all(checks).await;

        let admitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(admitted, 1);
        assert_eq!(limiter.stats(&id).count, 1);
    }

    #[tokio::test]
    async fn test_shared_store_between_limiters() {
        let store = Arc::new(WindowStore::new());
        let a = OtpRateLimiter::default().with_store(store.clone());
        let b = OtpRateLimiter::default().with_store(store.clone());
        let id = Identifier::otp("a@x.com");

        assert!(a.is_allowed(&id, None).await.allowed);
        assert!(!b.is_allowed(&id, None).await.allowed);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_blocking_check_from_sync_code() {
        let limiter = OtpRateLimiter::default();
        let decision = tokio_test::block_on(limiter.is_allowed(&Identifier::otp("a@x.com"), None));
        assert!(decision.allowed);
        limiter.clear();
        assert_eq!(limiter.tracked_identifiers(), 0);
    }
}
