//! Core rate limiter implementation.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::policy::{Policy, PolicyRegistry};
use super::window::{
    InMemoryWindowStore, WindowKeyRef, WindowStore, DEFAULT_SWEEP_INTERVAL,
};
use crate::error::Result;

/// How admission histories are keyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// Each policy keeps its own history per identifier
    #[default]
    PerPolicy,
    /// One history per identifier, shared by every policy applied to it
    Shared,
}

/// The outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// The policy ceiling the decision was made against
    pub limit: u32,
    /// Admissions left in the current window, zero when denied
    pub remaining: u32,
    /// Whole seconds until the oldest admission in the window expires
    pub retry_after: u64,
}

/// Sliding-window rate limiter.
///
/// This struct is thread-safe and can be shared across multiple tasks. Checks
/// for the same key are serialized by the store; checks for different keys
/// proceed independently.
pub struct RateLimiter<C: Clock = SystemClock, S: WindowStore = InMemoryWindowStore> {
    /// Policies call sites may reference by name
    registry: PolicyRegistry,
    /// Admission histories
    store: S,
    /// Time source
    clock: C,
    /// Whether histories are isolated per policy
    scope: KeyScope,
    /// Minimum time between sweeps of one entry
    sweep_interval: Duration,
}

impl RateLimiter {
    /// Create a rate limiter over the system clock and an in-memory store.
    pub fn new(registry: PolicyRegistry) -> Self {
        Self::with_clock(registry, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a rate limiter driven by the given clock.
    pub fn with_clock(registry: PolicyRegistry, clock: C) -> Self {
        Self::with_store(registry, clock, InMemoryWindowStore::new())
    }
}

impl<C: Clock, S: WindowStore> RateLimiter<C, S> {
    /// Create a rate limiter over a custom window store.
    pub fn with_store(registry: PolicyRegistry, clock: C, store: S) -> Self {
        Self {
            registry,
            store,
            clock,
            scope: KeyScope::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Set how histories are keyed.
    pub fn scope(mut self, scope: KeyScope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the minimum time between sweeps of one entry.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Check the named policy for `identifier`, recording an admission if allowed.
    ///
    /// Fails only when `policy_name` is not registered.
    pub fn check(&self, identifier: &str, policy_name: &str) -> Result<Decision> {
        let policy = self.registry.get(policy_name)?;
        Ok(self.check_policy(identifier, &policy))
    }

    /// Check a resolved policy for `identifier`.
    pub fn check_policy(&self, identifier: &str, policy: &Policy) -> Decision {
        let key = self.key_for(policy, identifier);
        let now = self.clock.now();
        let window = policy.window();
        let limit = policy.max_admissions();
        let sweep_interval = self.sweep_interval;

        trace!(
            key = %key,
            policy = policy.name(),
            "Checking rate limit"
        );

        let decision = self.store.with_entry(key, now, |entry| {
            entry.sweep(now, window, sweep_interval);

            let (recent, oldest) = entry.recent(now, window);
            let recent = u32::try_from(recent).unwrap_or(u32::MAX);
            let allowed = recent < limit;

            let remaining = if allowed {
                entry.admit(now);
                limit - recent - 1
            } else {
                0
            };

            Decision {
                allowed,
                limit,
                remaining,
                retry_after: oldest.map_or(0, |t| retry_after_secs(t, window, now)),
            }
        });

        if !decision.allowed {
            debug!(
                key = %key,
                policy = policy.name(),
                retry_after = decision.retry_after,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// The policies this limiter enforces.
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    /// Drop every admission history.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Number of keys with an admission history.
    pub fn entry_count(&self) -> usize {
        self.store.len()
    }

    fn key_for<'a>(&self, policy: &'a Policy, identifier: &'a str) -> WindowKeyRef<'a> {
        match self.scope {
            KeyScope::PerPolicy => WindowKeyRef::scoped(policy.name(), identifier),
            KeyScope::Shared => WindowKeyRef::shared(identifier),
        }
    }
}

/// Seconds, rounded up, until `oldest` is one full window old.
fn retry_after_secs(oldest: Instant, window: Duration, now: Instant) -> u64 {
    let expires_in = window.saturating_sub(now.saturating_duration_since(oldest));
    let secs = expires_in.as_secs();
    if expires_in.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WindowgateError;
    use crate::ratelimit::clock::ManualClock;
    use std::sync::Arc;

    fn registry() -> PolicyRegistry {
        PolicyRegistry::from_policies(vec![
            Policy::new("login", 5, Duration::from_secs(60), "Too many attempts").unwrap(),
            Policy::new("search", 2, Duration::from_secs(10), "Slow down").unwrap(),
        ])
        .unwrap()
    }

    fn limiter() -> (RateLimiter<ManualClock>, ManualClock) {
        let clock = ManualClock::default();
        (RateLimiter::with_clock(registry(), clock.clone()), clock)
    }

    #[test]
    fn test_rate_limiter_creation() {
        let (limiter, _) = limiter();
        assert_eq!(limiter.entry_count(), 0);
        assert_eq!(limiter.registry().len(), 2);
    }

    #[test]
    fn test_first_check_creates_entry() {
        let (limiter, _) = limiter();
        let decision = limiter.check("A", "login").unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.retry_after, 0);
        assert_eq!(limiter.entry_count(), 1);
    }

    #[test]
    fn test_unknown_policy_fails() {
        let (limiter, _) = limiter();
        let result = limiter.check("A", "missing");

        assert!(matches!(result, Err(WindowgateError::PolicyNotFound(_))));
        assert_eq!(limiter.entry_count(), 0);
    }

    #[test]
    fn test_sixth_call_denied() {
        let (limiter, clock) = limiter();

        for expected in [4, 3, 2, 1, 0] {
            let decision = limiter.check("A", "login").unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
            clock.advance(Duration::from_secs(1));
        }

        let decision = limiter.check("A", "login").unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after, 55);
    }

    #[test]
    fn test_denied_calls_do_not_consume_quota() {
        let (limiter, clock) = limiter();
        let start = clock.now();

        limiter.check("A", "search").unwrap();
        limiter.check("A", "search").unwrap();
        for _ in 0..10 {
            assert!(!limiter.check("A", "search").unwrap().allowed);
        }

        let key = WindowKeyRef::scoped("search", "A");
        assert_eq!(limiter.store().snapshot(key).map(|e| e.len()), Some(2));

        clock.set(start + Duration::from_secs(10));
        let decision = limiter.check("A", "search").unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let (limiter, clock) = limiter();

        limiter.check("A", "search").unwrap();
        clock.advance(Duration::from_millis(1500));
        limiter.check("A", "search").unwrap();

        let decision = limiter.check("A", "search").unwrap();
        assert!(!decision.allowed);
        // 10s - 1.5s = 8.5s
        assert_eq!(decision.retry_after, 9);
    }

    #[test]
    fn test_allowed_decision_reports_oldest_expiry() {
        let (limiter, clock) = limiter();

        limiter.check("A", "login").unwrap();
        clock.advance(Duration::from_secs(20));
        let decision = limiter.check("A", "login").unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.retry_after, 40);
    }

    #[test]
    fn test_expired_history_behaves_as_fresh() {
        let (limiter, clock) = limiter();

        for _ in 0..5 {
            limiter.check("A", "login").unwrap();
        }
        clock.advance(Duration::from_secs(60));

        let decision = limiter.check("A", "login").unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.retry_after, 0);
    }

    #[test]
    fn test_filter_applies_between_sweeps() {
        let clock = ManualClock::default();
        let limiter = RateLimiter::with_clock(registry(), clock.clone())
            .sweep_interval(Duration::from_secs(3600));

        limiter.check("A", "search").unwrap();
        limiter.check("A", "search").unwrap();
        clock.advance(Duration::from_secs(10));

        // no sweep has run, but the stale timestamps are ignored
        let decision = limiter.check("A", "search").unwrap();
        assert!(decision.allowed);
        let key = WindowKeyRef::scoped("search", "A");
        assert_eq!(limiter.store().snapshot(key).map(|e| e.len()), Some(3));
    }

    #[test]
    fn test_sweep_bounds_history() {
        let (limiter, clock) = limiter();

        for _ in 0..5 {
            limiter.check("A", "login").unwrap();
            clock.advance(Duration::from_secs(61));
        }

        let key = WindowKeyRef::scoped("login", "A");
        assert_eq!(limiter.store().snapshot(key).map(|e| e.len()), Some(1));
    }

    #[test]
    fn test_identifiers_are_independent() {
        let (limiter, _) = limiter();

        for _ in 0..5 {
            limiter.check("A", "login").unwrap();
        }
        assert!(!limiter.check("A", "login").unwrap().allowed);

        let decision = limiter.check("B", "login").unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[test]
    fn test_per_policy_scope_isolates_histories() {
        let (limiter, _) = limiter();

        limiter.check("A", "search").unwrap();
        limiter.check("A", "search").unwrap();
        assert!(!limiter.check("A", "search").unwrap().allowed);

        let decision = limiter.check("A", "login").unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(limiter.entry_count(), 2);
    }

    #[test]
    fn test_shared_scope_shares_histories() {
        let clock = ManualClock::default();
        let limiter = RateLimiter::with_clock(registry(), clock).scope(KeyScope::Shared);

        limiter.check("A", "login").unwrap();
        limiter.check("A", "login").unwrap();

        // two admissions recorded under "login" already fill "search"
        assert!(!limiter.check("A", "search").unwrap().allowed);
        assert_eq!(limiter.check("A", "login").unwrap().remaining, 2);
        assert_eq!(limiter.entry_count(), 1);
    }

    #[test]
    fn test_short_window_sweep_drops_shared_history() {
        let clock = ManualClock::default();
        let limiter =
            RateLimiter::with_clock(registry(), clock.clone()).scope(KeyScope::Shared);

        limiter.check("A", "login").unwrap();
        limiter.check("A", "login").unwrap();
        clock.advance(Duration::from_secs(11));

        // the search sweep uses its 10s window and removes both login admissions
        assert!(limiter.check("A", "search").unwrap().allowed);
        let key = WindowKeyRef::shared("A");
        assert_eq!(limiter.store().snapshot(key).map(|e| e.len()), Some(1));

        // login now only counts the search admission
        let decision = limiter.check("A", "login").unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);
    }

    #[test]
    fn test_clear_resets_histories() {
        let (limiter, _) = limiter();
        for _ in 0..5 {
            limiter.check("A", "login").unwrap();
        }
        assert!(!limiter.check("A", "login").unwrap().allowed);

        limiter.clear();
        let decision = limiter.check("A", "login").unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(limiter.entry_count(), 1);
    }

    #[test]
    fn test_clear() {
        let (limiter, _) = limiter();
        limiter.check("A", "login").unwrap();
        assert_eq!(limiter.entry_count(), 1);

        limiter.clear();
        assert_eq!(limiter.entry_count(), 0);
    }

    #[test]
    fn test_decision_serializes_as_flat_json() {
        let (limiter, _) = limiter();
        let decision = limiter.check("A", "search").unwrap();

        let value = serde_json::to_value(decision).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "allowed": true,
                "limit": 2,
                "remaining": 1,
                "retry_after": 0,
            })
        );
    }

    #[test]
    fn test_retry_after_secs() {
        let now = Instant::now();
        let window = Duration::from_secs(60);

        assert_eq!(retry_after_secs(now, window, now), 60);
        assert_eq!(retry_after_secs(now, window, now + Duration::from_secs(5)), 55);
        assert_eq!(retry_after_secs(now, window, now + Duration::from_millis(59_001)), 1);
        assert_eq!(retry_after_secs(now, window, now + Duration::from_secs(90)), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_over_admit() {
        let clock = ManualClock::default();
        let limiter = Arc::new(RateLimiter::with_clock(registry(), clock));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.check("shared-ip", "login").unwrap().allowed
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 5);
    }
}
