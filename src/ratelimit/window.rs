//! Per-key admission history and the store that owns it.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Minimum time between two sweeps of the same entry.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A key that identifies one admission history.
///
/// With per-policy scoping the key carries the policy name, so the same
/// identifier keeps a separate history for each policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowKey {
    /// Policy the history belongs to, if histories are scoped per policy
    pub policy: Option<String>,
    /// Caller-supplied identifier
    pub identifier: String,
}

impl WindowKey {
    /// Key scoped to a single policy.
    pub fn scoped(policy: &str, identifier: &str) -> Self {
        WindowKeyRef::scoped(policy, identifier).into_owned()
    }

    /// Key shared by every policy applied to the identifier.
    pub fn shared(identifier: &str) -> Self {
        WindowKeyRef::shared(identifier).into_owned()
    }

    /// Borrowed view of this key.
    pub fn as_key_ref(&self) -> WindowKeyRef<'_> {
        WindowKeyRef {
            policy: self.policy.as_deref(),
            identifier: &self.identifier,
        }
    }
}

/// Borrowed form of [`WindowKey`], used to look up entries without allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowKeyRef<'a> {
    pub policy: Option<&'a str>,
    pub identifier: &'a str,
}

impl<'a> WindowKeyRef<'a> {
    pub fn scoped(policy: &'a str, identifier: &'a str) -> Self {
        Self {
            policy: Some(policy),
            identifier,
        }
    }

    pub fn shared(identifier: &'a str) -> Self {
        Self {
            policy: None,
            identifier,
        }
    }

    pub fn into_owned(self) -> WindowKey {
        WindowKey {
            policy: self.policy.map(str::to_string),
            identifier: self.identifier.to_string(),
        }
    }
}

impl std::fmt::Display for WindowKeyRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.policy {
            Some(policy) => write!(f, "{}:{}", policy, self.identifier),
            None => write!(f, "{}", self.identifier),
        }
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_key_ref().fmt(f)
    }
}

/// Common view over owned and borrowed keys.
///
/// Owned keys borrow as `dyn WindowKeyParts`, which lets the map be queried
/// with a [`WindowKeyRef`]. Both forms hash through `parts()` so they agree.
pub trait WindowKeyParts {
    fn parts(&self) -> (Option<&str>, &str);
}

impl WindowKeyParts for WindowKey {
    fn parts(&self) -> (Option<&str>, &str) {
        (self.policy.as_deref(), &self.identifier)
    }
}

impl WindowKeyParts for WindowKeyRef<'_> {
    fn parts(&self) -> (Option<&str>, &str) {
        (self.policy, self.identifier)
    }
}

impl Hash for WindowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parts().hash(state);
    }
}

impl Hash for dyn WindowKeyParts + '_ {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parts().hash(state);
    }
}

impl PartialEq for dyn WindowKeyParts + '_ {
    fn eq(&self, other: &Self) -> bool {
        self.parts() == other.parts()
    }
}

impl Eq for dyn WindowKeyParts + '_ {}

impl<'a> Borrow<dyn WindowKeyParts + 'a> for WindowKey {
    fn borrow(&self) -> &(dyn WindowKeyParts + 'a) {
        self
    }
}

/// Recent admissions for one key.
///
/// Timestamps are appended at decision time only, so the deque is always in
/// chronological order and expired timestamps sit at the front.
#[derive(Debug, Clone)]
pub struct WindowEntry {
    admission_timestamps: VecDeque<Instant>,
    last_swept_at: Instant,
}

impl WindowEntry {
    /// Create an empty entry.
    pub fn new(now: Instant) -> Self {
        Self {
            admission_timestamps: VecDeque::new(),
            last_swept_at: now,
        }
    }

    /// Drop timestamps at least `window` old, if more than `interval` has
    /// passed since the last sweep.
    ///
    /// Returns `true` if a sweep was performed.
    pub(crate) fn sweep(&mut self, now: Instant, window: Duration, interval: Duration) -> bool {
        if now.saturating_duration_since(self.last_swept_at) <= interval {
            return false;
        }

        let before = self.admission_timestamps.len();
        while self
            .admission_timestamps
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= window)
        {
            self.admission_timestamps.pop_front();
        }
        self.last_swept_at = now;

        trace!(
            removed = before - self.admission_timestamps.len(),
            kept = self.admission_timestamps.len(),
            "Swept window entry"
        );
        true
    }

    /// Count timestamps younger than `window` and return the oldest of them.
    pub fn recent(&self, now: Instant, window: Duration) -> (usize, Option<Instant>) {
        let mut count = 0;
        let mut oldest = None;
        for &t in self
            .admission_timestamps
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) < window)
        {
            if oldest.is_none() {
                oldest = Some(t);
            }
            count += 1;
        }
        (count, oldest)
    }

    /// Record an admission.
    pub(crate) fn admit(&mut self, now: Instant) {
        self.admission_timestamps.push_back(now);
    }

    /// Number of stored timestamps, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.admission_timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admission_timestamps.is_empty()
    }

    pub fn last_swept_at(&self) -> Instant {
        self.last_swept_at
    }
}

/// Storage for admission histories.
///
/// The decision engine only talks to this trait, so an external counter store
/// can replace the in-memory map without touching the decision logic.
///
/// A store is owned by its `RateLimiter` and never handed back out; callers
/// only see `Decision`s. Entries can be read through `with_entry` but only the
/// limiter records admissions or sweeps them:
///
/// ```compile_fail
/// use std::time::Instant;
/// use windowgate::ratelimit::WindowEntry;
///
/// let now = Instant::now();
/// let mut entry = WindowEntry::new(now);
/// entry.admit(now);
/// ```
///
/// ```compile_fail
/// use windowgate::ratelimit::{PolicyRegistry, RateLimiter};
///
/// let limiter = RateLimiter::new(PolicyRegistry::default());
/// let _ = limiter.store();
/// ```
pub trait WindowStore: Send + Sync {
    /// Run `f` on the entry for `key`, creating it if needed.
    ///
    /// Implementations must hold exclusive access to the entry for the whole
    /// call so that read, filter and append happen atomically per key.
    fn with_entry<R>(
        &self,
        key: WindowKeyRef<'_>,
        now: Instant,
        f: impl FnOnce(&mut WindowEntry) -> R,
    ) -> R;

    /// Number of keys with an entry.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    fn clear(&self);
}

/// Process-local window store.
///
/// Each entry sits behind its own mutex; the map lock is only held long enough
/// to look up or insert the entry, so different keys never wait on each other
/// while a decision is made.
#[derive(Debug, Default)]
pub struct InMemoryWindowStore {
    entries: DashMap<WindowKey, Arc<Mutex<WindowEntry>>>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `key`, inserting an empty one on first sight.
    pub(crate) fn get_or_create(
        &self,
        key: WindowKeyRef<'_>,
        now: Instant,
    ) -> Arc<Mutex<WindowEntry>> {
        if let Some(entry) = self.entries.get(&key as &dyn WindowKeyParts) {
            return Arc::clone(entry.value());
        }

        let entry = self.entries.entry(key.into_owned()).or_insert_with(|| {
            debug!(key = %key, "Creating new window entry");
            Arc::new(Mutex::new(WindowEntry::new(now)))
        });
        Arc::clone(entry.value())
    }

    /// Snapshot of the entry for `key`, if one exists.
    #[cfg(test)]
    pub(crate) fn snapshot(&self, key: WindowKeyRef<'_>) -> Option<WindowEntry> {
        self.entries
            .get(&key as &dyn WindowKeyParts)
            .map(|entry| entry.lock().clone())
    }
}

impl WindowStore for InMemoryWindowStore {
    fn with_entry<R>(
        &self,
        key: WindowKeyRef<'_>,
        now: Instant,
        f: impl FnOnce(&mut WindowEntry) -> R,
    ) -> R {
        let entry = self.get_or_create(key, now);
        let mut guard = entry.lock();
        f(&mut guard)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&self) {
        self.entries.clear();
    }
}
