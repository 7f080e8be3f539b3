//! C4: the set of upstream contexts belonging to one account, plus the
//! migration scoring used when that set is full (§4.2).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use crate::external::AccountRuntimeStats;

use super::context::{ScoringSnapshot, UpstreamContext};

/// Starting score before any penalty/bonus is applied (§4.2, "Start at
/// 100").
const SCORE_BASE: f64 = 100.0;

/// Flat penalty for a context already marked broken. In practice
/// broken contexts short-circuit to `NEG_INFINITY` before this
/// matters, but the constant documents the spec's stated weight.
const BROKEN_PENALTY: f64 = 30.0;

/// Per-failure-streak penalty and its cap.
const FAILURE_STREAK_PENALTY_PER: f64 = 12.0;
const FAILURE_STREAK_PENALTY_CAP: f64 = 40.0;

/// Extra penalty if the context failed recently, on top of the streak
/// penalty above.
const RECENT_FAILURE_PENALTY: f64 = 18.0;
const RECENT_FAILURE_WINDOW: Duration = Duration::from_secs(2 * 60);

/// Penalty for having just been migrated, discouraging back-to-back
/// reassignment of the same slot.
const RECENT_MIGRATION_PENALTY: f64 = 10.0;
const RECENT_MIGRATION_WINDOW: Duration = Duration::from_secs(60);

/// Per-migration-count penalty and its cap.
const MIGRATION_COUNT_PENALTY_PER: f64 = 4.0;
const MIGRATION_COUNT_PENALTY_CAP: f64 = 20.0;

/// Idle-age adjustment thresholds (§4.2, "Idle-age adjustment").
const IDLE_SHORT_THRESHOLD: Duration = Duration::from_secs(15);
const IDLE_SHORT_PENALTY: f64 = 15.0;
const IDLE_LONG_THRESHOLD: Duration = Duration::from_secs(3 * 60);
const IDLE_LONG_BONUS: f64 = 16.0;
const IDLE_SECONDS_DIVISOR: f64 = 12.0;

/// Load-awareness weights, applied only when the caller supplies
/// account runtime stats (§4.2, "Load awareness (optional)").
const ERROR_RATE_WEIGHT: f64 = 30.0;
const CIRCUIT_OPEN_PENALTY: f64 = 50.0;

/// One account's slice of the ingress context pool (C4).
pub struct AccountPool {
    account_id: String,
    hard_cap: u32,
    dynamic_cap: AtomicU32,
    contexts: DashMap<Uuid, Arc<UpstreamContext>>,
    by_session_key: DashMap<String, Uuid>,
    ref_count: AtomicU32,
}

impl AccountPool {
    /// Create a new, empty pool for `account_id` with the given hard
    /// capacity (already `min`'d against the account's own
    /// concurrency limit by the caller, via
    /// [`crate::config::GatewayConfig::hard_cap`]).
    ///
    /// The dynamic capacity starts at 1 and grows lazily as contexts
    /// are created (§3, "an integer starting at 1 that grows by +1").
    #[must_use]
    pub fn new(account_id: impl Into<String>, hard_cap: u32) -> Self {
        Self {
            account_id: account_id.into(),
            hard_cap,
            dynamic_cap: AtomicU32::new(1.min(hard_cap.max(1))),
            contexts: DashMap::new(),
            by_session_key: DashMap::new(),
            ref_count: AtomicU32::new(0),
        }
    }

    /// The account this pool belongs to.
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Increment the in-flight reference count. Called once per
    /// `Acquire` entry; the sweeper may only drop an empty, unreferenced
    /// pool (§3, "Reference count").
    pub fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the in-flight reference count. Called once per
    /// `Acquire` exit, on every path (success, error, or cancellation).
    pub fn dec_ref(&self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Current in-flight reference count.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Total number of contexts currently tracked, live or idle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether the pool has no tracked contexts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// The effective capacity right now: the dynamic cap (which can
    /// shrink under repeated failure and grow back), never above the
    /// hard cap.
    #[must_use]
    pub fn effective_cap(&self) -> u32 {
        self.dynamic_cap.load(Ordering::Relaxed).min(self.hard_cap)
    }

    /// Whether the pool is at or above its effective capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() as u32 >= self.effective_cap()
    }

    /// Grow the dynamic cap by one, capped at the hard cap. Called
    /// when a new context is created because every existing one is
    /// busy (§3): the pool only ever opens as many slots as have
    /// actually been demanded.
    pub fn grow_dynamic_cap(&self) {
        let hard_cap = self.hard_cap;
        self.dynamic_cap
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cap| {
                Some(cap.saturating_add(1).min(hard_cap.max(1)))
            })
            .ok();
    }

    /// Shrink the dynamic cap to fit the current context count (never
    /// below 1), called once per sweep pass (§4.2) so capacity that
    /// was opened for a burst of concurrent sessions is released once
    /// those sessions idle out and get evicted.
    pub fn shrink_to_fit(&self) {
        let floor = (self.len() as u32).max(1);
        self.dynamic_cap.store(floor, Ordering::Relaxed);
    }

    /// Find a context already bound to `session_key`.
    #[must_use]
    pub fn find_by_session_key(&self, session_key: &str) -> Option<Arc<UpstreamContext>> {
        let id = *self.by_session_key.get(session_key)?;
        self.contexts.get(&id).map(|entry| entry.value().clone())
    }

    /// Create and register a new context bound to `session_key`,
    /// growing the dynamic cap by one to account for it (§3).
    #[must_use]
    pub fn insert_new(&self, session_key: String, session_fingerprint: String, idle_ttl: Duration) -> Arc<UpstreamContext> {
        let ctx = Arc::new(UpstreamContext::new(session_key.clone(), session_fingerprint, idle_ttl));
        self.by_session_key.insert(session_key, ctx.id);
        self.contexts.insert(ctx.id, ctx.clone());
        self.grow_dynamic_cap();
        ctx
    }

    /// Rebind `ctx`'s session-key index entry after a migration, so
    /// future lookups for the new session key find it and the old key
    /// no longer does.
    pub fn rebind_session_key(&self, ctx: &UpstreamContext, old_session_key: &str, new_session_key: String) {
        self.by_session_key.remove(old_session_key);
        self.by_session_key.insert(new_session_key, ctx.id);
    }

    /// Drop a context entirely (idle-eviction by the sweeper, §4.5).
    pub fn remove(&self, id: Uuid) -> Option<Arc<UpstreamContext>> {
        let removed = self.contexts.remove(&id).map(|(_, ctx)| ctx);
        if let Some(ctx) = &removed {
            let session_key = ctx.session_key();
            self.by_session_key.remove_if(&session_key, |_, v| *v == id);
        }
        removed
    }

    /// All tracked contexts, for the sweeper to walk.
    #[must_use]
    pub fn all_contexts(&self) -> Vec<Arc<UpstreamContext>> {
        self.contexts.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Score one context as a migration candidate (§4.2). Higher is
    /// better; a broken or still-busy context always scores as
    /// unusable.
    #[must_use]
    pub fn score(snapshot: &ScoringSnapshot, now: Instant, runtime: Option<AccountRuntimeStats>) -> f64 {
        if snapshot.broken || !snapshot.idle {
            return f64::NEG_INFINITY;
        }

        let mut score = SCORE_BASE;

        if snapshot.broken {
            score -= BROKEN_PENALTY;
        }

        score -= (f64::from(snapshot.failure_streak) * FAILURE_STREAK_PENALTY_PER).min(FAILURE_STREAK_PENALTY_CAP);

        if let Some(last_failure_at) = snapshot.last_failure_at {
            if now.saturating_duration_since(last_failure_at) < RECENT_FAILURE_WINDOW {
                score -= RECENT_FAILURE_PENALTY;
            }
        }

        if let Some(last_migration_at) = snapshot.last_migration_at {
            if now.saturating_duration_since(last_migration_at) < RECENT_MIGRATION_WINDOW {
                score -= RECENT_MIGRATION_PENALTY;
            }
        }

        score -= (f64::from(snapshot.migration_count) * MIGRATION_COUNT_PENALTY_PER).min(MIGRATION_COUNT_PENALTY_CAP);

        let idle_since = now.saturating_duration_since(snapshot.last_used_at);
        if idle_since < IDLE_SHORT_THRESHOLD {
            score -= IDLE_SHORT_PENALTY;
        } else if idle_since > IDLE_LONG_THRESHOLD {
            score += IDLE_LONG_BONUS;
        } else {
            score += idle_since.as_secs_f64() / IDLE_SECONDS_DIVISOR;
        }

        if let Some(runtime) = runtime {
            score -= runtime.error_rate.clamp(0.0, 1.0) * ERROR_RATE_WEIGHT;
            if runtime.circuit_open {
                score -= CIRCUIT_OPEN_PENALTY;
            }
        }

        score
    }

    /// Find the best migration candidate among this account's idle
    /// contexts: the highest-scoring one that clears `min_score`
    /// (§4.2.c, §4.3's stickiness-tiered thresholds), breaking ties in
    /// favor of the one that has been idle longest.
    ///
    /// Excludes `exclude_session_key` so a request never migrates a
    /// context away from its own still-idle session slot.
    #[must_use]
    pub fn find_migration_candidate(
        &self,
        exclude_session_key: &str,
        min_score: f64,
        runtime: Option<AccountRuntimeStats>,
    ) -> Option<Arc<UpstreamContext>> {
        let now = Instant::now();
        let mut best: Option<(f64, Instant, Arc<UpstreamContext>)> = None;
        for entry in self.contexts.iter() {
            let ctx = entry.value();
            if ctx.session_key() == exclude_session_key {
                continue;
            }
            let snapshot = ctx.scoring_snapshot();
            let score = Self::score(&snapshot, now, runtime);
            if score < min_score {
                continue;
            }
            let is_better = match &best {
                Some((best_score, best_last_used, _)) => {
                    score > *best_score || (score == *best_score && snapshot.last_used_at < *best_last_used)
                }
                None => true,
            };
            if is_better {
                best = Some((score, snapshot.last_used_at, ctx.clone()));
            }
        }
        best.map(|(_, _, ctx)| ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_cap_starts_at_one_and_grows_by_demand() {
        let pool = AccountPool::new("acct_1", 4);
        assert_eq!(pool.effective_cap(), 1);
        pool.grow_dynamic_cap();
        assert_eq!(pool.effective_cap(), 2);
        pool.grow_dynamic_cap();
        pool.grow_dynamic_cap();
        pool.grow_dynamic_cap();
        assert_eq!(pool.effective_cap(), 4, "dynamic cap never exceeds the hard cap");
    }

    #[test]
    fn shrink_to_fit_drops_to_context_count_but_never_below_one() {
        let pool = AccountPool::new("acct_1", 4);
        pool.grow_dynamic_cap();
        pool.grow_dynamic_cap();
        pool.grow_dynamic_cap();
        assert_eq!(pool.effective_cap(), 4);
        pool.insert_new("sess-a".into(), "fp".into(), Duration::from_secs(60));
        pool.shrink_to_fit();
        assert_eq!(pool.effective_cap(), 1);
    }

    #[test]
    fn insert_and_lookup_by_session_key() {
        let pool = AccountPool::new("acct_1", 4);
        let ctx = pool.insert_new("sess-a".into(), "fp".into(), Duration::from_secs(60));
        let found = pool.find_by_session_key("sess-a").unwrap();
        assert_eq!(found.id, ctx.id);
        assert!(pool.find_by_session_key("sess-b").is_none());
    }

    #[test]
    fn is_full_compares_against_effective_cap() {
        let pool = AccountPool::new("acct_1", 2);
        pool.insert_new("sess-a".into(), "fp".into(), Duration::from_secs(60));
        assert!(!pool.is_full());
        pool.insert_new("sess-b".into(), "fp".into(), Duration::from_secs(60));
        assert!(pool.is_full());
    }

    #[test]
    fn ref_count_tracks_inc_and_dec() {
        let pool = AccountPool::new("acct_1", 4);
        assert_eq!(pool.ref_count(), 0);
        pool.inc_ref();
        pool.inc_ref();
        assert_eq!(pool.ref_count(), 2);
        pool.dec_ref();
        assert_eq!(pool.ref_count(), 1);
        pool.dec_ref();
        assert_eq!(pool.ref_count(), 0);
    }

    #[test]
    fn remove_clears_session_key_index() {
        let pool = AccountPool::new("acct_1", 4);
        let ctx = pool.insert_new("sess-a".into(), "fp".into(), Duration::from_secs(60));
        pool.remove(ctx.id);
        assert!(pool.find_by_session_key("sess-a").is_none());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn broken_contexts_never_score_as_candidates() {
        let snapshot = ScoringSnapshot {
            idle: true,
            has_upstream: false,
            broken: true,
            failure_streak: 0,
            last_failure_at: None,
            migration_count: 0,
            last_migration_at: None,
            last_used_at: Instant::now(),
        };
        assert_eq!(AccountPool::score(&snapshot, Instant::now(), None), f64::NEG_INFINITY);
    }

    #[test]
    fn migration_candidate_excludes_the_requesting_session() {
        let pool = AccountPool::new("acct_1", 4);
        pool.insert_new("sess-a".into(), "fp".into(), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        let candidate = pool.find_migration_candidate("sess-a", f64::NEG_INFINITY, None);
        assert!(candidate.is_none(), "the only idle context is the caller's own session");
    }

    #[test]
    fn idle_longer_than_the_short_threshold_scores_higher_than_freshly_idle() {
        let now = Instant::now();
        let fresh = ScoringSnapshot {
            idle: true,
            has_upstream: true,
            broken: false,
            failure_streak: 0,
            last_failure_at: None,
            migration_count: 0,
            last_migration_at: None,
            last_used_at: now,
        };
        let settled = ScoringSnapshot {
            last_used_at: now - Duration::from_secs(30),
            ..fresh
        };
        let fresh_score = AccountPool::score(&fresh, now, None);
        let settled_score = AccountPool::score(&settled, now, None);
        assert!(settled_score > fresh_score, "a context idle past the short threshold should outscore one just released");
    }

    #[test]
    fn circuit_open_runtime_stats_depress_the_score() {
        let now = Instant::now();
        let snapshot = ScoringSnapshot {
            idle: true,
            has_upstream: true,
            broken: false,
            failure_streak: 0,
            last_failure_at: None,
            migration_count: 0,
            last_migration_at: None,
            last_used_at: now - Duration::from_secs(30),
        };
        let healthy = AccountPool::score(&snapshot, now, None);
        let degraded = AccountPool::score(
            &snapshot,
            now,
            Some(AccountRuntimeStats {
                error_rate: 0.5,
                circuit_open: true,
            }),
        );
        assert!(degraded < healthy);
    }
}
