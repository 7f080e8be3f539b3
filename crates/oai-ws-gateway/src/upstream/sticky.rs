//! C7: the sticky-routing state store. Only `previousResponseID →
//! accountID` is backed by [`Cache`], so a deployment can swap in a
//! shared cache for that one binding without touching routing logic
//! (§4.6). Response id → conn, and session → conn/turn-state/last
//! failure reason, are process-local connection handles and live in
//! an in-process, TTL-expiring map instead (§4.5).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::StoreDisabledConnMode;
use crate::external::Cache;

use super::error::FallbackReason;

/// How strongly a request prefers landing back on the same connection
/// it was bound to (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickyLevel {
    /// Must land on the exact bound connection or fail; used for
    /// follow-up turns that reference server-side state the model
    /// only has on one socket.
    Strong,
    /// Prefer the bound connection but tolerate a miss by treating the
    /// request as a fresh session.
    Balanced,
    /// No preference; any context for the account will do.
    Weak,
}

/// Whether a request at `level` must find an exact session→conn hit to
/// proceed, given the client's `store` flag and the configured
/// fallback mode for when `store` is disabled (§4.6, §14).
#[must_use]
pub fn requires_exact_hit(level: StickyLevel, store_enabled: bool, disabled_mode: StoreDisabledConnMode) -> bool {
    match level {
        StickyLevel::Weak => false,
        StickyLevel::Strong => true,
        StickyLevel::Balanced => {
            if store_enabled {
                true
            } else {
                disabled_mode == StoreDisabledConnMode::Strict
            }
        }
    }
}

/// Whether a session→conn lookup should even be attempted, given the
/// client's `store` flag and the configured mode (§14).
#[must_use]
pub fn should_consult_session_index(store_enabled: bool, disabled_mode: StoreDisabledConnMode) -> bool {
    store_enabled || disabled_mode != StoreDisabledConnMode::Off
}

/// The minimum migration score a candidate must clear for a request at
/// `level` (§4.2.c, §4.3). Strong stickiness never migrates: a request
/// that must land on its exact bound connection gains nothing from
/// taking over someone else's idle slot.
#[must_use]
pub fn migration_score_threshold(level: StickyLevel) -> Option<f64> {
    match level {
        StickyLevel::Strong => None,
        StickyLevel::Balanced => Some(65.0),
        StickyLevel::Weak => Some(40.0),
    }
}

/// Resolve the stickiness level to apply to one request (§4.3), before
/// any context-based adjustment.
///
/// `has_previous_response_id` means the request references an existing
/// conversation turn and so has the most to lose from landing on the
/// wrong connection; `strict_affinity` is an account- or
/// request-level override that forces [`StickyLevel::Strong`]
/// regardless of the other inputs.
#[must_use]
pub fn resolve_level(has_previous_response_id: bool, store_enabled: bool, turn_number: u32, strict_affinity: bool) -> StickyLevel {
    if strict_affinity {
        return StickyLevel::Strong;
    }
    if has_previous_response_id {
        return StickyLevel::Strong;
    }
    if !store_enabled || turn_number > 0 {
        return StickyLevel::Balanced;
    }
    StickyLevel::Weak
}

const RECENT_FAILURE_DOWNGRADE_WINDOW: Duration = Duration::from_secs(2 * 60);
const RECENT_USE_UPGRADE_WINDOW: Duration = Duration::from_secs(20);

fn one_step_down(level: StickyLevel) -> StickyLevel {
    match level {
        StickyLevel::Strong => StickyLevel::Balanced,
        StickyLevel::Balanced | StickyLevel::Weak => StickyLevel::Weak,
    }
}

fn one_step_up(level: StickyLevel) -> StickyLevel {
    match level {
        StickyLevel::Weak => StickyLevel::Balanced,
        StickyLevel::Balanced | StickyLevel::Strong => StickyLevel::Strong,
    }
}

/// Adjust a resolved level by one step based on the health of the
/// context the session key already maps to (§4.3, "context-based
/// adjustment"): downgrade one step if the context is broken or failed
/// within the last 2 minutes; otherwise upgrade one step if it has a
/// clean failure streak and was used within the last 20 seconds.
///
/// Callers pass already-elapsed durations (rather than raw `Instant`s)
/// so this function stays a pure, easily testable decision table.
#[must_use]
pub fn adjust_for_context(
    level: StickyLevel,
    context_broken: bool,
    context_failure_streak: u32,
    time_since_last_failure: Option<Duration>,
    time_since_last_used: Duration,
) -> StickyLevel {
    let recently_failed = time_since_last_failure.is_some_and(|since| since < RECENT_FAILURE_DOWNGRADE_WINDOW);
    if context_broken || recently_failed {
        return one_step_down(level);
    }
    if context_failure_streak == 0 && time_since_last_used < RECENT_USE_UPGRADE_WINDOW {
        return one_step_up(level);
    }
    level
}

const RESPONSE_ACCOUNT_PREFIX: &str = "sticky:resp_acct:";

/// How long a recorded "last failure reason" stays eligible to force a
/// new connection on the next attempt for the same session (§4.7).
const FORCE_NEW_CONNECTION_TTL: Duration = Duration::from_secs(30);

/// A process-local, TTL-expiring map. Backs the three mappings that
/// must never leave this instance — `responseID→connID`,
/// `(group,session)→connID`, and `(group,session)→turnState` — since a
/// `connID` is a process-local in-memory handle that means nothing to
/// another replica reading it back from a shared cache (§3, §4.5).
struct TtlMap<V> {
    entries: DashMap<String, (V, Instant)>,
}

impl<V: Clone> TtlMap<V> {
    fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    fn insert(&self, key: String, value: V, ttl: Duration) {
        self.entries.insert(key, (value, Instant::now() + ttl));
    }

    fn get(&self, key: &str) -> Option<V> {
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.value().1 > Instant::now())
            .map(|entry| entry.value().0.clone());
        if hit.is_none() {
            self.entries.remove(key);
        }
        hit
    }

    /// Drop every entry whose deadline has already passed.
    fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

/// Sticky-routing state store (C7).
///
/// Only `previousResponseID → accountID` goes through [`Cache`], which
/// may be backed by a shared/distributed store in a multi-instance
/// deployment. Everything connection- or process-state-shaped lives in
/// an in-process [`TtlMap`] instead.
pub struct StickyStateStore<C: Cache> {
    cache: Arc<C>,
    response_ttl: Duration,
    session_ttl: Duration,
    response_conn: TtlMap<Uuid>,
    session_conn: TtlMap<Uuid>,
    turn_state: TtlMap<String>,
    last_failure: TtlMap<FallbackReason>,
}

impl<C: Cache> StickyStateStore<C> {
    /// Build a store over `cache`, with separate TTLs for response-id
    /// bindings (`response_sticky_ttl_seconds`) and session bindings
    /// (`sticky_session_ttl_seconds`).
    #[must_use]
    pub fn new(cache: Arc<C>, response_ttl: Duration, session_ttl: Duration) -> Self {
        Self {
            cache,
            response_ttl,
            session_ttl,
            response_conn: TtlMap::new(),
            session_conn: TtlMap::new(),
            turn_state: TtlMap::new(),
            last_failure: TtlMap::new(),
        }
    }

    /// Remember which account produced `response_id`, so a later
    /// `previous_response_id` reference can be routed to the same
    /// account even without a session key.
    pub async fn bind_response_account(&self, response_id: &str, account_id: &str) {
        self.cache
            .set(&format!("{RESPONSE_ACCOUNT_PREFIX}{response_id}"), account_id, self.response_ttl)
            .await;
    }

    /// Look up the account that produced `response_id`.
    pub async fn account_for_response(&self, response_id: &str) -> Option<String> {
        self.cache.get(&format!("{RESPONSE_ACCOUNT_PREFIX}{response_id}")).await
    }

    /// Remember which connection produced `response_id`. In-process
    /// only (§4.5).
    pub async fn bind_response_conn(&self, response_id: &str, conn_id: Uuid) {
        self.response_conn.insert(response_id.to_string(), conn_id, self.response_ttl);
    }

    /// Look up the connection that produced `response_id`.
    pub async fn conn_for_response(&self, response_id: &str) -> Option<Uuid> {
        self.response_conn.get(response_id)
    }

    /// Bind a session key to the connection currently serving it.
    /// In-process only (§4.5).
    pub async fn bind_session_conn(&self, session_key: &str, conn_id: Uuid) {
        self.session_conn.insert(session_key.to_string(), conn_id, self.session_ttl);
    }

    /// Look up the connection currently bound to a session key.
    pub async fn conn_for_session(&self, session_key: &str) -> Option<Uuid> {
        self.session_conn.get(session_key)
    }

    /// Record the upstream's latest turn-state token for a session, so
    /// it can be round-tripped on the next upgrade for the same
    /// session (§6, `x-codex-turn-state`). In-process only (§4.5).
    pub async fn bind_turn_state(&self, session_key: &str, turn_state: String) {
        self.turn_state.insert(session_key.to_string(), turn_state, self.session_ttl);
    }

    /// Fetch the last recorded turn-state token for a session.
    pub async fn turn_state_for_session(&self, session_key: &str) -> Option<String> {
        self.turn_state.get(session_key)
    }

    /// Record that `session_key`'s most recent attempt failed with
    /// `reason`, so the next attempt can force a fresh connection
    /// instead of reusing a stuck one (§4.7, "force new connection").
    /// In-process only, expiring after [`FORCE_NEW_CONNECTION_TTL`] so a
    /// stale failure doesn't force new connections forever.
    pub async fn record_failure(&self, session_key: &str, reason: FallbackReason) {
        self.last_failure.insert(session_key.to_string(), reason, FORCE_NEW_CONNECTION_TTL);
    }

    /// The most recently recorded failure reason for `session_key`, if
    /// still within its TTL.
    pub async fn last_failure(&self, session_key: &str) -> Option<FallbackReason> {
        self.last_failure.get(session_key)
    }

    /// Periodically sweep every in-process map for expired entries, so
    /// a session that never comes back doesn't linger until its next
    /// lookup happens to find it stale (§4.5, "background expiry").
    pub fn spawn_expiry_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()>
    where
        C: 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.response_conn.sweep_expired();
                self.session_conn.sweep_expired();
                self.turn_state.sweep_expired();
                self.last_failure.sweep_expired();
            }
        })
    }
}
