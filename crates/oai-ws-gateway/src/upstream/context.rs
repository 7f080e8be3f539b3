//! C3: one upstream context — a reusable slot that holds at most one
//! live [`UpstreamConn`] at a time, plus the bookkeeping needed to
//! decide whether it can be reused, migrated, or must be redialed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::connection::UpstreamConn;
use super::dialer::{DialRequest, Dialer};
use super::error::DialError;

/// Minimum spacing between `maybe_touch_lease` writes, to keep a busy
/// pump from hammering the context's mutex on every forwarded event.
const TOUCH_LEASE_MIN_INTERVAL: Duration = Duration::from_secs(1);

struct ContextInner {
    owner_id: Option<String>,
    dialing: bool,
    dial_complete: Option<Arc<Notify>>,
    broken: bool,
    failure_streak: u32,
    last_failure_at: Option<Instant>,
    migration_count: u32,
    last_migration_at: Option<Instant>,
    upstream: Option<Arc<UpstreamConn>>,
    conn_id: Option<Uuid>,
    created_at: Option<Instant>,
    last_used_at: Instant,
    expires_at: Instant,
    handshake_headers: HashMap<String, String>,
    prewarmed: bool,
    session_fingerprint: String,
    session_key: String,
    pending_ping: Option<JoinHandle<()>>,
}

/// Outcome of [`UpstreamContext::try_acquire_owner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerOutcome {
    /// The context was idle; the caller now owns it.
    Assigned,
    /// The caller already owned this context (idempotent re-acquire).
    AlreadyOwner,
    /// Another owner holds this context.
    Busy,
}

/// Failure from [`UpstreamContext::ensure_upstream`], distinguishing a
/// dial failure from cancellation while waiting on another dialer.
#[derive(Debug, thiserror::Error)]
pub enum EnsureUpstreamError {
    /// Dialing the upstream failed.
    #[error(transparent)]
    Dial(#[from] DialError),
    /// The caller's cancellation token fired while waiting for another
    /// in-flight dial on this context to finish.
    #[error("cancelled while waiting for an in-flight dial")]
    Cancelled,
}

/// Read-only snapshot of the fields migration scoring needs (§4.2.c),
/// taken under the lock and then used without it.
#[derive(Debug, Clone, Copy)]
pub struct ScoringSnapshot {
    /// Whether the context is idle (no current owner).
    pub idle: bool,
    /// Whether the context currently holds a live, non-broken upstream.
    pub has_upstream: bool,
    /// Whether the context is marked broken.
    pub broken: bool,
    /// Consecutive dial/IO failures observed.
    pub failure_streak: u32,
    /// When the context was last marked as failed.
    pub last_failure_at: Option<Instant>,
    /// How many times this context has been migrated to a new session.
    pub migration_count: u32,
    /// When the context was last migrated.
    pub last_migration_at: Option<Instant>,
    /// When the context was last touched by a live lease.
    pub last_used_at: Instant,
}

/// C3: one reusable upstream slot.
pub struct UpstreamContext {
    /// Stable identity for logs and migration bookkeeping.
    pub id: Uuid,
    inner: Mutex<ContextInner>,
    release_notify: Notify,
}

impl UpstreamContext {
    /// Create a new, idle context bound to `session_key`.
    #[must_use]
    pub fn new(session_key: String, session_fingerprint: String, idle_ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            inner: Mutex::new(ContextInner {
                owner_id: None,
                dialing: false,
                dial_complete: None,
                broken: false,
                failure_streak: 0,
                last_failure_at: None,
                migration_count: 0,
                last_migration_at: None,
                upstream: None,
                conn_id: None,
                created_at: None,
                last_used_at: now,
                expires_at: now + idle_ttl,
                handshake_headers: HashMap::new(),
                prewarmed: false,
                session_fingerprint,
                session_key,
                pending_ping: None,
            }),
            release_notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContextInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// This context's current session key.
    #[must_use]
    pub fn session_key(&self) -> String {
        self.lock().session_key.clone()
    }

    /// This context's current session fingerprint.
    #[must_use]
    pub fn session_fingerprint(&self) -> String {
        self.lock().session_fingerprint.clone()
    }

    /// Whether the context is currently unowned.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.lock().owner_id.is_none()
    }

    /// Whether an idle context's idle-eviction deadline has passed.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        let inner = self.lock();
        inner.owner_id.is_none() && now >= inner.expires_at
    }

    /// Whether the context is marked broken.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.lock().broken
    }

    /// Connection id of the current upstream, if any.
    #[must_use]
    pub fn conn_id(&self) -> Option<Uuid> {
        self.lock().conn_id
    }

    /// Clone of the current upstream handle, if one is live.
    #[must_use]
    pub fn upstream_conn(&self) -> Option<Arc<UpstreamConn>> {
        self.lock().upstream.clone()
    }

    /// Whether `owner_id` is the current owner.
    #[must_use]
    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.lock().owner_id.as_deref() == Some(owner_id)
    }

    /// Age of the current upstream connection, or `Duration::ZERO` if
    /// none is live.
    #[must_use]
    pub fn upstream_age(&self, now: Instant) -> Duration {
        self.lock()
            .created_at
            .map_or(Duration::ZERO, |created| now.saturating_duration_since(created))
    }

    /// Take ownership of an idle context, or report that it is already
    /// owned.
    #[must_use]
    pub fn try_acquire_owner(&self, owner_id: &str) -> OwnerOutcome {
        let mut inner = self.lock();
        match inner.owner_id.clone() {
            None => {
                inner.owner_id = Some(owner_id.to_string());
                OwnerOutcome::Assigned
            }
            Some(existing) if existing == owner_id => OwnerOutcome::AlreadyOwner,
            Some(_) => OwnerOutcome::Busy,
        }
    }

    /// Wait for the current owner to release this context, or for
    /// `cancel` to fire. Returns `true` if woken by a release.
    pub async fn wait_for_release(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = self.release_notify.notified() => true,
            () = cancel.cancelled() => false,
        }
    }

    /// Unconditionally refresh `last_used_at`/`expires_at`. Used right
    /// after a successful dial or an explicit touch.
    pub fn touch_lease(&self, idle_ttl: Duration) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.last_used_at = now;
        inner.expires_at = now + idle_ttl;
    }

    /// Refresh `last_used_at`/`expires_at` only if more than
    /// [`TOUCH_LEASE_MIN_INTERVAL`] has passed since the last touch,
    /// so a streaming pump forwarding many events per second doesn't
    /// contend on this context's mutex on every single one.
    pub fn maybe_touch_lease(&self, idle_ttl: Duration) {
        let mut inner = self.lock();
        let now = Instant::now();
        if now.saturating_duration_since(inner.last_used_at) < TOUCH_LEASE_MIN_INTERVAL {
            return;
        }
        inner.last_used_at = now;
        inner.expires_at = now + idle_ttl;
    }

    /// Snapshot the fields migration scoring needs.
    #[must_use]
    pub fn scoring_snapshot(&self) -> ScoringSnapshot {
        let inner = self.lock();
        ScoringSnapshot {
            idle: inner.owner_id.is_none(),
            has_upstream: inner.upstream.is_some() && !inner.broken,
            broken: inner.broken,
            failure_streak: inner.failure_streak,
            last_failure_at: inner.last_failure_at,
            migration_count: inner.migration_count,
            last_migration_at: inner.last_migration_at,
            last_used_at: inner.last_used_at,
        }
    }

    /// Ensure this context has a live, non-broken upstream connection,
    /// dialing one if needed and coalescing concurrent callers onto a
    /// single in-flight dial (§4.2, `ensureContextUpstream`).
    ///
    /// Returns `Ok(true)` if an existing connection was reused,
    /// `Ok(false)` if a new one was dialed.
    ///
    /// # Errors
    ///
    /// Returns [`EnsureUpstreamError::Dial`] if dialing fails, or
    /// [`EnsureUpstreamError::Cancelled`] if `cancel` fires while
    /// waiting on another caller's in-flight dial.
    pub async fn ensure_upstream(
        &self,
        dialer: &(dyn Dialer),
        url: &str,
        headers: &HashMap<String, String>,
        dial_timeout: Duration,
        max_age: Option<Duration>,
        idle_ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, EnsureUpstreamError> {
        enum Step {
            Reused,
            WaitDial(Arc<Notify>),
            Dial,
        }

        loop {
            let (step, stale) = {
                let mut inner = self.lock();
                if inner.upstream.is_some() && !inner.broken {
                    let expired = max_age.is_some_and(|max_age| {
                        inner
                            .created_at
                            .map(|created| Instant::now().saturating_duration_since(created) >= max_age)
                            .unwrap_or(false)
                    });
                    if expired {
                        let stale = inner.upstream.take();
                        inner.conn_id = None;
                        inner.created_at = None;
                        (Step::Dial, stale)
                    } else {
                        let now = Instant::now();
                        inner.last_used_at = now;
                        inner.expires_at = now + idle_ttl;
                        (Step::Reused, None)
                    }
                } else if inner.dialing {
                    let notify = inner.dial_complete.get_or_insert_with(|| Arc::new(Notify::new())).clone();
                    (Step::WaitDial(notify), None)
                } else {
                    inner.upstream = None;
                    inner.dialing = true;
                    inner.dial_complete = Some(Arc::new(Notify::new()));
                    (Step::Dial, None)
                }
            };

            if let Some(stale) = stale {
                stale.close().await;
            }

            match step {
                Step::Reused => return Ok(true),
                Step::WaitDial(notify) => {
                    tokio::select! {
                        () = notify.notified() => continue,
                        () = cancel.cancelled() => return Err(EnsureUpstreamError::Cancelled),
                    }
                }
                Step::Dial => {
                    let request = DialRequest {
                        url: url.to_string(),
                        headers: headers.clone(),
                        proxy_url: None,
                        timeout: dial_timeout,
                    };
                    let result = dialer.dial(&request).await;
                    let mut inner = self.lock();
                    let waiters = inner.dial_complete.take();
                    inner.dialing = false;
                    match result {
                        Ok(dialed) => {
                            inner.upstream = Some(dialed.conn);
                            inner.conn_id = Some(Uuid::new_v4());
                            inner.created_at = Some(Instant::now());
                            inner.handshake_headers = dialed.handshake_headers;
                            inner.broken = false;
                            inner.failure_streak = 0;
                            inner.last_failure_at = None;
                            let now = Instant::now();
                            inner.last_used_at = now;
                            inner.expires_at = now + idle_ttl;
                            drop(inner);
                            if let Some(waiters) = waiters {
                                waiters.notify_waiters();
                            }
                            return Ok(false);
                        }
                        Err(err) => {
                            inner.broken = true;
                            inner.failure_streak = inner.failure_streak.saturating_add(1);
                            inner.last_failure_at = Some(Instant::now());
                            drop(inner);
                            if let Some(waiters) = waiters {
                                waiters.notify_waiters();
                            }
                            return Err(err.into());
                        }
                    }
                }
            }
        }
    }

    /// Migrate this context to a new session: drop the current
    /// upstream (a different session must not inherit stale turn
    /// state) and rebind ownership, without releasing the slot back to
    /// the idle pool (§4.2.d).
    pub async fn migrate_to(&self, new_session_key: String, new_fingerprint: String, owner_id: String) {
        let old_session_key = self.lock().session_key.clone();
        let stale = {
            let mut inner = self.lock();
            let stale = inner.upstream.take();
            inner.conn_id = None;
            inner.created_at = None;
            inner.handshake_headers.clear();
            inner.prewarmed = false;
            inner.session_key = new_session_key.clone();
            inner.session_fingerprint = new_fingerprint;
            inner.owner_id = Some(owner_id);
            inner.migration_count = inner.migration_count.saturating_add(1);
            inner.last_migration_at = Some(Instant::now());
            inner.broken = false;
            inner.failure_streak = 0;
            stale
        };
        tracing::debug!(
            context_id = %self.id,
            from_session = %old_session_key,
            to_session = %new_session_key,
            "context migrated to a new session"
        );
        if let Some(conn) = stale {
            conn.close().await;
        }
    }

    /// Mark the context broken and drop its upstream, unconditionally.
    pub async fn mark_broken(&self) {
        let stale = {
            let mut inner = self.lock();
            let stale = inner.upstream.take();
            inner.conn_id = None;
            inner.broken = true;
            inner.failure_streak = inner.failure_streak.saturating_add(1);
            inner.last_failure_at = Some(Instant::now());
            stale
        };
        tracing::warn!(context_id = %self.id, "context marked broken");
        if let Some(conn) = stale {
            conn.close().await;
        }
    }

    /// Mark broken only if `expected` is still this context's current
    /// connection id and nobody else has already taken or redialed it
    /// (used by the pump on a read/write failure, §4.4).
    ///
    /// Returns `false` if the connection had already moved on, meaning
    /// this caller's failure is stale and should not mutate shared
    /// state.
    pub async fn mark_broken_if_conn_match(&self, expected: Uuid) -> bool {
        let stale = {
            let mut inner = self.lock();
            if inner.conn_id != Some(expected) {
                return false;
            }
            let stale = inner.upstream.take();
            inner.conn_id = None;
            inner.broken = true;
            inner.failure_streak = inner.failure_streak.saturating_add(1);
            inner.last_failure_at = Some(Instant::now());
            stale
        };
        tracing::warn!(context_id = %self.id, conn_id = %expected, "context marked broken by ping probe");
        if let Some(conn) = stale {
            conn.close().await;
        }
        true
    }

    /// Release ownership. If `close_upstream` is set, the current
    /// upstream is dropped and closed too (e.g. after `mark_broken` or
    /// an explicit drain-without-reuse); otherwise it is left in place
    /// for the next owner (§4.1, Release).
    ///
    /// Returns `false` if `owner_id` did not actually own this context
    /// (a stale or duplicate release).
    pub async fn release(&self, owner_id: &str, close_upstream: bool, idle_ttl: Duration) -> bool {
        let stale = {
            let mut inner = self.lock();
            if inner.owner_id.as_deref() != Some(owner_id) {
                return false;
            }
            let stale = if close_upstream {
                let stale = inner.upstream.take();
                inner.conn_id = None;
                inner.handshake_headers.clear();
                inner.prewarmed = false;
                stale
            } else {
                None
            };
            inner.owner_id = None;
            inner.broken = false;
            let now = Instant::now();
            inner.last_used_at = now;
            inner.expires_at = now + idle_ttl;
            stale
        };
        self.release_notify.notify_one();
        if let Some(conn) = stale {
            conn.close().await;
        }
        true
    }

    /// Take and close the current upstream unconditionally, regardless
    /// of owner or broken state. Used by the sweeper right before it
    /// drops an idle-expired context entirely, so the WS close
    /// handshake still runs instead of being skipped by `Drop` (§4.2,
    /// "evict expired-idle contexts (close their upstreams outside the
    /// lock)").
    pub async fn close_upstream(&self) {
        let stale = {
            let mut inner = self.lock();
            inner.conn_id = None;
            inner.upstream.take()
        };
        if let Some(conn) = stale {
            conn.close().await;
        }
    }

    /// Proactively close an idle context's upstream once it has
    /// exceeded `max_age`, keeping the slot itself so the next acquire
    /// simply redials instead of losing the session entirely (§4.2,
    /// sweeper "close aged-idle upstreams (keeping the slot)"; §5,
    /// staying ahead of the server's hard connection-age cap). A no-op
    /// if the context is owned, has no upstream, or hasn't aged out.
    pub async fn close_aged_upstream(&self, now: Instant, max_age: Duration) {
        let stale = {
            let mut inner = self.lock();
            let aged = inner.owner_id.is_none()
                && inner.upstream.is_some()
                && inner
                    .created_at
                    .is_some_and(|created| now.saturating_duration_since(created) >= max_age);
            if aged {
                let stale = inner.upstream.take();
                inner.conn_id = None;
                inner.created_at = None;
                inner.handshake_headers.clear();
                inner.prewarmed = false;
                stale
            } else {
                None
            }
        };
        if let Some(conn) = stale {
            conn.close().await;
        }
    }

    /// Schedule (or reset) the one-shot ping probe fired `delay` after
    /// a `Yield` (§4.2, "Delayed ping scheduling"). A pending probe
    /// already scheduled for this context is replaced rather than
    /// allowed to stack, matching the spec's per-context timer de-dup
    /// ("if a pending ping already exists, call its Reset; otherwise
    /// create a new timer").
    pub fn schedule_delayed_ping(self: &Arc<Self>, delay: Duration, ping_timeout: Duration) {
        let Some(conn_id) = self.conn_id() else {
            return;
        };
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire_delayed_ping(conn_id, ping_timeout).await;
        });
        let previous = self.lock().pending_ping.replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn fire_delayed_ping(&self, conn_id: Uuid, ping_timeout: Duration) {
        self.lock().pending_ping = None;
        if self.conn_id() != Some(conn_id) || !self.is_idle() {
            return;
        }
        let Some(conn) = self.upstream_conn() else {
            return;
        };
        if tokio::time::timeout(ping_timeout, conn.ping()).await.is_err() {
            self.mark_broken_if_conn_match(conn_id).await;
        }
    }

    /// Cancel any pending delayed ping probe, clearing the stored
    /// timer reference (§4.2, "On fire or pool stop, clear the stored
    /// timer reference").
    pub fn cancel_pending_ping(&self) {
        let previous = self.lock().pending_ping.take();
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Whether this context has ever completed a prewarm request.
    #[must_use]
    pub fn is_prewarmed(&self) -> bool {
        self.lock().prewarmed
    }

    /// Record that a prewarm request completed on the current upstream.
    pub fn mark_prewarmed(&self) {
        self.lock().prewarmed = true;
    }
}
