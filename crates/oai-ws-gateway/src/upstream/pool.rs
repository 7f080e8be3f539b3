//! C5: the top-level ingress context pool — `Acquire`/`Release` over
//! per-account [`AccountPool`]s, plus the background sweeper that
//! evicts idle contexts and pings live-but-idle ones (§4.2, §4.5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::external::Account;
use crate::health::PoolSnapshot;

use super::account_pool::AccountPool;
use super::context::{EnsureUpstreamError, OwnerOutcome, UpstreamContext};
use super::dialer::Dialer;
use super::error::{AcquireError, DialError};
use super::lease::{Lease, ScheduleLayer};
use super::sticky::{self, StickyLevel};

/// Caps how many times [`IngressContextPool::acquire`] will loop
/// before giving up, guarding against a pathological retry storm
/// (§4.2, "bounded 4096 retries").
const MAX_ACQUIRE_RETRIES: u32 = 4096;

/// Caps total wall-clock time spent retrying inside `acquire`,
/// independent of the iteration count.
const MAX_ACQUIRE_DURATION: Duration = Duration::from_secs(30 * 60);

/// Everything [`IngressContextPool::acquire`] needs for one request.
pub struct AcquireRequest<'a> {
    /// The account this request was scheduled onto.
    pub account: &'a dyn Account,
    /// Stable per-session key (conversation/session identity), used
    /// for exact-hit routing and as the migration-exclusion key.
    pub session_key: String,
    /// Opaque fingerprint recorded on the context for diagnostics.
    pub session_fingerprint: String,
    /// Identity of the request acquiring the context; must be unique
    /// per in-flight request so two concurrent requests never collide
    /// on the same owner id.
    pub owner_id: String,
    /// Upstream upgrade URL.
    pub url: String,
    /// Upstream upgrade headers.
    pub headers: HashMap<String, String>,
    /// Cancellation token tied to the inbound client connection.
    pub cancel: CancellationToken,
    /// Whether the request carries a `previous_response_id` (§4.3).
    pub has_previous_response_id: bool,
    /// Whether the client has `store` enabled for this request.
    pub store_enabled: bool,
    /// Zero-based turn number within the conversation.
    pub turn_number: u32,
    /// Account- or request-level override forcing strong stickiness.
    pub strict_affinity: bool,
}

/// RAII guard decrementing an [`AccountPool`]'s reference count on
/// drop, so every exit path out of [`IngressContextPool::acquire`]
/// (success, error, or early return) releases the ref it took on entry
/// (§3, "increment on Acquire entry, decrement on exit").
struct AccountRefGuard(Arc<AccountPool>);

impl Drop for AccountRefGuard {
    fn drop(&mut self) {
        self.0.dec_ref();
    }
}

/// C5: the ingress context pool.
pub struct IngressContextPool {
    accounts: DashMap<u64, Arc<AccountPool>>,
    dialer: Arc<dyn Dialer>,
    config: GatewayConfig,
    last_sweep: Mutex<Option<Instant>>,
    owner_sequence: AtomicU64,
}

impl IngressContextPool {
    /// Build a pool over `dialer` with the given configuration.
    #[must_use]
    pub fn new(dialer: Arc<dyn Dialer>, config: GatewayConfig) -> Self {
        Self {
            accounts: DashMap::new(),
            dialer,
            config,
            last_sweep: Mutex::new(None),
            owner_sequence: AtomicU64::new(0),
        }
    }

    /// Mint a process-unique owner id, for callers that don't already
    /// have a natural request id to use as the context owner.
    pub fn next_owner_id(&self) -> String {
        format!("req-{}", self.owner_sequence.fetch_add(1, Ordering::Relaxed))
    }

    fn account_pool(&self, account: &dyn Account) -> Arc<AccountPool> {
        self.accounts
            .entry(account.id())
            .or_insert_with(|| {
                let hard_cap = self.config.hard_cap(account.concurrency());
                Arc::new(AccountPool::new(account.id().to_string(), hard_cap))
            })
            .clone()
    }

    /// Acquire a [`Lease`] for one request (§4.2, `Acquire`).
    ///
    /// Tries, in order: an exact hit on `session_key`, a freshly
    /// allocated context if the account has spare capacity, and
    /// finally a migration candidate. Returns [`AcquireError::QueueFull`]
    /// if none of those succeed.
    ///
    /// # Errors
    ///
    /// See [`AcquireError`].
    pub async fn acquire(&self, request: AcquireRequest<'_>) -> Result<Lease, AcquireError> {
        if request.url.is_empty() {
            return Err(AcquireError::Misconfigured("empty upstream url"));
        }

        let stickiness = sticky::resolve_level(
            request.has_previous_response_id,
            request.store_enabled,
            request.turn_number,
            request.strict_affinity,
        );

        let account_pool = self.account_pool(request.account);
        account_pool.inc_ref();
        let _ref_guard = AccountRefGuard(account_pool.clone());
        let deadline = Instant::now() + MAX_ACQUIRE_DURATION;
        let queue_wait_start = Instant::now();

        for _ in 0..MAX_ACQUIRE_RETRIES {
            if Instant::now() >= deadline {
                return Err(AcquireError::Busy);
            }
            if request.cancel.is_cancelled() {
                return Err(AcquireError::Cancelled);
            }

            if let Some(ctx) = account_pool.find_by_session_key(&request.session_key) {
                let snapshot = ctx.scoring_snapshot();
                let now = Instant::now();
                let adjusted = sticky::adjust_for_context(
                    stickiness,
                    snapshot.broken,
                    snapshot.failure_streak,
                    snapshot.last_failure_at.map(|at| now.saturating_duration_since(at)),
                    now.saturating_duration_since(snapshot.last_used_at),
                );
                match ctx.try_acquire_owner(&request.owner_id) {
                    OwnerOutcome::Assigned | OwnerOutcome::AlreadyOwner => {
                        return self
                            .finish_acquire(ctx, &request, ScheduleLayer::L0Exact, adjusted, false, queue_wait_start)
                            .await;
                    }
                    OwnerOutcome::Busy => {
                        if !ctx.wait_for_release(&request.cancel).await {
                            return Err(AcquireError::Cancelled);
                        }
                        continue;
                    }
                }
            }

            if !account_pool.is_full() {
                let ctx = account_pool.insert_new(
                    request.session_key.clone(),
                    request.session_fingerprint.clone(),
                    self.config.sticky_session_ttl(),
                );
                // Freshly inserted: nobody else can know its id yet.
                debug_assert_eq!(ctx.try_acquire_owner(&request.owner_id), OwnerOutcome::Assigned);
                return self
                    .finish_acquire(ctx, &request, ScheduleLayer::L1NewContext, stickiness, false, queue_wait_start)
                    .await;
            }

            if let Some(min_score) = sticky::migration_score_threshold(stickiness) {
                if let Some(candidate) = account_pool.find_migration_candidate(&request.session_key, min_score, None) {
                    match candidate.try_acquire_owner(&request.owner_id) {
                        OwnerOutcome::Assigned => {
                            let old_session_key = candidate.session_key();
                            candidate
                                .migrate_to(
                                    request.session_key.clone(),
                                    request.session_fingerprint.clone(),
                                    request.owner_id.clone(),
                                )
                                .await;
                            account_pool.rebind_session_key(&candidate, &old_session_key, request.session_key.clone());
                            return self
                                .finish_acquire(candidate, &request, ScheduleLayer::L2Migration, stickiness, true, queue_wait_start)
                                .await;
                        }
                        _ => continue,
                    }
                }
            }

            return Err(AcquireError::QueueFull);
        }

        Err(AcquireError::Busy)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_acquire(
        &self,
        ctx: Arc<UpstreamContext>,
        request: &AcquireRequest<'_>,
        schedule_layer: ScheduleLayer,
        stickiness: StickyLevel,
        migration_used: bool,
        queue_wait_start: Instant,
    ) -> Result<Lease, AcquireError> {
        let queue_wait = queue_wait_start.elapsed();
        let conn_pick_start = Instant::now();
        let result = ctx
            .ensure_upstream(
                self.dialer.as_ref(),
                &request.url,
                &request.headers,
                self.config.dial_timeout(),
                self.config.upstream_conn_max_age(),
                self.config.sticky_session_ttl(),
                &request.cancel,
            )
            .await;
        let conn_pick = conn_pick_start.elapsed();

        match result {
            Ok(reused) => {
                let Some(conn_id) = ctx.conn_id() else {
                    ctx.release(&request.owner_id, true, self.config.sticky_session_ttl()).await;
                    return Err(AcquireError::Dial(DialError::Timeout));
                };
                Ok(Lease::new(
                    ctx,
                    request.owner_id.clone(),
                    conn_id,
                    self.config.sticky_session_ttl(),
                    self.config.read_timeout(),
                    self.config.write_timeout(),
                    self.config.delayed_ping_delay(),
                    self.config.ping_timeout(),
                    super::lease::LeaseMetadata {
                        queue_wait,
                        conn_pick,
                        reused,
                        schedule_layer,
                        stickiness,
                        migration_used,
                    },
                ))
            }
            Err(EnsureUpstreamError::Dial(err)) => {
                ctx.release(&request.owner_id, true, self.config.sticky_session_ttl()).await;
                Err(AcquireError::Dial(err))
            }
            Err(EnsureUpstreamError::Cancelled) => {
                ctx.release(&request.owner_id, false, self.config.sticky_session_ttl()).await;
                Err(AcquireError::Cancelled)
            }
        }
    }

    /// Spawn the background sweeper as its own task, ticking every
    /// `sweeper_interval_seconds`.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.sweeper_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    /// Run one sweep pass (§4.2, "Background sweeper"): evict
    /// idle-expired contexts (closing their upstreams outside the
    /// context lock), proactively close upstreams that have aged past
    /// the rotation limit while idle, probe the remaining idle-but-live
    /// ones with a bounded-concurrency ping, and finally drop any
    /// account pool left empty with no in-flight acquirers.
    pub async fn sweep_once(&self) {
        let semaphore = Arc::new(Semaphore::new(self.config.sweeper_ping_concurrency.max(1)));
        let ping_timeout = self.config.ping_timeout();
        let max_age = self.config.upstream_conn_max_age();
        let mut handles = Vec::new();
        let mut empty_accounts = Vec::new();

        for entry in self.accounts.iter() {
            let account_id = *entry.key();
            let account_pool = entry.value().clone();
            let now = Instant::now();
            for ctx in account_pool.all_contexts() {
                if ctx.is_expired(now) {
                    if let Some(removed) = account_pool.remove(ctx.id) {
                        removed.cancel_pending_ping();
                        removed.close_upstream().await;
                    }
                    tracing::debug!(context_id = %ctx.id, account_id, "sweeper evicted idle-expired context");
                    continue;
                }
                if !ctx.is_idle() || ctx.is_broken() {
                    continue;
                }
                if let Some(max_age) = max_age {
                    ctx.close_aged_upstream(now, max_age).await;
                }
                let Some(conn) = ctx.upstream_conn() else {
                    continue;
                };
                // Snapshot the generation before probing: a failure can
                // only mark the context broken if nobody has rebuilt its
                // connection in the meantime (§4.2).
                let Some(probed_conn_id) = ctx.conn_id() else {
                    continue;
                };
                let semaphore = semaphore.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    if tokio::time::timeout(ping_timeout, conn.ping()).await.is_err() {
                        ctx.mark_broken_if_conn_match(probed_conn_id).await;
                    }
                }));
            }
            account_pool.shrink_to_fit();
            if account_pool.is_empty() && account_pool.ref_count() == 0 {
                empty_accounts.push(account_id);
            }
        }

        for handle in handles {
            let _ = handle.await;
        }

        // Removed only after the iterator above is fully drained, so we
        // never call `remove` on the same shard we're still iterating.
        for account_id in empty_accounts {
            self.accounts.remove(&account_id);
            tracing::debug!(account_id, "sweeper removed empty, unreferenced account pool");
        }

        *self.last_sweep.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Instant::now());
    }

    /// Snapshot pool-wide counters for [`crate::health::evaluate_pool_health`].
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let mut context_count = 0usize;
        let mut broken_count = 0usize;
        for entry in self.accounts.iter() {
            for ctx in entry.value().all_contexts() {
                context_count += 1;
                if ctx.is_broken() {
                    broken_count += 1;
                }
            }
        }
        let seconds_since_last_sweep = self
            .last_sweep
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .map(|t| t.elapsed().as_secs());
        PoolSnapshot {
            account_count: self.accounts.len(),
            context_count,
            broken_count,
            seconds_since_last_sweep,
            sweeper_interval_seconds: self.config.sweeper_interval_seconds,
        }
    }

    /// Find the connection id currently bound to `session_key` within
    /// `account`'s pool, used by the forwarder to check a sticky hit
    /// before calling `acquire` (§4.6).
    #[must_use]
    pub fn conn_id_for_session(&self, account: &dyn Account, session_key: &str) -> Option<Uuid> {
        self.account_pool(account).find_by_session_key(session_key)?.conn_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{AccountKind, AccountWsMode};
    use crate::upstream::dialer::{DialRequest, DialedConn};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    #[derive(Debug)]
    struct TestAccount {
        id: u64,
        concurrency: u32,
    }

    impl Account for TestAccount {
        fn id(&self) -> u64 {
            self.id
        }
        fn kind(&self) -> AccountKind {
            AccountKind::ApiKey
        }
        fn concurrency(&self) -> u32 {
            self.concurrency
        }
        fn proxy_url(&self) -> Option<&str> {
            None
        }
        fn is_openai(&self) -> bool {
            true
        }
        fn is_model_supported(&self, _model: &str) -> bool {
            true
        }
        fn chatgpt_account_id(&self) -> Option<String> {
            None
        }
        fn openai_user_agent(&self) -> Option<String> {
            None
        }
        fn openai_base_url(&self) -> String {
            "https://example.test".into()
        }
        fn allow_store_recovery(&self) -> bool {
            false
        }
        fn ws_mode(&self) -> AccountWsMode {
            AccountWsMode::Auto
        }
    }

    struct LoopbackDialer {
        dial_count: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for LoopbackDialer {
        async fn dial(&self, _request: &DialRequest) -> Result<DialedConn, DialError> {
            self.dial_count.fetch_add(1, Ordering::SeqCst);
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                if let Ok((stream, _)) = listener.accept().await {
                    let _ = tokio_tungstenite::accept_async(stream).await;
                }
            });
            let url = format!("ws://{addr}/");
            let (stream, response) = tokio_tungstenite::connect_async(url).await.map_err(DialError::from)?;
            let handshake_headers = response
                .headers()
                .iter()
                .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.as_str().to_string(), v.to_string())))
                .collect();
            Ok(DialedConn {
                conn: Arc::new(super::super::connection::UpstreamConn::new(stream)),
                handshake_headers,
            })
        }
    }

    fn request(account: &TestAccount, session_key: &str, owner_id: &str) -> AcquireRequest<'_> {
        AcquireRequest {
            account,
            session_key: session_key.into(),
            session_fingerprint: "fp".into(),
            owner_id: owner_id.into(),
            url: "placeholder".into(),
            headers: HashMap::new(),
            cancel: CancellationToken::new(),
            has_previous_response_id: false,
            store_enabled: false,
            turn_number: 0,
            strict_affinity: false,
        }
    }

    #[tokio::test]
    async fn exact_session_hit_reuses_the_same_context() {
        let dialer = Arc::new(LoopbackDialer { dial_count: AtomicUsize::new(0) });
        let pool = IngressContextPool::new(dialer.clone(), GatewayConfig::default());
        let account = TestAccount { id: 1, concurrency: 4 };

        let lease_a = pool.acquire(request(&account, "sess-1", "owner-a")).await.unwrap();
        let ctx_id = lease_a.context_id();
        lease_a.release().await;

        let lease_b = pool.acquire(request(&account, "sess-1", "owner-b")).await.unwrap();
        assert_eq!(lease_b.context_id(), ctx_id);
        assert_eq!(dialer.dial_count.load(Ordering::SeqCst), 1, "second acquire should reuse the dialed connection");
    }

    #[tokio::test]
    async fn queue_full_when_capacity_exhausted_and_no_migration_candidate() {
        let dialer = Arc::new(LoopbackDialer { dial_count: AtomicUsize::new(0) });
        let mut config = GatewayConfig::default();
        config.max_conns_per_account = 1;
        let pool = IngressContextPool::new(dialer, config);
        let account = TestAccount { id: 2, concurrency: 4 };

        let _lease = pool.acquire(request(&account, "sess-1", "owner-a")).await.unwrap();
        let err = pool.acquire(request(&account, "sess-2", "owner-b")).await.unwrap_err();
        assert!(matches!(err, AcquireError::QueueFull));
    }

    #[tokio::test]
    async fn different_sessions_get_different_contexts_within_capacity() {
        let dialer = Arc::new(LoopbackDialer { dial_count: AtomicUsize::new(0) });
        let pool = IngressContextPool::new(dialer, GatewayConfig::default());
        let account = TestAccount { id: 3, concurrency: 4 };

        let lease_a = pool.acquire(request(&account, "sess-1", "owner-a")).await.unwrap();
        let lease_b = pool.acquire(request(&account, "sess-2", "owner-b")).await.unwrap();
        assert_ne!(lease_a.context_id(), lease_b.context_id());
    }

    // Boundary (§8): account.Concurrency == 0 admits no context at all.
    #[tokio::test]
    async fn zero_concurrency_account_is_immediately_queue_full() {
        let dialer = Arc::new(LoopbackDialer { dial_count: AtomicUsize::new(0) });
        let pool = IngressContextPool::new(dialer.clone(), GatewayConfig::default());
        let account = TestAccount { id: 5, concurrency: 0 };

        let err = pool.acquire(request(&account, "sess-1", "owner-a")).await.unwrap_err();
        assert!(matches!(err, AcquireError::QueueFull));
        assert_eq!(dialer.dial_count.load(Ordering::SeqCst), 0, "a zero-capacity account should never dial");
    }

    #[tokio::test]
    async fn empty_url_is_misconfigured() {
        let dialer = Arc::new(LoopbackDialer { dial_count: AtomicUsize::new(0) });
        let pool = IngressContextPool::new(dialer, GatewayConfig::default());
        let account = TestAccount { id: 4, concurrency: 4 };
        let mut req = request(&account, "sess-1", "owner-a");
        req.url = String::new();
        let err = pool.acquire(req).await.unwrap_err();
        assert!(matches!(err, AcquireError::Misconfigured(_)));
    }

    // Seed scenario 1 (§8): concurrency 1, two distinct sessions.
    #[tokio::test]
    async fn seed_scenario_two_sessions_at_capacity_one_migrates() {
        let dialer = Arc::new(LoopbackDialer { dial_count: AtomicUsize::new(0) });
        let mut config = GatewayConfig::default();
        config.max_conns_per_account = 1;
        let pool = IngressContextPool::new(dialer.clone(), config);
        let account = TestAccount { id: 10, concurrency: 4 };

        let lease_a = pool.acquire(request(&account, "sess-a", "owner-a")).await.unwrap();
        lease_a.release().await;

        let lease_b = pool.acquire(request(&account, "sess-b", "owner-b")).await.unwrap();
        assert_eq!(lease_b.schedule_layer(), ScheduleLayer::L2Migration);
        assert_eq!(lease_b.stickiness(), StickyLevel::Weak);
        assert!(lease_b.migration_used());
        assert_eq!(dialer.dial_count.load(Ordering::SeqCst), 2, "migration redials since migrate_to drops the stale conn");
    }

    // Seed scenario 2 (§8): identical session hash across two accounts.
    #[tokio::test]
    async fn seed_scenario_identical_session_hash_does_not_cross_accounts() {
        let dialer = Arc::new(LoopbackDialer { dial_count: AtomicUsize::new(0) });
        let mut config = GatewayConfig::default();
        config.max_conns_per_account = 1;
        let pool = IngressContextPool::new(dialer.clone(), config);
        let account_a = TestAccount { id: 20, concurrency: 4 };
        let account_b = TestAccount { id: 21, concurrency: 4 };

        let lease_a = pool.acquire(request(&account_a, "h", "owner-a")).await.unwrap();
        lease_a.release().await;
        let lease_b = pool.acquire(request(&account_b, "h", "owner-b")).await.unwrap();

        assert_ne!(lease_a.context_id(), lease_b.context_id());
        assert_eq!(dialer.dial_count.load(Ordering::SeqCst), 2);
    }

    // Seed scenario 3 (§8): strong stickiness never migrates, even at capacity.
    #[tokio::test]
    async fn seed_scenario_strong_stickiness_blocks_migration() {
        let dialer = Arc::new(LoopbackDialer { dial_count: AtomicUsize::new(0) });
        let mut config = GatewayConfig::default();
        config.max_conns_per_account = 1;
        let pool = IngressContextPool::new(dialer.clone(), config);
        let account = TestAccount { id: 30, concurrency: 4 };

        let mut req_a = request(&account, "sess-a", "owner-a");
        req_a.has_previous_response_id = true;
        req_a.store_enabled = true;
        let lease_a = pool.acquire(req_a).await.unwrap();
        lease_a.release().await;

        let mut req_b = request(&account, "sess-b", "owner-b");
        req_b.has_previous_response_id = true;
        req_b.store_enabled = true;
        let err = pool.acquire(req_b).await.unwrap_err();

        assert!(matches!(err, AcquireError::QueueFull));
        assert_eq!(dialer.dial_count.load(Ordering::SeqCst), 1);
    }

    // Seed scenario 4 (§8): a broken exact-hit context downgrades stickiness
    // one step and redials instead of reusing the dead conn.
    #[tokio::test]
    async fn seed_scenario_broken_context_downgrades_and_redials() {
        let dialer = Arc::new(LoopbackDialer { dial_count: AtomicUsize::new(0) });
        let pool = IngressContextPool::new(dialer.clone(), GatewayConfig::default());
        let account = TestAccount { id: 40, concurrency: 4 };

        let lease_a = pool.acquire(request(&account, "sess-a", "owner-a")).await.unwrap();
        lease_a.mark_broken().await;
        lease_a.release().await;

        let mut req_a2 = request(&account, "sess-a", "owner-a2");
        req_a2.has_previous_response_id = true;
        req_a2.store_enabled = true;
        let lease_a2 = pool.acquire(req_a2).await.unwrap();

        assert_eq!(lease_a2.schedule_layer(), ScheduleLayer::L0Exact);
        assert_eq!(lease_a2.stickiness(), StickyLevel::Balanced);
        assert_eq!(dialer.dial_count.load(Ordering::SeqCst), 2, "the broken conn must not be reused");
    }

    // Seed scenario 5 (§8): the sweeper's ping probe finds a dead idle conn,
    // marks the context broken, and the next acquire for that session rebuilds it.
    #[tokio::test]
    async fn seed_scenario_sweeper_detects_dead_conn_and_next_acquire_rebuilds() {
        struct DropOnAcceptDialer {
            dial_count: AtomicUsize,
        }

        #[async_trait]
        impl Dialer for DropOnAcceptDialer {
            async fn dial(&self, _request: &DialRequest) -> Result<DialedConn, DialError> {
                self.dial_count.fetch_add(1, Ordering::SeqCst);
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                tokio::spawn(async move {
                    if let Ok((stream, _)) = listener.accept().await {
                        let _ = stream.set_linger(Some(Duration::ZERO));
                        if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                            drop(ws);
                        }
                    }
                });
                let url = format!("ws://{addr}/");
                let (stream, _) = tokio_tungstenite::connect_async(url).await.map_err(DialError::from)?;
                Ok(DialedConn {
                    conn: Arc::new(super::super::connection::UpstreamConn::new(stream)),
                    handshake_headers: HashMap::new(),
                })
            }
        }

        let dialer = Arc::new(DropOnAcceptDialer { dial_count: AtomicUsize::new(0) });
        let mut config = GatewayConfig::default();
        config.ping_timeout_seconds = 1;
        let pool = IngressContextPool::new(dialer.clone(), config);
        let account = TestAccount { id: 50, concurrency: 4 };

        let lease = pool.acquire(request(&account, "sess-a", "owner-a")).await.unwrap();
        lease.release().await;
        // Give the server task time to close its end before probing it.
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.sweep_once().await;

        let lease2 = pool.acquire(request(&account, "sess-a", "owner-a2")).await.unwrap();
        assert_eq!(lease2.context_id(), lease.context_id(), "same slot, rebuilt upstream");
        assert_eq!(dialer.dial_count.load(Ordering::SeqCst), 2, "the sweeper's dead-conn finding forced a redial");
    }

    #[tokio::test]
    async fn sweep_evicts_expired_context_and_closes_its_upstream() {
        let dialer = Arc::new(LoopbackDialer { dial_count: AtomicUsize::new(0) });
        let mut config = GatewayConfig::default();
        config.sticky_session_ttl_seconds = 0;
        let pool = IngressContextPool::new(dialer, config);
        let account = TestAccount { id: 60, concurrency: 4 };

        let lease = pool.acquire(request(&account, "sess-a", "owner-a")).await.unwrap();
        lease.release().await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.sweep_once().await;

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.context_count, 0, "the expired context must be evicted");
    }

    #[tokio::test]
    async fn sweep_removes_empty_account_pool_once_unreferenced() {
        let dialer = Arc::new(LoopbackDialer { dial_count: AtomicUsize::new(0) });
        let mut config = GatewayConfig::default();
        config.sticky_session_ttl_seconds = 0;
        let pool = IngressContextPool::new(dialer, config);
        let account = TestAccount { id: 61, concurrency: 4 };

        let lease = pool.acquire(request(&account, "sess-a", "owner-a")).await.unwrap();
        assert_eq!(pool.snapshot().account_count, 1);
        lease.release().await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.sweep_once().await;

        assert_eq!(pool.snapshot().account_count, 0, "an empty, unreferenced account pool must be dropped");
    }
}
