//! C6: an RAII handle to one leased [`UpstreamContext`]'s connection.
//!
//! Grounded on the pooled-connection-guard pattern used for database
//! pools in the wider corpus: the handle is the only thing allowed to
//! touch the underlying socket, `Release`/`Drop` guarantee the slot
//! comes back even if the caller forgets, and a release is idempotent
//! so double-release from a race never double-frees the slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use uuid::Uuid;

use super::connection::UpstreamConn;
use super::context::UpstreamContext;
use super::error::LeaseError;
use super::sticky::StickyLevel;

/// Which tier of the `Acquire` algorithm produced a lease (§4.2): an
/// exact hit on the caller's own session, a freshly dialed context, or
/// a migration that took over someone else's idle slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleLayer {
    /// Reused the context already bound to this session key.
    L0Exact,
    /// Allocated a brand new context.
    L1NewContext,
    /// Took over an idle context that belonged to a different session.
    L2Migration,
}

/// Scheduling metadata recorded alongside a [`Lease`] for diagnostics
/// and usage reporting, gathered by [`super::pool::IngressContextPool::acquire`].
#[derive(Debug, Clone, Copy)]
pub struct LeaseMetadata {
    /// Time spent waiting for a busy context or retrying the acquire
    /// loop before a context was found.
    pub queue_wait: Duration,
    /// Time spent inside `ensure_upstream` picking/dialing a
    /// connection once a context was found.
    pub conn_pick: Duration,
    /// Whether an existing connection was reused rather than redialed.
    pub reused: bool,
    /// Which tier of the acquire algorithm produced this lease.
    pub schedule_layer: ScheduleLayer,
    /// Stickiness level resolved for the request that produced this
    /// lease.
    pub stickiness: StickyLevel,
    /// Whether producing this lease required migrating a context away
    /// from another session.
    pub migration_used: bool,
}

/// A leased, owned reference to one context's live upstream
/// connection (C6).
pub struct Lease {
    ctx: Arc<UpstreamContext>,
    owner_id: String,
    conn_id: Uuid,
    idle_ttl: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    delayed_ping_delay: Duration,
    delayed_ping_timeout: Duration,
    released: AtomicBool,
    /// Cached pointer to the context's upstream connection (§3). A hit
    /// here lets every IO call skip the context's own lock entirely;
    /// only the first call after issuance, or the first call after
    /// [`Lease::mark_broken`] clears it, pays the cost of re-verifying
    /// ownership under [`UpstreamContext`]'s lock.
    cached_conn: RwLock<Option<Arc<UpstreamConn>>>,
    metadata: LeaseMetadata,
}

impl Lease {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: Arc<UpstreamContext>,
        owner_id: String,
        conn_id: Uuid,
        idle_ttl: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
        delayed_ping_delay: Duration,
        delayed_ping_timeout: Duration,
        metadata: LeaseMetadata,
    ) -> Self {
        Self {
            ctx,
            owner_id,
            conn_id,
            idle_ttl,
            read_timeout,
            write_timeout,
            delayed_ping_delay,
            delayed_ping_timeout,
            released: AtomicBool::new(false),
            cached_conn: RwLock::new(None),
            metadata,
        }
    }

    /// Id of the backing context.
    #[must_use]
    pub fn context_id(&self) -> Uuid {
        self.ctx.id
    }

    /// Time spent waiting before this lease's context was found.
    #[must_use]
    pub fn queue_wait(&self) -> Duration {
        self.metadata.queue_wait
    }

    /// Time spent picking/dialing the connection once a context was
    /// found.
    #[must_use]
    pub fn conn_pick(&self) -> Duration {
        self.metadata.conn_pick
    }

    /// Whether an existing connection was reused rather than redialed.
    #[must_use]
    pub fn reused(&self) -> bool {
        self.metadata.reused
    }

    /// Which tier of the acquire algorithm produced this lease.
    #[must_use]
    pub fn schedule_layer(&self) -> ScheduleLayer {
        self.metadata.schedule_layer
    }

    /// Stickiness level resolved for the request that produced this
    /// lease.
    #[must_use]
    pub fn stickiness(&self) -> StickyLevel {
        self.metadata.stickiness
    }

    /// Whether producing this lease required migrating a context away
    /// from another session.
    #[must_use]
    pub fn migration_used(&self) -> bool {
        self.metadata.migration_used
    }

    /// Id of the connection this lease was issued against. If the
    /// context has since been redialed or migrated, this will no
    /// longer match the context's current `conn_id` and IO calls will
    /// fail with [`LeaseError::Broken`] rather than silently operating
    /// on the wrong socket.
    #[must_use]
    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    fn active_conn(&self) -> Result<Arc<UpstreamConn>, LeaseError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(LeaseError::Closed);
        }

        // Fast path: a cache hit never touches the context's own lock.
        if let Some(conn) = self.cached_conn.read().expect("lease cache lock poisoned").as_ref() {
            return Ok(conn.clone());
        }

        // Slow path: verify ownership under the context lock, then cache.
        if self.ctx.is_broken() {
            return Err(LeaseError::Broken);
        }
        match self.ctx.upstream_conn() {
            Some(conn) if self.ctx.conn_id() == Some(self.conn_id) => {
                *self.cached_conn.write().expect("lease cache lock poisoned") = Some(conn.clone());
                Ok(conn)
            }
            _ => Err(LeaseError::Broken),
        }
    }

    /// Write a JSON envelope, bounded by the configured write timeout.
    /// A transport failure or timeout marks the context broken so the
    /// next acquirer redials instead of reusing a dead socket.
    ///
    /// # Errors
    ///
    /// See [`LeaseError`].
    pub async fn write_json_timeout(&self, value: &serde_json::Value) -> Result<(), LeaseError> {
        let conn = self.active_conn()?;
        match tokio::time::timeout(self.write_timeout, conn.send_json(value)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                if err.indicates_disconnect() {
                    self.mark_broken().await;
                }
                Err(err)
            }
            Err(_) => {
                self.mark_broken().await;
                Err(LeaseError::Timeout)
            }
        }
    }

    /// Read the next message, bounded by the configured read timeout.
    /// Successful reads refresh the context's idle deadline.
    ///
    /// # Errors
    ///
    /// See [`LeaseError`].
    pub async fn read_message_timeout(&self) -> Result<Option<String>, LeaseError> {
        let conn = self.active_conn()?;
        match tokio::time::timeout(self.read_timeout, conn.recv()).await {
            Ok(Ok(message)) => {
                self.ctx.maybe_touch_lease(self.idle_ttl);
                Ok(message)
            }
            Ok(Err(err)) => {
                if err.indicates_disconnect() {
                    self.mark_broken().await;
                }
                Err(err)
            }
            Err(_) => {
                self.mark_broken().await;
                Err(LeaseError::Timeout)
            }
        }
    }

    /// Send a ping, bounded by `timeout` (the sweeper's idle-conn probe
    /// uses a shorter timeout than ordinary reads/writes).
    ///
    /// # Errors
    ///
    /// See [`LeaseError`].
    pub async fn ping_timeout(&self, timeout: Duration) -> Result<(), LeaseError> {
        let conn = self.active_conn()?;
        match tokio::time::timeout(timeout, conn.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                if err.indicates_disconnect() {
                    self.mark_broken().await;
                }
                Err(err)
            }
            Err(_) => {
                self.mark_broken().await;
                Err(LeaseError::Timeout)
            }
        }
    }

    /// Refresh the context's idle deadline without performing IO.
    pub fn touch(&self) {
        self.ctx.maybe_touch_lease(self.idle_ttl);
    }

    /// Whether this lease's context has already completed a prewarm
    /// request on its current upstream.
    #[must_use]
    pub fn is_prewarmed(&self) -> bool {
        self.ctx.is_prewarmed()
    }

    /// Record that a prewarm request completed on this lease's
    /// context.
    pub fn mark_prewarmed(&self) {
        self.ctx.mark_prewarmed();
    }

    /// Mark the backing context broken, but only if this lease's
    /// connection is still the context's current one (a late failure
    /// from an already-superseded connection must not clobber a
    /// connection someone else has since dialed). Clears the cached
    /// connection pointer so the next IO call re-verifies under the
    /// context lock instead of handing back the now-dead socket.
    pub async fn mark_broken(&self) {
        *self.cached_conn.write().expect("lease cache lock poisoned") = None;
        self.ctx.mark_broken_if_conn_match(self.conn_id).await;
    }

    /// Release ownership back to the pool. The connection is kept
    /// open for reuse unless the context has been marked broken.
    ///
    /// Safe to call more than once or to omit: [`Drop`] releases any
    /// lease that was not released explicitly.
    pub async fn release(&self) {
        self.release_inner(self.ctx.is_broken()).await;
    }

    /// Release ownership and force the connection closed, even if it
    /// is not marked broken. Used when the forwarder decides a
    /// connection must not be handed to the next request (e.g. it
    /// observed a close frame not severe enough to mark broken but
    /// unsafe to keep handing out).
    pub async fn discard(&self) {
        self.release_inner(true).await;
    }

    /// Release ownership but keep the upstream connection open rather
    /// than returning it to the idle pool for immediate reuse, and
    /// schedule a one-shot delayed ping probe on it (§4.2, "Yield").
    /// Used between turns of the same conversation, where the caller
    /// expects to come back for this exact connection shortly and a
    /// full close/redial would be wasted work.
    ///
    /// Falls back to an ordinary close if the context is already
    /// broken, same as [`Lease::release`] — a broken connection is
    /// never worth keeping open or probing.
    pub async fn r#yield(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let close_upstream = self.ctx.is_broken();
        self.ctx.release(&self.owner_id, close_upstream, self.idle_ttl).await;
        if !close_upstream {
            self.ctx.schedule_delayed_ping(self.delayed_ping_delay, self.delayed_ping_timeout);
        }
    }

    async fn release_inner(&self, close_upstream: bool) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.release(&self.owner_id, close_upstream, self.idle_ttl).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        self.released.store(true, Ordering::SeqCst);
        let ctx = self.ctx.clone();
        let owner_id = self.owner_id.clone();
        let idle_ttl = self.idle_ttl;
        tokio::spawn(async move {
            let close_upstream = ctx.is_broken();
            ctx.release(&owner_id, close_upstream, idle_ttl).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::dialer::{DialRequest, DialedConn, Dialer};
    use crate::upstream::error::DialError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    struct LoopbackDialer;

    #[async_trait]
    impl Dialer for LoopbackDialer {
        async fn dial(&self, request: &DialRequest) -> Result<DialedConn, DialError> {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                use futures::{SinkExt, StreamExt};
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    let _ = ws.send(Message::Text(text)).await;
                }
            });
            let url = format!("ws://{addr}/");
            let connect = tokio_tungstenite::connect_async(url).await;
            let _ = &request.timeout;
            let (stream, response) = connect.map_err(DialError::from)?;
            let handshake_headers = response
                .headers()
                .iter()
                .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.as_str().to_string(), v.to_string())))
                .collect();
            Ok(DialedConn {
                conn: Arc::new(UpstreamConn::new(stream)),
                handshake_headers,
            })
        }
    }

    async fn leased_echo_context() -> (Arc<UpstreamContext>, Lease) {
        let ctx = Arc::new(UpstreamContext::new("sess".into(), "fp".into(), Duration::from_secs(60)));
        let dialer = LoopbackDialer;
        let cancel = tokio_util::sync::CancellationToken::new();
        ctx.ensure_upstream(
            &dialer,
            "placeholder",
            &HashMap::new(),
            Duration::from_secs(5),
            None,
            Duration::from_secs(60),
            &cancel,
        )
        .await
        .unwrap();
        let conn_id = ctx.conn_id().unwrap();
        let lease = Lease::new(
            ctx.clone(),
            "req-1".into(),
            conn_id,
            Duration::from_secs(60),
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_millis(20),
            Duration::from_secs(5),
            LeaseMetadata {
                queue_wait: Duration::ZERO,
                conn_pick: Duration::ZERO,
                reused: false,
                schedule_layer: ScheduleLayer::L1NewContext,
                stickiness: StickyLevel::Weak,
                migration_used: false,
            },
        );
        (ctx, lease)
    }

    #[tokio::test]
    async fn write_then_read_round_trips_over_loopback() {
        let (_ctx, lease) = leased_echo_context().await;
        lease
            .write_json_timeout(&serde_json::json!({"type": "response.create"}))
            .await
            .unwrap();
        let reply = lease.read_message_timeout().await.unwrap();
        assert_eq!(reply, Some(r#"{"type":"response.create"}"#.to_string()));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (ctx, lease) = leased_echo_context().await;
        lease.release().await;
        lease.release().await;
        assert!(ctx.is_idle());
    }

    #[tokio::test]
    async fn metadata_accessors_reflect_the_constructor_args() {
        let (_ctx, lease) = leased_echo_context().await;
        assert_eq!(lease.schedule_layer(), ScheduleLayer::L1NewContext);
        assert_eq!(lease.stickiness(), StickyLevel::Weak);
        assert!(!lease.migration_used());
        assert!(!lease.reused());
    }

    #[tokio::test]
    async fn cached_connection_serves_reads_without_reverifying_context_state() {
        let (ctx, lease) = leased_echo_context().await;
        lease
            .write_json_timeout(&serde_json::json!({"type": "response.create"}))
            .await
            .unwrap();
        // Release the context out from under the lease; the cached-conn
        // fast path must still serve the same connection rather than
        // re-deriving it from the context's (now cleared) state.
        ctx.release(&"req-1".to_string(), true, Duration::from_secs(60)).await;
        let reply = lease.read_message_timeout().await.unwrap();
        assert_eq!(reply, Some(r#"{"type":"response.create"}"#.to_string()));
    }

    #[tokio::test]
    async fn mark_broken_clears_the_cache_so_the_next_op_reverifies() {
        let (ctx, lease) = leased_echo_context().await;
        lease
            .write_json_timeout(&serde_json::json!({"type": "response.create"}))
            .await
            .unwrap();
        lease.mark_broken().await;
        let err = lease.read_message_timeout().await.unwrap_err();
        assert!(matches!(err, LeaseError::Broken));
        assert!(ctx.is_idle() || ctx.is_broken());
    }

    #[tokio::test]
    async fn stale_conn_id_surfaces_as_broken() {
        let (ctx, lease) = leased_echo_context().await;
        ctx.release(&"req-1".to_string(), true, Duration::from_secs(60)).await;
        let err = lease.read_message_timeout().await.unwrap_err();
        assert!(matches!(err, LeaseError::Broken));
    }

    #[tokio::test]
    async fn yield_keeps_the_upstream_open_and_idle() {
        let (ctx, lease) = leased_echo_context().await;
        lease.r#yield().await;
        assert!(ctx.is_idle());
        assert!(ctx.upstream_conn().is_some(), "yield must not close the upstream");
    }

    #[tokio::test]
    async fn yield_is_idempotent_with_release() {
        let (ctx, lease) = leased_echo_context().await;
        lease.r#yield().await;
        lease.release().await;
        assert!(ctx.is_idle());
        assert!(ctx.upstream_conn().is_some());
    }

    #[tokio::test]
    async fn yield_on_broken_context_closes_like_release() {
        let (ctx, lease) = leased_echo_context().await;
        lease.mark_broken().await;
        lease.r#yield().await;
        assert!(ctx.is_idle());
        assert!(ctx.upstream_conn().is_none());
    }
}
