//! C9a: the forwarder — drives one request end to end, from `Acquire`
//! through the optional prewarm, the main write, and the consumer loop
//! that relays the pump's output downstream (§4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::external::{Account, Cache, DownstreamSink, UsageReport, UsageSink};

use super::error::{FallbackReason, ForwardError, LeaseError};
use super::lease::Lease;
use super::pool::{AcquireRequest, IngressContextPool};
use super::protocol::{is_error_event, is_terminal_event, is_token_like_event, EnvelopeHeader, Transport, WireError};
use super::pump::{spawn_pump, PumpExit};
use super::sticky::{self, StickyStateStore};

/// Optional fields the retry-trimming pass may drop on `attempt >= 2`.
/// `prompt_cache_key` must never appear here (§4.7, §9 open question).
const RETRY_TRIM_FIELDS: &[&str] = &["include"];

/// Everything needed to build and acquire the envelope for one
/// request (§4.7).
pub struct ForwardRequest<'a> {
    /// The account this request was scheduled onto.
    pub account: &'a dyn Account,
    /// The client's request body, unmodified.
    pub client_body: serde_json::Value,
    /// Stable per-session fingerprint, used for `Acquire` and sticky
    /// routing.
    pub session_key: String,
    /// Opaque fingerprint recorded on the context for diagnostics.
    pub session_fingerprint: String,
    /// Per-request owner token; must be unique per in-flight request.
    pub owner_id: String,
    /// Upstream upgrade URL.
    pub url: String,
    /// Upstream upgrade headers.
    pub headers: HashMap<String, String>,
    /// Cancellation token tied to the inbound client connection.
    pub cancel: CancellationToken,
    /// Whether the client requested streaming (SSE-style) output.
    pub streaming: bool,
    /// Model name the client asked for, used to rewrite the response
    /// back if the upstream renamed it.
    pub client_requested_model: String,
    /// Whether the upstream model differs from what the client asked
    /// for and must be rewritten on the way out.
    pub needs_model_replace: bool,
    /// `previous_response_id` from the client body, if any.
    pub previous_response_id: Option<String>,
    /// Whether the client has `store` enabled.
    pub store_enabled: bool,
    /// Zero-based turn number within the conversation.
    pub turn_number: u32,
    /// Account- or request-level override forcing strong stickiness.
    pub strict_affinity: bool,
    /// Whether this turn is a tool-call continuation (skips prewarm).
    pub is_tool_continuation: bool,
    /// Transport chosen by the protocol resolver (C8).
    pub transport: Transport,
    /// Which attempt this is, 1-based; `>= 2` triggers retry trimming.
    pub attempt: u32,
    /// Correlates this forward with the inbound request, for usage
    /// reporting.
    pub request_id: String,
}

/// Whether the last recorded failure reason implies the upstream is
/// stuck in a way that makes reusing the preferred connection unsafe,
/// forcing a fresh dial instead (§4.7, "force new connection").
#[must_use]
pub fn forces_new_connection(last_failure: Option<FallbackReason>) -> bool {
    matches!(
        last_failure,
        Some(FallbackReason::AuthFailed | FallbackReason::WsConnectionLimit | FallbackReason::PrewarmWrite)
    )
}

/// Build the outbound envelope from the client's request body (§4.7,
/// "Build envelope").
///
/// Deletes `background`, defaults `stream` to `true`, sets
/// `type = "response.create"`, and forces `store = false` unless
/// `allow_store_recovery` is set. On `attempt >= 2`, strips
/// [`RETRY_TRIM_FIELDS`] — never `prompt_cache_key`.
#[must_use]
pub fn build_envelope(client_body: &serde_json::Value, attempt: u32, allow_store_recovery: bool) -> serde_json::Value {
    let mut envelope = client_body.clone();
    if let Some(obj) = envelope.as_object_mut() {
        obj.remove("background");
        obj.entry("stream").or_insert(serde_json::Value::Bool(true));
        obj.insert("type".into(), serde_json::Value::String(super::protocol::event_type::RESPONSE_CREATE.into()));
        if !allow_store_recovery {
            obj.insert("store".into(), serde_json::Value::Bool(false));
        }
        if attempt >= 2 {
            for field in RETRY_TRIM_FIELDS {
                obj.remove(*field);
            }
        }
    }
    envelope
}

/// Wrap [`build_envelope`] with `generate: false`, for the optional
/// prewarm request (§4.7, "Optional prewarm").
#[must_use]
pub fn build_prewarm_envelope(client_body: &serde_json::Value, allow_store_recovery: bool) -> serde_json::Value {
    let mut envelope = build_envelope(client_body, 1, allow_store_recovery);
    if let Some(obj) = envelope.as_object_mut() {
        obj.insert("generate".into(), serde_json::Value::Bool(false));
    }
    envelope
}

/// Rewrite the top-level and nested `response.model` fields of an
/// outbound event back to the client-requested model name.
pub fn rewrite_model(event: &mut serde_json::Value, client_requested_model: &str) {
    if let Some(obj) = event.as_object_mut() {
        if obj.contains_key("model") {
            obj.insert("model".into(), serde_json::Value::String(client_requested_model.into()));
        }
        if let Some(response) = obj.get_mut("response").and_then(serde_json::Value::as_object_mut) {
            if response.contains_key("model") {
                response.insert("model".into(), serde_json::Value::String(client_requested_model.into()));
            }
        }
    }
}

/// Pass an event through the tool-call corrector.
///
/// The spec names this seam but gives no further detail on what the
/// correction does; kept as a thin identity pass-through until a
/// concrete correction rule is specified.
pub fn correct_tool_calls(event: serde_json::Value) -> serde_json::Value {
    event
}

/// Classify a recoverable [`WireError`] code into its [`FallbackReason`]
/// (§4.7, §7 — the recoverable-code set named for early error events).
#[must_use]
pub fn fallback_reason_for_wire_error(err: &WireError) -> FallbackReason {
    match err.code.as_deref() {
        Some("upgrade_required") => FallbackReason::UpgradeRequired,
        Some("ws_unsupported") => FallbackReason::WsUnsupported,
        Some("ws_connection_limit") => FallbackReason::WsConnectionLimit,
        Some("previous_response_not_found") => FallbackReason::PreviousResponseNotFound,
        _ => FallbackReason::ServerError,
    }
}

/// Classify a [`LeaseError`] as a [`FallbackReason`], used when a
/// write/read against the lease fails before anything downstream has
/// been written.
#[must_use]
pub fn lease_error_fallback_reason(err: &LeaseError) -> FallbackReason {
    match err {
        LeaseError::Timeout => FallbackReason::Timeout,
        LeaseError::Closed | LeaseError::Broken | LeaseError::WebSocket(_) | LeaseError::Json(_) => FallbackReason::ServerError,
    }
}

/// C9: drives one request's full lifecycle over a leased upstream
/// connection.
pub struct Forwarder<C: Cache> {
    pool: Arc<IngressContextPool>,
    sticky: Arc<StickyStateStore<C>>,
    usage_sink: Arc<dyn UsageSink>,
    config: GatewayConfig,
}

impl<C: Cache> Forwarder<C> {
    /// Build a forwarder over the given pool, sticky store, usage
    /// sink, and configuration.
    #[must_use]
    pub fn new(pool: Arc<IngressContextPool>, sticky: Arc<StickyStateStore<C>>, usage_sink: Arc<dyn UsageSink>, config: GatewayConfig) -> Self {
        Self {
            pool,
            sticky,
            usage_sink,
            config,
        }
    }

    /// The preferred connection id for this request, consulted from C7
    /// before calling `Acquire` (§4.7, "Acquire lease").
    async fn preferred_conn_id(&self, request: &ForwardRequest<'_>) -> Option<Uuid> {
        if let Some(previous_response_id) = &request.previous_response_id {
            if let Some(conn_id) = self.sticky.conn_for_response(previous_response_id).await {
                return Some(conn_id);
            }
        }
        if sticky::should_consult_session_index(request.store_enabled, self.config.store_disabled_conn_mode) {
            return self.sticky.conn_for_session(&request.session_key).await;
        }
        None
    }

    /// Acquire a lease for this request. When `force_new_connection` is
    /// set (§4.7, "force new connection"), the session key handed to
    /// `Acquire` is overridden to the per-connection-isolation form so
    /// the exact-hit lookup always misses and a fresh context is picked,
    /// never the stuck one this account/session last failed on (§4.2,
    /// session hash "derived as `conn:` + ownerID to force per-connection
    /// isolation").
    async fn acquire_lease(
        &self,
        request: &ForwardRequest<'_>,
        preferred_conn_id: Option<Uuid>,
        force_new_connection: bool,
    ) -> Result<Lease, ForwardError> {
        let strict_affinity = request.strict_affinity || preferred_conn_id.is_some();
        let session_key = if force_new_connection {
            format!("conn:{}", request.owner_id)
        } else {
            request.session_key.clone()
        };
        let acquire_request = AcquireRequest {
            account: request.account,
            session_key,
            session_fingerprint: request.session_fingerprint.clone(),
            owner_id: request.owner_id.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            cancel: request.cancel.clone(),
            has_previous_response_id: request.previous_response_id.is_some(),
            store_enabled: request.store_enabled,
            turn_number: request.turn_number,
            strict_affinity,
        };
        self.pool.acquire(acquire_request).await.map_err(ForwardError::from)
    }

    /// Whether this request is eligible for an optional prewarm
    /// (§4.7, "Optional prewarm").
    fn should_prewarm(&self, request: &ForwardRequest<'_>, lease: &Lease) -> bool {
        self.config.prewarm_generate_enabled
            && request.transport == Transport::WsV2
            && request.previous_response_id.is_none()
            && !lease.is_prewarmed()
            && !request.is_tool_continuation
    }

    /// Send the prewarm envelope and consume until a terminal event
    /// (§4.7, "Optional prewarm"). On success, binds the prewarm
    /// response id to the account and marks the lease prewarmed.
    async fn prewarm(&self, request: &ForwardRequest<'_>, lease: &Lease) -> Result<(), ForwardError> {
        let envelope = build_prewarm_envelope(&request.client_body, request.account.allow_store_recovery());
        lease
            .write_json_timeout(&envelope)
            .await
            .map_err(|_| ForwardError::fallback(FallbackReason::PrewarmWrite, "prewarm write failed"))?;

        loop {
            let raw = lease
                .read_message_timeout()
                .await
                .map_err(|_| ForwardError::fallback(FallbackReason::PrewarmWrite, "prewarm read failed"))?
                .ok_or_else(|| ForwardError::fallback(FallbackReason::PrewarmWrite, "upstream closed during prewarm"))?;

            let header = EnvelopeHeader::parse(&raw)
                .map_err(|_| ForwardError::fallback(FallbackReason::PrewarmWrite, "malformed prewarm event"))?;

            if is_error_event(&header.event_type) {
                return Err(ForwardError::fallback(FallbackReason::PrewarmWrite, "prewarm error event"));
            }
            if is_terminal_event(&header.event_type) {
                lease.mark_prewarmed();
                if let Some(response_id) = header.response_id() {
                    self.sticky.bind_response_account(response_id, &request.account.id().to_string()).await;
                    self.sticky.bind_response_conn(response_id, lease.conn_id()).await;
                }
                return Ok(());
            }
        }
    }

    /// Forward one request end to end: acquire, optional prewarm, the
    /// main write, the pump, and the consumer loop (§4.7).
    ///
    /// Wraps [`Self::forward_impl`] to record a fallback's reason
    /// against this session, so a subsequent retry that hits a reason
    /// in [`forces_new_connection`] is forced onto a fresh connection
    /// instead of being handed the same stuck one (§4.7).
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::Fallback`] when nothing has been written
    /// downstream and the caller may safely retry over HTTP, or
    /// [`ForwardError::Terminal`] once bytes have already reached the
    /// client.
    pub async fn forward(&self, request: ForwardRequest<'_>, downstream: &dyn DownstreamSink) -> Result<(), ForwardError> {
        let session_key = request.session_key.clone();
        let result = self.forward_impl(request, downstream).await;
        if let Err(ForwardError::Fallback { reason, .. }) = &result {
            if forces_new_connection(Some(*reason)) {
                self.sticky.record_failure(&session_key, *reason).await;
            }
        }
        result
    }

    async fn forward_impl(&self, request: ForwardRequest<'_>, downstream: &dyn DownstreamSink) -> Result<(), ForwardError> {
        let started_at = Instant::now();
        let last_failure = self.sticky.last_failure(&request.session_key).await;
        let force_new_connection = forces_new_connection(last_failure);
        let preferred_conn_id = if force_new_connection {
            None
        } else {
            self.preferred_conn_id(&request).await
        };
        let lease = self.acquire_lease(&request, preferred_conn_id, force_new_connection).await?;

        if self.should_prewarm(&request, &lease) {
            if let Err(err) = self.prewarm(&request, &lease).await {
                lease.mark_broken().await;
                lease.discard().await;
                return Err(err);
            }
        }

        let envelope = build_envelope(&request.client_body, request.attempt, request.account.allow_store_recovery());
        if let Err(err) = lease.write_json_timeout(&envelope).await {
            lease.discard().await;
            return Err(ForwardError::fallback(lease_error_fallback_reason(&err), "main write failed"));
        }

        let lease = Arc::new(lease);
        let pump_cancel = CancellationToken::new();
        let (mut rx, pump_handle) = spawn_pump(lease.clone(), pump_cancel.clone());

        let outcome = self
            .consume(&request, downstream, &mut rx, &pump_cancel, started_at)
            .await;
        drop(rx);
        let pump_exit = pump_handle.await.unwrap_or(PumpExit::Io);

        match outcome {
            Ok(completion) => {
                self.complete(&request, &lease, completion, downstream, started_at).await;
                lease.release().await;
                Ok(())
            }
            Err(err) => {
                if matches!(pump_exit, PumpExit::Io) {
                    lease.mark_broken().await;
                }
                lease.discard().await;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn consume(
        &self,
        request: &ForwardRequest<'_>,
        downstream: &dyn DownstreamSink,
        rx: &mut tokio::sync::mpsc::Receiver<super::pump::PumpMessage>,
        pump_cancel: &CancellationToken,
        started_at: Instant,
    ) -> Result<Completion, ForwardError> {
        let mut wrote_downstream = false;
        let mut client_disconnected = false;
        let mut drain_deadline: Option<Instant> = None;
        let mut first_token_at: Option<Duration> = None;
        let mut buffered: Vec<serde_json::Value> = Vec::new();
        let mut final_response: Option<serde_json::Value> = None;
        let mut final_response_id: Option<String> = None;
        let flush_interval = Duration::from_millis(self.config.event_flush_interval_ms);
        let mut pending_since_flush = 0usize;
        let mut last_flush_at = Instant::now();

        loop {
            if let Some(deadline) = drain_deadline {
                if Instant::now() >= deadline {
                    pump_cancel.cancel();
                    return Err(ForwardError::Terminal("client disconnected; drain deadline exceeded".into()));
                }
            }

            let Some(message) = rx.recv().await else {
                if client_disconnected {
                    return Err(ForwardError::Terminal("client disconnected during drain".into()));
                }
                return Err(ForwardError::Terminal("upstream closed without a terminal event".into()));
            };

            let header = message.header;
            let mut event: serde_json::Value = serde_json::from_str(&message.raw)
                .map_err(|err| ForwardError::Terminal(format!("malformed upstream event: {err}")))?;

            let is_terminal = is_terminal_event(&header.event_type);
            let is_token_like = is_token_like_event(&header.event_type, request.streaming);
            if first_token_at.is_none() && is_token_like {
                first_token_at = Some(started_at.elapsed());
            }

            if request.needs_model_replace {
                rewrite_model(&mut event, &request.client_requested_model);
            }
            let event = correct_tool_calls(event);

            if is_error_event(&header.event_type) {
                let wire_error: Option<WireError> = header.error.clone();
                let recoverable = wire_error.as_ref().is_some_and(WireError::is_recoverable);
                if !wrote_downstream && recoverable {
                    let reason = wire_error.as_ref().map_or(FallbackReason::ServerError, fallback_reason_for_wire_error);
                    return Err(ForwardError::fallback(reason, "early upstream error event"));
                }
                if client_disconnected {
                    return Err(ForwardError::Terminal("upstream error during drain".into()));
                }
                self.flush_buffered(downstream, &mut buffered, &mut wrote_downstream, &mut client_disconnected)
                    .await;
                if !downstream.send_event(&event).await {
                    client_disconnected = true;
                }
                downstream.flush().await;
                let message = wire_error.as_ref().and_then(|e| e.message.clone()).unwrap_or_default();
                return Err(ForwardError::Terminal(format!("upstream error event: {message}")));
            }

            if client_disconnected {
                if is_terminal {
                    drain_deadline = None;
                    final_response = Some(event.clone());
                    final_response_id = header.response_id().map(str::to_string);
                    break;
                }
                continue;
            }

            if request.streaming {
                if !is_terminal && !is_token_like && first_token_at.is_none() {
                    buffered.push(event);
                } else {
                    self.flush_buffered(downstream, &mut buffered, &mut wrote_downstream, &mut client_disconnected)
                        .await;
                    if client_disconnected {
                        drain_deadline = Some(Instant::now() + self.config.drain_deadline());
                        continue;
                    }
                    if !downstream.send_event(&event).await {
                        client_disconnected = true;
                        drain_deadline = Some(Instant::now() + self.config.drain_deadline());
                        downstream.flush().await;
                    } else {
                        wrote_downstream = true;
                        // Micro-batch the flush itself: avoid paying a
                        // transport flush on every single event once
                        // we're past the first-token buffer (§4.7,
                        // "micro-batched flushing").
                        pending_since_flush = pending_since_flush.saturating_add(1);
                        if pending_since_flush >= self.config.event_flush_batch_size
                            || last_flush_at.elapsed() >= flush_interval
                        {
                            downstream.flush().await;
                            pending_since_flush = 0;
                            last_flush_at = Instant::now();
                        }
                    }
                }
            }

            if is_terminal {
                downstream.flush().await;
                final_response = Some(event);
                final_response_id = header.response_id().map(str::to_string);
                break;
            }
        }

        Ok(Completion {
            final_response,
            final_response_id,
            first_token_at,
            client_disconnected,
        })
    }

    async fn flush_buffered(
        &self,
        downstream: &dyn DownstreamSink,
        buffered: &mut Vec<serde_json::Value>,
        wrote_downstream: &mut bool,
        client_disconnected: &mut bool,
    ) {
        if buffered.is_empty() {
            return;
        }
        for event in buffered.drain(..) {
            if *client_disconnected {
                break;
            }
            if downstream.send_event(&event).await {
                *wrote_downstream = true;
            } else {
                *client_disconnected = true;
            }
        }
        // The pre-first-token buffer exists to preserve HTTP-fallback
        // safety (§9); once it's flushed the client must actually see
        // it, so this flush is unconditional rather than batched.
        downstream.flush().await;
    }

    async fn complete(&self, request: &ForwardRequest<'_>, lease: &Lease, completion: Completion, downstream: &dyn DownstreamSink, started_at: Instant) {
        if let Some(response_id) = &completion.final_response_id {
            self.sticky.bind_response_account(response_id, &request.account.id().to_string()).await;
            self.sticky.bind_response_conn(response_id, lease.conn_id()).await;
        }
        if !request.store_enabled {
            self.sticky.bind_session_conn(&request.session_key, lease.conn_id()).await;
        }

        if !request.streaming && !completion.client_disconnected {
            if let Some(final_response) = completion.final_response.clone() {
                let mut event = final_response;
                if request.needs_model_replace {
                    rewrite_model(&mut event, &request.client_requested_model);
                }
                let event = correct_tool_calls(event);
                let _ = downstream.send_event(&event).await;
                downstream.flush().await;
            }
        }

        let usage = completion
            .final_response
            .as_ref()
            .and_then(|response| response.get("usage"))
            .cloned();
        let prompt_tokens = usage.as_ref().and_then(|u| u.get("input_tokens")).and_then(serde_json::Value::as_u64).unwrap_or(0);
        let completion_tokens = usage.as_ref().and_then(|u| u.get("output_tokens")).and_then(serde_json::Value::as_u64).unwrap_or(0);
        let reasoning_effort = request
            .client_body
            .get("reasoning")
            .and_then(|r| r.get("effort"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        self.usage_sink
            .report(UsageReport {
                request_id: request.request_id.clone(),
                prompt_tokens,
                completion_tokens,
                model: request.client_requested_model.clone(),
                reasoning_effort,
                streaming: request.streaming,
                duration: started_at.elapsed(),
                first_token: completion.first_token_at,
            })
            .await;
    }
}

struct Completion {
    final_response: Option<serde_json::Value>,
    final_response_id: Option<String>,
    first_token_at: Option<Duration>,
    client_disconnected: bool,
}
