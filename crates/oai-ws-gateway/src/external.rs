//! Narrow interfaces to collaborators outside the gateway core.
//!
//! Account administration, scheduling policy, usage persistence, and
//! the response-id cache are deliberately out of scope for this crate
//! (see the crate-level docs); these traits are the seams through
//! which the core consumes them without depending on their concrete
//! implementations.

use async_trait::async_trait;
use std::time::Duration;

/// Account type, as surfaced by the surrounding account-administration
/// service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountKind {
    /// OAuth-linked ChatGPT-style account.
    OAuth,
    /// Plain API-key account.
    ApiKey,
}

/// Per-account WebSocket mode, as configured by an administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountWsMode {
    /// Follow the global protocol resolver decision.
    Auto,
    /// Never use WebSocket transport for this account.
    Off,
    /// Force HTTP regardless of global flags.
    ForceHttp,
}

/// A candidate account presented by the upstream scheduler.
///
/// The gateway core does not select *which* account serves a request;
/// it only accepts, queues, or migrates within the account it is
/// handed. Mirrors the `Account` contract in the external-interfaces
/// section: identity, concurrency limit, proxy, and the
/// `openai_*` behavioral flags.
pub trait Account: Send + Sync + std::fmt::Debug {
    /// Stable non-zero account id.
    fn id(&self) -> u64;

    /// OAuth vs API-key.
    fn kind(&self) -> AccountKind;

    /// Maximum concurrent upstream connections this account may hold.
    fn concurrency(&self) -> u32;

    /// Optional outbound proxy URL for this account's dials.
    fn proxy_url(&self) -> Option<&str>;

    /// Whether this account talks to an OpenAI-compatible backend at
    /// all (non-OpenAI accounts never reach the WS path).
    fn is_openai(&self) -> bool;

    /// Whether the requested model is supported for this account.
    fn is_model_supported(&self, model: &str) -> bool;

    /// The `chatgpt-account-id` header value for OAuth accounts.
    fn chatgpt_account_id(&self) -> Option<String>;

    /// User-agent override for this account, if any.
    fn openai_user_agent(&self) -> Option<String>;

    /// Base URL for this account's OpenAI-compatible backend.
    fn openai_base_url(&self) -> String;

    /// Whether this account has opted into `store`-based response
    /// recovery (affects whether C9 forces `store=false`).
    fn allow_store_recovery(&self) -> bool;

    /// Per-account WebSocket mode override.
    fn ws_mode(&self) -> AccountWsMode;
}

/// Outcome of a scheduler slot reservation.
pub struct SchedulerSlot {
    /// Whether a slot was actually reserved.
    pub acquired: bool,
}

/// Point-in-time runtime statistics for an account, used only to bias
/// migration scoring (§4.2, "Load awareness (optional)").
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountRuntimeStats {
    /// Recent error rate in `[0.0, 1.0]`.
    pub error_rate: f64,
    /// Whether the account's circuit breaker is currently open.
    pub circuit_open: bool,
}

/// Scheduling policy consumed by the gateway core.
///
/// The core calls [`Scheduler::try_acquire_account_slot`] once per
/// `Acquire` entry (outside this trait's concern — the pool records
/// the reservation and releases it via the returned guard). Runtime
/// stats are optional: an implementation that has none may return
/// `None` and migration scoring simply skips the load-awareness term.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Attempt to reserve a concurrency slot for `account_id`.
    async fn try_acquire_account_slot(&self, account_id: u64, concurrency: u32) -> SchedulerSlot;

    /// Release a previously acquired slot.
    fn release_account_slot(&self, account_id: u64);

    /// Optional runtime stats snapshot for migration scoring.
    fn runtime_stats(&self, _account_id: u64) -> Option<AccountRuntimeStats> {
        None
    }

    /// Whether the account's circuit breaker is open.
    fn is_circuit_open(&self, _account_id: u64) -> bool {
        false
    }
}

/// Typed cache with TTL, used by C7 only for the response-id →
/// account mapping (the sticky store's other mappings are in-process
/// and do not use this trait).
#[async_trait]
pub trait Cache: Send + Sync {
    /// Store `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration);

    /// Fetch `key`; returns `None` on miss or expiry.
    async fn get(&self, key: &str) -> Option<String>;
}

/// One completed request's usage, reported once per request.
#[derive(Debug, Clone)]
pub struct UsageReport {
    /// Correlates with the inbound request.
    pub request_id: String,
    /// Prompt tokens consumed.
    pub prompt_tokens: u64,
    /// Completion tokens produced.
    pub completion_tokens: u64,
    /// Model name as billed (post model-name rewrite).
    pub model: String,
    /// Reasoning effort, if the model supports it.
    pub reasoning_effort: Option<String>,
    /// Whether this was a streaming request.
    pub streaming: bool,
    /// Total request duration.
    pub duration: Duration,
    /// Time to first token-like event, if any arrived.
    pub first_token: Option<Duration>,
}

/// Usage sink consumed once per completed request.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Report usage for one completed request.
    async fn report(&self, usage: UsageReport);
}

/// The downstream client connection the forwarder relays events to
/// (C9). Abstracts whatever HTTP/SSE transport sits between this
/// gateway and its caller so the core never depends on a concrete web
/// framework.
#[async_trait]
pub trait DownstreamSink: Send + Sync {
    /// Write one event to the client, buffering it on the transport's
    /// side rather than necessarily flushing immediately.
    ///
    /// Returns `false` if the client has disconnected and the event
    /// could not be delivered; the forwarder treats this as the start
    /// of a drain rather than a hard failure.
    async fn send_event(&self, event: &serde_json::Value) -> bool;

    /// Force any buffered events out to the client now.
    ///
    /// Called by the forwarder's micro-batching policy
    /// (`event_flush_batch_size`/`event_flush_interval_ms`) instead of
    /// flushing on every single `send_event`. The default
    /// implementation is a no-op, for sinks that flush per call.
    async fn flush(&self) {}
}

/// An in-memory [`Cache`] implementation, used by default and in
/// tests. Production deployments are expected to supply their own
/// (Redis-backed, etc.) implementation.
#[derive(Default)]
pub struct InMemoryCache {
    entries: dashmap::DashMap<String, (String, std::time::Instant)>,
}

impl InMemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            (value.to_string(), std::time::Instant::now() + ttl),
        );
    }

    async fn get(&self, key: &str) -> Option<String> {
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.1 > std::time::Instant::now())
            .map(|entry| entry.0.clone());
        if hit.is_none() {
            self.entries.remove(key);
        }
        hit
    }
}
