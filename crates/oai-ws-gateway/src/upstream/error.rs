//! Error types for the upstream connection pool and forwarder.
//!
//! Follows the error-handling design (§7): fallback-safe failures
//! carry a short classifier reason so the caller can retry over HTTP;
//! everything else is terminal.

use std::collections::HashMap;

/// Short classifier reason attached to every fallback-safe error, so
/// callers can match on it without string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The upstream URL could not be constructed.
    BuildWsUrl,
    /// The account pool has no spare capacity and no migration
    /// candidate met the score threshold.
    ConnQueueFull,
    /// The server rejected the WS upgrade.
    UpgradeRequired,
    /// Authentication failed during dial or an early error event.
    AuthFailed,
    /// The server rate-limited the dial or request.
    RateLimited,
    /// A 5xx-class failure from the server.
    ServerError,
    /// Acquire or an IO operation timed out.
    Timeout,
    /// Acquire gave up waiting for another owner's release.
    Busy,
    /// Writing the prewarm envelope failed.
    PrewarmWrite,
    /// `previous_response_id` referenced a response the server no
    /// longer recognizes.
    PreviousResponseNotFound,
    /// The server does not support the requested WS transport.
    WsUnsupported,
    /// The account or server-side connection limit was reached.
    WsConnectionLimit,
}

impl FallbackReason {
    /// Short machine-readable tag, matching the strings named in §7.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BuildWsUrl => "build_ws_url",
            Self::ConnQueueFull => "conn_queue_full",
            Self::UpgradeRequired => "upgrade_required",
            Self::AuthFailed => "auth_failed",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::PrewarmWrite => "prewarm_write",
            Self::PreviousResponseNotFound => "previous_response_not_found",
            Self::WsUnsupported => "ws_unsupported",
            Self::WsConnectionLimit => "ws_connection_limit",
        }
    }

    /// Classify an upstream HTTP status code encountered during dial
    /// or an early error event, if it is fallback-safe at all.
    #[must_use]
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 => Some(Self::AuthFailed),
            403 => Some(Self::AuthFailed),
            404 => Some(Self::PreviousResponseNotFound),
            409 => Some(Self::WsConnectionLimit),
            426 => Some(Self::UpgradeRequired),
            429 => Some(Self::RateLimited),
            500..=599 => Some(Self::ServerError),
            _ => None,
        }
    }
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure producing a [`crate::upstream::connection::UpstreamConn`]
/// (C2).
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    /// Transport-level WebSocket failure.
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// The HTTP upgrade handshake was rejected with a status code and
    /// response headers.
    #[error("upgrade rejected: status {status}")]
    UpgradeRejected {
        /// HTTP status code returned by the server.
        status: u16,
        /// Response headers captured from the rejected upgrade.
        headers: HashMap<String, String>,
    },

    /// The dial did not complete within the configured timeout.
    #[error("dial timed out")]
    Timeout,

    /// The upstream URL could not be built or parsed.
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),

    /// The configured proxy refused the `CONNECT` tunnel or could not
    /// be reached.
    #[error("proxy connect failed: {0}")]
    ProxyConnectFailed(String),
}

impl DialError {
    /// HTTP status code carried by this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::UpgradeRejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify this dial error as a [`FallbackReason`].
    #[must_use]
    pub fn fallback_reason(&self) -> FallbackReason {
        match self {
            Self::UpgradeRejected { status, .. } => {
                FallbackReason::from_status(*status).unwrap_or(FallbackReason::UpgradeRequired)
            }
            Self::Timeout => FallbackReason::Timeout,
            Self::InvalidUrl(_) => FallbackReason::BuildWsUrl,
            Self::WebSocket(_) => FallbackReason::UpgradeRequired,
            Self::ProxyConnectFailed(_) => FallbackReason::UpgradeRequired,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DialError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// Failure produced by [`crate::upstream::pool::IngressContextPool::acquire`]
/// (C4/C5).
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// No capacity and no migration candidate met the score threshold.
    #[error("queue full")]
    QueueFull,

    /// Gave up waiting for another owner to release the target
    /// context (retry/time bound exceeded or cancellation observed).
    #[error("busy")]
    Busy,

    /// The request's context was cancelled while acquiring.
    #[error("cancelled")]
    Cancelled,

    /// Dialing the upstream failed.
    #[error("dial failed: {0}")]
    Dial(#[from] DialError),

    /// A required collaborator was missing (nil pool, nil account,
    /// empty URL, nil dialer).
    #[error("misconfigured: {0}")]
    Misconfigured(&'static str),
}

impl AcquireError {
    /// Classify this acquire error as a [`FallbackReason`], if it is
    /// one at all (`Misconfigured` is an internal fail-fast failure
    /// and is not fallback-safe).
    #[must_use]
    pub fn fallback_reason(&self) -> Option<FallbackReason> {
        match self {
            Self::QueueFull => Some(FallbackReason::ConnQueueFull),
            Self::Busy => Some(FallbackReason::Busy),
            Self::Cancelled => Some(FallbackReason::Busy),
            Self::Dial(dial) => Some(dial.fallback_reason()),
            Self::Misconfigured(_) => None,
        }
    }
}

/// Failure performing IO through a [`crate::upstream::lease::Lease`]
/// (C6).
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The lease was already released.
    #[error("conn closed")]
    Closed,

    /// The context backing this lease is marked broken.
    #[error("context broken")]
    Broken,

    /// The IO operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Transport-level WebSocket failure.
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// JSON encode/decode failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for LeaseError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl LeaseError {
    /// Whether this error indicates the underlying transport
    /// disconnected (as opposed to a timeout or logical closed-lease
    /// error), used to decide whether to mark the context broken.
    #[must_use]
    pub fn indicates_disconnect(&self) -> bool {
        matches!(self, Self::WebSocket(_))
    }
}

/// Top-level error returned by the forwarder (C9) to the request
/// framework.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Nothing has been written downstream yet; the caller should
    /// retry the request over HTTP.
    #[error("fallback-safe ({reason}): {detail}")]
    Fallback {
        /// Short classifier reason.
        reason: FallbackReason,
        /// Human-readable detail for logs.
        detail: String,
    },

    /// Bytes were already written downstream; this failure is
    /// terminal and must be surfaced to the client as-is.
    #[error("terminal: {0}")]
    Terminal(String),
}

impl ForwardError {
    /// Construct a fallback-safe error.
    #[must_use]
    pub fn fallback(reason: FallbackReason, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        tracing::warn!(reason = %reason, detail = %detail, "falling back to http");
        Self::Fallback { reason, detail }
    }

    /// Whether this error is safe to retry over HTTP.
    #[must_use]
    pub fn is_fallback_safe(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

impl From<AcquireError> for ForwardError {
    fn from(err: AcquireError) -> Self {
        match err.fallback_reason() {
            Some(reason) => Self::fallback(reason, err.to_string()),
            None => Self::Terminal(err.to_string()),
        }
    }
}

impl From<LeaseError> for ForwardError {
    fn from(err: LeaseError) -> Self {
        Self::Terminal(err.to_string())
    }
}
