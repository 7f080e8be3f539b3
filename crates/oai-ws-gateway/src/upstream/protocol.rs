//! Wire protocol types for the OpenAI-compatible Responses WebSocket
//! API: recognized envelope keys, terminal/error/token-like event
//! classification, and the HTTP upgrade header contract (§6).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Transport chosen by the protocol resolver (C8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Plain HTTP request/response (or SSE streaming over HTTP).
    Http,
    /// The older WebSocket protocol revision.
    WsV1,
    /// The current WebSocket protocol revision.
    WsV2,
}

impl Transport {
    /// The `openai-beta` header value for this transport, if it uses
    /// WebSocket at all.
    #[must_use]
    pub fn openai_beta_header(self) -> Option<&'static str> {
        match self {
            Self::WsV2 => Some("responses_websockets=2026-02-06"),
            Self::WsV1 => Some("responses_websockets=2026-02-04"),
            Self::Http => None,
        }
    }
}

/// Recognized `type` values on the receive side. Only the ones the
/// core must branch on are named; anything else is passed through
/// opaquely.
pub mod event_type {
    /// Outbound envelope type for the main request.
    pub const RESPONSE_CREATE: &str = "response.create";

    /// Terminal event types: no further events follow for this
    /// response.
    pub const TERMINALS: &[&str] = &[
        "response.completed",
        "response.done",
        "response.failed",
        "response.incomplete",
        "response.cancelled",
        "response.canceled",
    ];

    /// A generic upstream error event.
    pub const ERROR: &str = "error";
}

/// Whether `event_type` marks the end of a response stream.
#[must_use]
pub fn is_terminal_event(event_type: &str) -> bool {
    event_type::TERMINALS.contains(&event_type)
}

/// Whether `event_type` is the generic error event.
#[must_use]
pub fn is_error_event(event_type: &str) -> bool {
    event_type == event_type::ERROR
}

/// Whether `event_type` is "token-like": the first such event in a
/// response marks the point after which buffered events must be
/// flushed and HTTP fallback is no longer safe (§4.7, §9 "Buffering
/// before first token").
///
/// For non-streaming requests, the terminal event itself counts as
/// token-like, since it is the first (and only) point data becomes
/// available.
#[must_use]
pub fn is_token_like_event(event_type: &str, streaming: bool) -> bool {
    if !streaming {
        return is_terminal_event(event_type);
    }
    event_type.ends_with(".delta") || event_type.starts_with("response.output")
}

/// Error payload carried by an `"error"` event.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireError {
    /// Provider-specific error code, used for fallback classification.
    pub code: Option<String>,
    /// Error type/category.
    #[serde(rename = "type")]
    pub error_type: Option<String>,
    /// Human-readable message.
    pub message: Option<String>,
}

/// A recognized codes that are safe to retry over HTTP when no bytes
/// have been written downstream yet (§7, "early upstream error events
/// with a recoverable code").
const RECOVERABLE_ERROR_CODES: &[&str] = &[
    "upgrade_required",
    "ws_unsupported",
    "ws_connection_limit",
    "previous_response_not_found",
    "server_error",
];

impl WireError {
    /// Whether this error's code is in the recoverable set.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.code
            .as_deref()
            .is_some_and(|c| RECOVERABLE_ERROR_CODES.contains(&c))
    }

    /// Map this error to an HTTP status code for the non-recoverable,
    /// already-streaming case (§7).
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self.error_type.as_deref() {
            Some("invalid_request_error") => 400,
            Some("authentication_error") => 401,
            Some("permission_error") => 403,
            Some("rate_limit_error") => 429,
            _ => 502,
        }
    }
}

/// A minimal view into a received envelope, enough for the consumer
/// loop to branch without deserializing the full payload twice.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeHeader {
    /// The envelope's `type` field.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The `response.id` field, if present (nested under a top-level
    /// `response` object on most event types).
    #[serde(default)]
    pub response: Option<ResponseIdHolder>,
    /// Top-level error payload, present only on `"error"` events.
    #[serde(default)]
    pub error: Option<WireError>,
}

/// Minimal nested `response` object carrying just the id and model,
/// which is all the consumer loop needs to inspect without a full
/// typed model of every event shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseIdHolder {
    /// Response id, used for sticky binding on completion.
    pub id: Option<String>,
    /// Model name as returned by the upstream (subject to rewrite).
    pub model: Option<String>,
}

impl EnvelopeHeader {
    /// Parse the header fields out of a raw upstream message.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON or does not
    /// carry a `type` field.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// The response id carried by this event, if any.
    #[must_use]
    pub fn response_id(&self) -> Option<&str> {
        self.response.as_ref().and_then(|r| r.id.as_deref())
    }
}

/// HTTP headers sent on the WebSocket upgrade request (§6).
#[derive(Debug, Clone, Default)]
pub struct UpgradeHeaders {
    /// `authorization: Bearer <token>`.
    pub authorization: String,
    /// `openai-beta`, set only for WS transports.
    pub openai_beta: Option<String>,
    /// `originator`.
    pub originator: String,
    /// `chatgpt-account-id`, set only for OAuth accounts.
    pub chatgpt_account_id: Option<String>,
    /// `session_id`.
    pub session_id: String,
    /// `conversation_id`.
    pub conversation_id: String,
    /// `accept-language`.
    pub accept_language: String,
    /// `x-codex-turn-state`, round-tripped from a prior upgrade
    /// response when present.
    pub turn_state: Option<String>,
    /// `x-codex-turn-metadata`.
    pub turn_metadata: Option<String>,
    /// User-Agent, chosen by precedence (account override > forced
    /// default > forwarded from client).
    pub user_agent: String,
}

impl UpgradeHeaders {
    /// Render as an ordered list of `(name, value)` pairs suitable for
    /// a request builder.
    #[must_use]
    pub fn to_header_map(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("authorization".into(), format!("Bearer {}", self.authorization));
        if let Some(beta) = &self.openai_beta {
            headers.insert("openai-beta".into(), beta.clone());
        }
        headers.insert("originator".into(), self.originator.clone());
        if let Some(id) = &self.chatgpt_account_id {
            headers.insert("chatgpt-account-id".into(), id.clone());
        }
        headers.insert("session_id".into(), self.session_id.clone());
        headers.insert("conversation_id".into(), self.conversation_id.clone());
        headers.insert("accept-language".into(), self.accept_language.clone());
        if let Some(state) = &self.turn_state {
            headers.insert("x-codex-turn-state".into(), state.clone());
        }
        if let Some(metadata) = &self.turn_metadata {
            headers.insert("x-codex-turn-metadata".into(), metadata.clone());
        }
        headers.insert("user-agent".into(), self.user_agent.clone());
        headers
    }
}

/// Choose the user-agent by precedence: account override, then a
/// configured forced default, then whatever the client sent.
#[must_use]
pub fn choose_user_agent(
    account_override: Option<&str>,
    forced_default: Option<&str>,
    client_supplied: Option<&str>,
) -> String {
    account_override
        .or(forced_default)
        .or(client_supplied)
        .unwrap_or("oai-ws-gateway")
        .to_string()
}
