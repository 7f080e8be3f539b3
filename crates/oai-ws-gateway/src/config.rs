//! Gateway configuration.

use crate::error::GatewayResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the sticky-routing store behaves when `store` is disabled on
/// the client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreDisabledConnMode {
    /// Always require an exact session→conn hit; never fall back.
    Strict,
    /// Prefer the session→conn hit but tolerate a miss.
    Adaptive,
    /// Ignore the session→conn mapping entirely.
    Off,
}

impl Default for StoreDisabledConnMode {
    fn default() -> Self {
        Self::Adaptive
    }
}

/// Main gateway configuration.
///
/// Loaded the way the daemon layer this crate was generalized from
/// loads its own config: `serde` with a `#[serde(default = "fn")]`
/// per field, a matching [`Default`] impl, and a `load`/`from_toml_str`
/// pair of constructors rather than a hand-rolled parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Idle TTL for upstream contexts (`sticky_session_ttl_seconds`).
    pub sticky_session_ttl_seconds: u64,

    /// Proactive rotation age for upstream connections; `0` disables
    /// rotation entirely (`upstream_conn_max_age_seconds`).
    pub upstream_conn_max_age_seconds: u64,

    /// Hard cap on live connections per account, independent of the
    /// account's own concurrency limit (`max_conns_per_account`).
    pub max_conns_per_account: u32,

    /// Background sweeper tick interval.
    pub sweeper_interval_seconds: u64,

    /// Delay before the one-shot post-Yield ping probe fires
    /// (`Lease::yield`, §4.2 "Delayed ping scheduling").
    pub delayed_ping_seconds: u64,

    /// IO timeout for a single ping probe — shared by the sweeper's
    /// idle-conn probe and the post-Yield delayed probe.
    pub ping_timeout_seconds: u64,

    /// Sweeper ping concurrency cap.
    pub sweeper_ping_concurrency: usize,

    /// Number of events buffered downstream before micro-batch flush
    /// (`event_flush_batch_size`).
    pub event_flush_batch_size: usize,

    /// Micro-batch flush interval in milliseconds
    /// (`event_flush_interval_ms`).
    pub event_flush_interval_ms: u64,

    /// Fraction of request/response payloads sampled into redacted
    /// debug logs, in `[0.0, 1.0]` (`payload_log_sample_rate`).
    pub payload_log_sample_rate: f64,

    /// Per-read timeout on the upstream connection.
    pub read_timeout_seconds: u64,

    /// Per-write timeout on the upstream connection.
    pub write_timeout_seconds: u64,

    /// Dial timeout for establishing a new upstream connection.
    pub dial_timeout_seconds: u64,

    /// Drain deadline after a client disconnects mid-stream.
    pub drain_deadline_seconds: u64,

    /// Whether optional prewarm (`generate: false`) requests are sent.
    pub prewarm_generate_enabled: bool,

    /// Consecutive prewarm failures before prewarm is suppressed for
    /// a cooldown window.
    pub prewarm_failure_threshold: u32,

    /// Cooldown window after prewarm is suppressed.
    pub prewarm_cooldown_seconds: u64,

    /// Default for whether OAuth accounts may opt into store-based
    /// response recovery (`allow_store_recovery`).
    pub allow_store_recovery: bool,

    /// Session→conn lookup behavior when the client disables `store`.
    pub store_disabled_conn_mode: StoreDisabledConnMode,

    /// Cooldown after a WS failure before the protocol resolver will
    /// retry WS for the same account (`fallback_cooldown_seconds`).
    pub fallback_cooldown_seconds: u64,

    /// Global WSv2 enable flag.
    pub ws_v2_enabled: bool,

    /// Global WSv1 enable flag.
    pub ws_v1_enabled: bool,

    /// TTL for response-id sticky bindings.
    pub response_sticky_ttl_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sticky_session_ttl_seconds: default_sticky_ttl(),
            upstream_conn_max_age_seconds: default_conn_max_age(),
            max_conns_per_account: default_max_conns_per_account(),
            sweeper_interval_seconds: default_sweeper_interval(),
            delayed_ping_seconds: default_delayed_ping(),
            ping_timeout_seconds: default_ping_timeout(),
            sweeper_ping_concurrency: default_sweeper_ping_concurrency(),
            event_flush_batch_size: default_event_flush_batch_size(),
            event_flush_interval_ms: default_event_flush_interval_ms(),
            payload_log_sample_rate: 0.0,
            read_timeout_seconds: default_read_timeout(),
            write_timeout_seconds: default_write_timeout(),
            dial_timeout_seconds: default_dial_timeout(),
            drain_deadline_seconds: default_drain_deadline(),
            prewarm_generate_enabled: false,
            prewarm_failure_threshold: default_prewarm_failure_threshold(),
            prewarm_cooldown_seconds: default_prewarm_cooldown(),
            allow_store_recovery: false,
            store_disabled_conn_mode: StoreDisabledConnMode::default(),
            fallback_cooldown_seconds: default_fallback_cooldown(),
            ws_v2_enabled: true,
            ws_v1_enabled: true,
            response_sticky_ttl_seconds: default_response_sticky_ttl(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from an in-memory TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed or fails
    /// [`Self::validate`].
    pub fn from_toml_str(contents: &str) -> GatewayResult<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check field values that `serde` cannot enforce on its
    /// own (ranges, non-zero requirements). Called by
    /// [`Self::from_toml_str`]; callers building a [`GatewayConfig`]
    /// programmatically should call it too.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::GatewayError::Config`] describing the
    /// first invalid field found.
    pub fn validate(&self) -> GatewayResult<()> {
        if !(0.0..=1.0).contains(&self.payload_log_sample_rate) {
            return Err(crate::error::GatewayError::Config(
                "payload_log_sample_rate must be within [0.0, 1.0]".into(),
            ));
        }
        if self.max_conns_per_account == 0 {
            return Err(crate::error::GatewayError::Config("max_conns_per_account must be non-zero".into()));
        }
        if self.sweeper_ping_concurrency == 0 {
            return Err(crate::error::GatewayError::Config("sweeper_ping_concurrency must be non-zero".into()));
        }
        if self.event_flush_batch_size == 0 {
            return Err(crate::error::GatewayError::Config("event_flush_batch_size must be non-zero".into()));
        }
        if !self.ws_v2_enabled && !self.ws_v1_enabled {
            tracing::warn!("both ws_v2_enabled and ws_v1_enabled are false; all traffic will use HTTP");
        }
        Ok(())
    }

    /// `sticky_session_ttl_seconds` as a [`Duration`].
    #[must_use]
    pub fn sticky_session_ttl(&self) -> Duration {
        Duration::from_secs(self.sticky_session_ttl_seconds)
    }

    /// `upstream_conn_max_age_seconds` as a [`Duration`], or `None` if
    /// age-based rotation is disabled.
    #[must_use]
    pub fn upstream_conn_max_age(&self) -> Option<Duration> {
        (self.upstream_conn_max_age_seconds > 0)
            .then(|| Duration::from_secs(self.upstream_conn_max_age_seconds))
    }

    /// `read_timeout_seconds` as a [`Duration`].
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    /// `write_timeout_seconds` as a [`Duration`].
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }

    /// `dial_timeout_seconds` as a [`Duration`].
    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_seconds)
    }

    /// `drain_deadline_seconds` as a [`Duration`].
    #[must_use]
    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.drain_deadline_seconds)
    }

    /// `delayed_ping_seconds` as a [`Duration`]: how long `Lease::yield`
    /// waits before firing its one-shot probe.
    #[must_use]
    pub fn delayed_ping_delay(&self) -> Duration {
        Duration::from_secs(self.delayed_ping_seconds.max(1))
    }

    /// `ping_timeout_seconds` as a [`Duration`].
    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_seconds.max(1))
    }

    /// Effective hard cap for a given account concurrency, combining
    /// `max_conns_per_account` with the account's own limit (§3,
    /// "effective capacity = min(dynamicCap, hardCap)").
    #[must_use]
    pub fn hard_cap(&self, account_concurrency: u32) -> u32 {
        account_concurrency.min(self.max_conns_per_account)
    }
}

fn default_sticky_ttl() -> u64 {
    120
}

fn default_conn_max_age() -> u64 {
    55 * 60
}

fn default_max_conns_per_account() -> u32 {
    8
}

fn default_sweeper_interval() -> u64 {
    30
}

fn default_delayed_ping() -> u64 {
    5
}

fn default_ping_timeout() -> u64 {
    5
}

fn default_sweeper_ping_concurrency() -> usize {
    10
}

fn default_event_flush_batch_size() -> usize {
    8
}

fn default_event_flush_interval_ms() -> u64 {
    25
}

fn default_read_timeout() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    10
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_drain_deadline() -> u64 {
    5
}

fn default_prewarm_failure_threshold() -> u32 {
    5
}

fn default_prewarm_cooldown() -> u64 {
    120
}

fn default_fallback_cooldown() -> u64 {
    60
}

fn default_response_sticky_ttl() -> u64 {
    600
}
