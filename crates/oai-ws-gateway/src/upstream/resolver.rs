//! C8: the protocol resolver — a pure decision tree from
//! config/account/cooldown state to a [`Transport`] choice (§4.6).
//!
//! Kept as a single free function with no I/O so the whole decision
//! tree is unit-testable without standing up a pool or dialer.

use std::time::{Duration, Instant};

use crate::external::AccountWsMode;

use super::protocol::Transport;

/// Everything the resolver needs to make a decision, gathered by the
/// caller (the forwarder, C9) before each request.
#[derive(Debug, Clone, Copy)]
pub struct ResolverInput {
    /// Global `ws_v2_enabled` flag.
    pub ws_v2_enabled: bool,
    /// Global `ws_v1_enabled` flag.
    pub ws_v1_enabled: bool,
    /// Per-account WS mode override.
    pub account_ws_mode: AccountWsMode,
    /// Whether this account is currently in a post-failure fallback
    /// cooldown (set by the forwarder after a WS dial/early failure).
    pub in_fallback_cooldown: bool,
    /// When the cooldown started, if any; used only for diagnostics.
    pub cooldown_started_at: Option<Instant>,
    /// Configured cooldown duration.
    pub fallback_cooldown: Duration,
}

/// Why the resolver landed on a given transport, surfaced in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Account forces HTTP regardless of global flags.
    AccountForcesHttp,
    /// Account has WS disabled; `Auto` follows global flags instead.
    AccountWsOff,
    /// Account is cooling down after a recent WS failure.
    FallbackCooldownActive,
    /// WSv2 is enabled globally and for the account.
    WsV2Enabled,
    /// WSv2 is disabled but WSv1 is enabled.
    WsV1Enabled,
    /// Neither WS revision is enabled.
    NoWsEnabled,
}

/// Resolve the transport for one request (§4.6).
#[must_use]
pub fn resolve(input: &ResolverInput) -> (Transport, Reason) {
    if input.account_ws_mode == AccountWsMode::ForceHttp {
        return (Transport::Http, Reason::AccountForcesHttp);
    }

    if input.in_fallback_cooldown {
        let still_cooling = match input.cooldown_started_at {
            Some(started) => started.elapsed() < input.fallback_cooldown,
            None => true,
        };
        if still_cooling {
            return (Transport::Http, Reason::FallbackCooldownActive);
        }
    }

    if input.account_ws_mode == AccountWsMode::Off {
        return (Transport::Http, Reason::AccountWsOff);
    }

    if input.ws_v2_enabled {
        return (Transport::WsV2, Reason::WsV2Enabled);
    }
    if input.ws_v1_enabled {
        return (Transport::WsV1, Reason::WsV1Enabled);
    }
    (Transport::Http, Reason::NoWsEnabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ResolverInput {
        ResolverInput {
            ws_v2_enabled: true,
            ws_v1_enabled: true,
            account_ws_mode: AccountWsMode::Auto,
            in_fallback_cooldown: false,
            cooldown_started_at: None,
            fallback_cooldown: Duration::from_secs(60),
        }
    }

    #[test]
    fn prefers_ws_v2_when_both_enabled() {
        let (transport, reason) = resolve(&base());
        assert_eq!(transport, Transport::WsV2);
        assert_eq!(reason, Reason::WsV2Enabled);
    }

    #[test]
    fn falls_back_to_ws_v1_when_v2_disabled() {
        let mut input = base();
        input.ws_v2_enabled = false;
        let (transport, reason) = resolve(&input);
        assert_eq!(transport, Transport::WsV1);
        assert_eq!(reason, Reason::WsV1Enabled);
    }

    #[test]
    fn http_when_neither_ws_revision_enabled() {
        let mut input = base();
        input.ws_v2_enabled = false;
        input.ws_v1_enabled = false;
        let (transport, reason) = resolve(&input);
        assert_eq!(transport, Transport::Http);
        assert_eq!(reason, Reason::NoWsEnabled);
    }

    #[test]
    fn account_force_http_overrides_everything() {
        let mut input = base();
        input.account_ws_mode = AccountWsMode::ForceHttp;
        input.in_fallback_cooldown = true;
        let (transport, reason) = resolve(&input);
        assert_eq!(transport, Transport::Http);
        assert_eq!(reason, Reason::AccountForcesHttp);
    }

    #[test]
    fn active_cooldown_forces_http() {
        let mut input = base();
        input.in_fallback_cooldown = true;
        input.cooldown_started_at = Some(Instant::now());
        let (transport, reason) = resolve(&input);
        assert_eq!(transport, Transport::Http);
        assert_eq!(reason, Reason::FallbackCooldownActive);
    }

    #[test]
    fn expired_cooldown_no_longer_forces_http() {
        let mut input = base();
        input.in_fallback_cooldown = true;
        input.fallback_cooldown = Duration::from_millis(0);
        input.cooldown_started_at = Some(Instant::now() - Duration::from_secs(1));
        let (transport, _) = resolve(&input);
        assert_eq!(transport, Transport::WsV2);
    }

    #[test]
    fn account_ws_off_follows_global_flags_only_when_auto() {
        let mut input = base();
        input.account_ws_mode = AccountWsMode::Off;
        let (transport, reason) = resolve(&input);
        assert_eq!(transport, Transport::Http);
        assert_eq!(reason, Reason::AccountWsOff);
    }
}
