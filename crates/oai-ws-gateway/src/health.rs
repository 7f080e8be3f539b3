//! Health checks for the gateway's ingress context pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Overall health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    /// All systems healthy.
    Healthy,
    /// Some non-critical issues.
    Degraded,
    /// Critical issues.
    Unhealthy,
    /// Unknown state.
    Unknown,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of a single health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Name of the component being checked.
    pub component: String,

    /// Health state.
    pub state: HealthState,

    /// Human-readable message.
    pub message: Option<String>,

    /// Check duration.
    pub duration_ms: u64,

    /// When this check was performed.
    pub checked_at: DateTime<Utc>,

    /// Additional details.
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl HealthCheck {
    /// Create a healthy check result.
    #[must_use]
    pub fn healthy(component: impl Into<String>, duration: Duration) -> Self {
        Self {
            component: component.into(),
            state: HealthState::Healthy,
            message: None,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            checked_at: Utc::now(),
            details: HashMap::new(),
        }
    }

    /// Create an unhealthy check result.
    #[must_use]
    pub fn unhealthy(
        component: impl Into<String>,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            component: component.into(),
            state: HealthState::Unhealthy,
            message: Some(message.into()),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            checked_at: Utc::now(),
            details: HashMap::new(),
        }
    }

    /// Create a degraded check result.
    #[must_use]
    pub fn degraded(
        component: impl Into<String>,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            component: component.into(),
            state: HealthState::Degraded,
            message: Some(message.into()),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            checked_at: Utc::now(),
            details: HashMap::new(),
        }
    }

    /// Add a detail.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }
}

/// Overall health status of the ingress context pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall state.
    pub state: HealthState,

    /// When this status was computed.
    pub checked_at: DateTime<Utc>,

    /// Individual check results.
    pub checks: Vec<HealthCheck>,
}

impl HealthStatus {
    /// Create a new health status from check results.
    #[must_use]
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let state = Self::aggregate_state(&checks);
        Self {
            state,
            checked_at: Utc::now(),
            checks,
        }
    }

    fn aggregate_state(checks: &[HealthCheck]) -> HealthState {
        if checks.is_empty() {
            return HealthState::Unknown;
        }
        let has_unhealthy = checks.iter().any(|c| c.state == HealthState::Unhealthy);
        let has_degraded = checks.iter().any(|c| c.state == HealthState::Degraded);
        if has_unhealthy {
            HealthState::Unhealthy
        } else if has_degraded {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    /// Whether overall state is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

/// Snapshot of pool-wide counters used to derive [`HealthStatus`].
///
/// Populated by [`crate::upstream::pool::IngressContextPool::snapshot`];
/// kept as plain data so it can be constructed in tests without a real
/// pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolSnapshot {
    /// Number of account pools currently tracked.
    pub account_count: usize,
    /// Total live contexts across all accounts.
    pub context_count: usize,
    /// Total contexts currently marked broken.
    pub broken_count: usize,
    /// Seconds since the sweeper last completed a pass, if it has run.
    pub seconds_since_last_sweep: Option<u64>,
    /// Configured sweeper interval, used to judge staleness.
    pub sweeper_interval_seconds: u64,
}

/// Evaluate pool health from a snapshot of its counters.
#[must_use]
pub fn evaluate_pool_health(snapshot: PoolSnapshot) -> HealthStatus {
    let mut checks = Vec::new();

    let sweeper_check = match snapshot.seconds_since_last_sweep {
        None => HealthCheck::degraded("sweeper", "sweeper has not completed a pass yet", Duration::ZERO),
        Some(secs) if secs > snapshot.sweeper_interval_seconds.saturating_mul(3).max(1) => {
            HealthCheck::unhealthy(
                "sweeper",
                format!("sweeper has not run in {secs}s"),
                Duration::ZERO,
            )
        }
        Some(secs) => {
            HealthCheck::healthy("sweeper", Duration::ZERO).with_detail("seconds_since_last_sweep", secs)
        }
    };
    checks.push(sweeper_check);

    let broken_ratio_check = if snapshot.context_count == 0 {
        HealthCheck::healthy("contexts", Duration::ZERO).with_detail("context_count", 0)
    } else {
        let ratio = snapshot.broken_count as f64 / snapshot.context_count as f64;
        if ratio >= 0.5 {
            HealthCheck::unhealthy(
                "contexts",
                format!("{}/{} contexts broken", snapshot.broken_count, snapshot.context_count),
                Duration::ZERO,
            )
        } else if ratio > 0.0 {
            HealthCheck::degraded(
                "contexts",
                format!("{}/{} contexts broken", snapshot.broken_count, snapshot.context_count),
                Duration::ZERO,
            )
        } else {
            HealthCheck::healthy("contexts", Duration::ZERO)
                .with_detail("context_count", snapshot.context_count)
        }
    };
    checks.push(broken_ratio_check);

    checks.push(
        HealthCheck::healthy("accounts", Duration::ZERO).with_detail("account_count", snapshot.account_count),
    );

    HealthStatus::from_checks(checks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_display() {
        assert_eq!(HealthState::Healthy.to_string(), "healthy");
        assert_eq!(HealthState::Degraded.to_string(), "degraded");
        assert_eq!(HealthState::Unhealthy.to_string(), "unhealthy");
    }

    #[test]
    fn healthy_snapshot_is_healthy() {
        let snapshot = PoolSnapshot {
            account_count: 2,
            context_count: 4,
            broken_count: 0,
            seconds_since_last_sweep: Some(5),
            sweeper_interval_seconds: 30,
        };
        let status = evaluate_pool_health(snapshot);
        assert!(status.is_healthy());
    }

    #[test]
    fn majority_broken_is_unhealthy() {
        let snapshot = PoolSnapshot {
            account_count: 1,
            context_count: 4,
            broken_count: 3,
            seconds_since_last_sweep: Some(5),
            sweeper_interval_seconds: 30,
        };
        let status = evaluate_pool_health(snapshot);
        assert_eq!(status.state, HealthState::Unhealthy);
    }

    #[test]
    fn stale_sweeper_is_unhealthy() {
        let snapshot = PoolSnapshot {
            account_count: 1,
            context_count: 1,
            broken_count: 0,
            seconds_since_last_sweep: Some(10_000),
            sweeper_interval_seconds: 30,
        };
        let status = evaluate_pool_health(snapshot);
        assert_eq!(status.state, HealthState::Unhealthy);
    }

    #[test]
    fn never_swept_is_degraded_not_unhealthy() {
        let snapshot = PoolSnapshot {
            account_count: 0,
            context_count: 0,
            broken_count: 0,
            seconds_since_last_sweep: None,
            sweeper_interval_seconds: 30,
        };
        let status = evaluate_pool_health(snapshot);
        assert_eq!(status.state, HealthState::Degraded);
    }
}
