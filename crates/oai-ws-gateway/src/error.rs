//! Crate-wide error type.
//!
//! Component-local errors ([`crate::upstream::error::DialError`],
//! [`crate::upstream::error::AcquireError`],
//! [`crate::upstream::error::LeaseError`],
//! [`crate::upstream::error::ForwardError`]) carry the fallback/terminal
//! classification described in the error handling design; this type is
//! reserved for failures that precede any of that — configuration and
//! internal-misconfiguration failures that should fail fast rather than
//! be routed through the fallback machinery.

/// Top-level result alias used by configuration and setup code.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Crate-wide error type for configuration and setup failures.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// I/O failure while loading configuration.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal misconfiguration: a required collaborator was not
    /// supplied (nil pool, nil account, empty URL, nil dialer). These
    /// are programmer errors, not request-time failures, and should
    /// fail fast rather than participate in HTTP fallback.
    #[error("internal misconfiguration: {0}")]
    Misconfigured(&'static str),
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}
