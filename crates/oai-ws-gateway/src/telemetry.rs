//! Structured logging setup.
//!
//! The gateway core never installs a global subscriber implicitly —
//! that decision belongs to whatever binary embeds it — but it exposes
//! the same `tracing-subscriber` wiring the daemon layer it was
//! generalized from uses, so embedders get one obvious way to do it.

use tracing_subscriber::EnvFilter;

/// Initialize a global `tracing` subscriber from `RUST_LOG` (or
/// `default_directive` if unset), emitting JSON lines to stdout.
///
/// Returns an error if a global subscriber is already installed.
///
/// # Errors
///
/// Returns an error if a subscriber has already been set for this
/// process.
pub fn init_tracing(default_directive: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_does_not_panic_when_called_once() {
        // A second call in the same process would return Err (subscriber
        // already set), which is expected and not asserted here since
        // test execution order isn't guaranteed.
        let _ = init_tracing("oai_ws_gateway=info");
    }
}
