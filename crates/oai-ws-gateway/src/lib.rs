//! `oai-ws-gateway` — WebSocket ingress gateway core for an OpenAI-compatible
//! Responses API.
//!
//! This crate multiplexes many client requests over a bounded pool of
//! long-lived upstream WebSocket connections, with sticky-session
//! affinity, graceful fallback to HTTP, and failure-aware scheduling.
//! It does not implement authentication, account administration,
//! billing, or usage persistence — those are expected to live in the
//! surrounding service and are consumed here only through the narrow
//! traits in [`external`].
//!
//! # Architecture
//!
//! ```text
//! oai-ws-gateway
//! ├── upstream::connection   (C1 — one WS transport, independent read/write)
//! ├── upstream::dialer       (C2 — produces connections)
//! ├── upstream::context      (C3 — one logical per-session slot)
//! ├── upstream::account_pool (C4 — per-account collection of contexts)
//! ├── upstream::pool         (C5 — Acquire/Release, background sweeper)
//! ├── upstream::lease        (C6 — RAII handle returned by Acquire)
//! ├── upstream::sticky       (C7 — response-id / session sticky routing)
//! ├── upstream::resolver     (C8 — WSv2 / WSv1 / HTTP transport decision)
//! └── upstream::{forwarder, pump} (C9 — per-request state machine)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use oai_ws_gateway::upstream::dialer::TungsteniteDialer;
//! use oai_ws_gateway::{GatewayConfig, IngressContextPool};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::load("gateway.toml")?;
//!     let dialer = Arc::new(TungsteniteDialer);
//!     let pool = Arc::new(IngressContextPool::new(dialer, config));
//!     pool.clone().spawn_sweeper();
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod error;
pub mod external;
pub mod health;
pub mod telemetry;
pub mod upstream;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use health::{HealthCheck, HealthState, HealthStatus};
pub use upstream::forwarder::{ForwardRequest, Forwarder};
pub use upstream::lease::Lease;
pub use upstream::pool::IngressContextPool;
