//! The upstream connection pool: dialing, pooling, sticky routing, and
//! forwarding for the OpenAI-compatible Responses WebSocket API.
//!
//! Submodules map directly onto the component breakdown:
//!
//! - [`connection`] — C1, one live WS transport
//! - [`dialer`] — C2, establishes connections
//! - [`context`] — C3, a reusable upstream slot
//! - [`account_pool`] — C4, one account's contexts + migration scoring
//! - [`pool`] — C5, `Acquire`/`Release` + the background sweeper
//! - [`lease`] — C6, the RAII handle returned by `Acquire`
//! - [`sticky`] — C7, response/session routing state
//! - [`resolver`] — C8, the WS/HTTP transport decision tree
//! - [`forwarder`] and [`pump`] — C9, request forwarding + event relay

pub mod account_pool;
pub mod connection;
pub mod context;
pub mod dialer;
pub mod error;
pub mod forwarder;
pub mod lease;
pub mod pool;
pub mod protocol;
pub mod pump;
pub mod resolver;
pub mod sticky;
