//! C9b: the pump goroutine — relays messages off one leased upstream
//! connection into a bounded channel for the forwarder's consumer loop
//! to drive (§4.7, "Pump goroutine").

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::lease::Lease;
use super::protocol::{is_error_event, is_terminal_event, EnvelopeHeader};

/// Bounded channel capacity between the pump and the consumer loop
/// (§4.7, "bounded channel (capacity 16)").
const PUMP_CHANNEL_CAPACITY: usize = 16;

/// One upstream message, already header-parsed so the consumer loop
/// never reparses the same bytes twice.
pub struct PumpMessage {
    /// Raw JSON text as received.
    pub raw: String,
    /// Parsed envelope header (`type`, `response`, `error`).
    pub header: EnvelopeHeader,
}

/// Why the pump stopped relaying messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// A terminal event was relayed; the response is complete.
    Terminal,
    /// An `"error"` event was relayed.
    Error,
    /// The upstream connection failed or closed mid-stream.
    Io,
    /// The pump's cancellation token fired (drain deadline, or the
    /// consumer loop stopped reading).
    Cancelled,
}

/// Spawn the pump as its own task, reading from `lease` until a
/// terminal/error event, an IO failure, or `cancel` fires.
///
/// Returns the receiving half of the output channel and a handle
/// resolving to [`PumpExit`]. The channel is closed (sender dropped)
/// whenever the task returns, so the consumer loop's `recv` naturally
/// observes end-of-stream.
pub fn spawn_pump(lease: Arc<Lease>, cancel: CancellationToken) -> (mpsc::Receiver<PumpMessage>, JoinHandle<PumpExit>) {
    let (tx, rx) = mpsc::channel(PUMP_CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        loop {
            let read = tokio::select! {
                () = cancel.cancelled() => return PumpExit::Cancelled,
                read = lease.read_message_timeout() => read,
            };

            let raw = match read {
                Ok(Some(raw)) => raw,
                Ok(None) => return PumpExit::Io,
                Err(_) => return PumpExit::Io,
            };

            let header = match EnvelopeHeader::parse(&raw) {
                Ok(header) => header,
                // Malformed frames are dropped rather than treated as
                // a hard IO failure; a well-behaved upstream will not
                // send them, and surfacing a whole-request failure
                // over one bad frame is worse than skipping it.
                Err(_) => continue,
            };

            let is_terminal = is_terminal_event(&header.event_type);
            let is_error = is_error_event(&header.event_type);

            if tx.send(PumpMessage { raw, header }).await.is_err() {
                return PumpExit::Cancelled;
            }

            if is_terminal {
                return PumpExit::Terminal;
            }
            if is_error {
                return PumpExit::Error;
            }
        }
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::context::UpstreamContext;
    use crate::upstream::dialer::{DialRequest, DialedConn, Dialer};
    use crate::upstream::error::DialError;
    use crate::upstream::sticky::StickyLevel;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    struct ScriptedDialer {
        messages: Vec<&'static str>,
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(&self, _request: &DialRequest) -> Result<DialedConn, DialError> {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let messages = self.messages.clone();
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                use futures::SinkExt;
                for message in messages {
                    let _ = ws.send(Message::Text(message.into())).await;
                }
            });
            let url = format!("ws://{addr}/");
            let (stream, _) = tokio_tungstenite::connect_async(url).await.map_err(DialError::from)?;
            Ok(DialedConn {
                conn: Arc::new(super::super::connection::UpstreamConn::new(stream)),
                handshake_headers: HashMap::new(),
            })
        }
    }

    async fn leased_context(messages: Vec<&'static str>) -> Arc<Lease> {
        let ctx = Arc::new(UpstreamContext::new("sess".into(), "fp".into(), Duration::from_secs(60)));
        let dialer = ScriptedDialer { messages };
        let cancel = CancellationToken::new();
        ctx.ensure_upstream(&dialer, "placeholder", &HashMap::new(), Duration::from_secs(5), None, Duration::from_secs(60), &cancel)
            .await
            .unwrap();
        let conn_id = ctx.conn_id().unwrap();
        Arc::new(Lease::new(
            ctx,
            "owner".into(),
            conn_id,
            Duration::from_secs(60),
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5),
            super::super::lease::LeaseMetadata {
                queue_wait: Duration::ZERO,
                conn_pick: Duration::ZERO,
                reused: false,
                schedule_layer: super::super::lease::ScheduleLayer::L1NewContext,
                stickiness: StickyLevel::Weak,
                migration_used: false,
            },
        ))
    }

    #[tokio::test]
    async fn pump_exits_on_terminal_event() {
        let lease = leased_context(vec![
            r#"{"type":"response.created"}"#,
            r#"{"type":"response.completed","response":{"id":"resp_1"}}"#,
        ])
        .await;
        let (mut rx, handle) = spawn_pump(lease, CancellationToken::new());
        let first = rx.recv().await.unwrap();
        assert_eq!(first.header.event_type, "response.created");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.header.event_type, "response.completed");
        assert!(rx.recv().await.is_none());
        assert_eq!(handle.await.unwrap(), PumpExit::Terminal);
    }

    #[tokio::test]
    async fn pump_exits_on_error_event() {
        let lease = leased_context(vec![r#"{"type":"error","error":{"code":"server_error"}}"#]).await;
        let (mut rx, handle) = spawn_pump(lease, CancellationToken::new());
        let message = rx.recv().await.unwrap();
        assert_eq!(message.header.event_type, "error");
        assert_eq!(handle.await.unwrap(), PumpExit::Error);
    }

    #[tokio::test]
    async fn pump_exits_on_cancellation() {
        let lease = leased_context(vec![]).await;
        let cancel = CancellationToken::new();
        let (mut rx, handle) = spawn_pump(lease, cancel.clone());
        cancel.cancel();
        assert!(rx.recv().await.is_none());
        assert_eq!(handle.await.unwrap(), PumpExit::Cancelled);
    }
}
