//! C1: one upstream WebSocket transport with independent read and
//! write halves.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::error::LeaseError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A live upstream WebSocket connection.
///
/// The reader and writer halves are behind independent locks, so a
/// background ping and a long-running read never contend with each
/// other — WS is full-duplex, and serializing read/write would let
/// probes starve behind long reads (§5, §9).
pub struct UpstreamConn {
    writer: Mutex<SplitSink<WsStream, Message>>,
    reader: Mutex<SplitStream<WsStream>>,
}

impl UpstreamConn {
    pub(crate) fn new(stream: WsStream) -> Self {
        let (writer, reader) = stream.split();
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        }
    }

    /// Serialize `value` and send it as a text frame.
    pub async fn send_json(&self, value: &serde_json::Value) -> Result<(), LeaseError> {
        let text = serde_json::to_string(value)?;
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Receive the next text message, skipping control frames.
    ///
    /// Returns `Ok(None)` when the peer closes cleanly.
    pub async fn recv(&self) -> Result<Option<String>, LeaseError> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_),
                )) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    /// Send a ping frame, used by the background sweeper's idle-conn
    /// health probe.
    pub async fn ping(&self) -> Result<(), LeaseError> {
        let mut writer = self.writer.lock().await;
        writer.send(Message::Ping(Vec::new().into())).await?;
        Ok(())
    }

    /// Send a close frame. Best-effort: errors are swallowed, since
    /// callers close connections they are already discarding.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
    }
}
