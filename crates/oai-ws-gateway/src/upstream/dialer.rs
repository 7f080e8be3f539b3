//! C2: the collaborator that turns a URL and headers into a live
//! [`UpstreamConn`].
//!
//! Kept as a trait so the pool and contexts never depend on
//! `tokio-tungstenite` directly, and so tests can swap in an in-memory
//! fake without a real socket (§8 seed scenarios).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

use super::connection::UpstreamConn;
use super::error::DialError;

/// Everything needed to establish one upstream connection.
#[derive(Debug, Clone)]
pub struct DialRequest {
    /// Upgrade URL, already including any query parameters.
    pub url: String,
    /// Upgrade request headers (authorization, openai-beta, session
    /// identifiers; see [`super::protocol::UpgradeHeaders`]).
    pub headers: HashMap<String, String>,
    /// Account proxy URL, if configured.
    pub proxy_url: Option<String>,
    /// Dial timeout.
    pub timeout: Duration,
}

/// A freshly dialed connection plus the headers the server sent back
/// on the upgrade response (some deployments round-trip turn state
/// through these).
pub struct DialedConn {
    /// The live connection.
    pub conn: Arc<UpstreamConn>,
    /// Response headers captured from the upgrade.
    pub handshake_headers: HashMap<String, String>,
}

/// Establishes upstream WebSocket connections (C2).
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial one upstream connection.
    ///
    /// # Errors
    ///
    /// Returns [`DialError`] on timeout, transport failure, or a
    /// rejected upgrade.
    async fn dial(&self, request: &DialRequest) -> Result<DialedConn, DialError>;
}

/// Default [`Dialer`] backed by `tokio-tungstenite`.
#[derive(Debug, Default)]
pub struct TungsteniteDialer;

#[async_trait]
impl Dialer for TungsteniteDialer {
    async fn dial(&self, request: &DialRequest) -> Result<DialedConn, DialError> {
        let parsed = url::Url::parse(&request.url).map_err(|e| DialError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(DialError::InvalidUrl(format!("unsupported scheme {:?}, expected ws or wss", parsed.scheme())));
        }

        let mut http_request = request
            .url
            .clone()
            .into_client_request()
            .map_err(|e| DialError::InvalidUrl(e.to_string()))?;

        let header_map = http_request.headers_mut();
        for (name, value) in &request.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DialError::InvalidUrl(format!("bad header name {name}: {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| DialError::InvalidUrl(format!("bad header value for {name}: {e}")))?;
            header_map.insert(header_name, header_value);
        }

        let (stream, response) = if let Some(proxy_url) = request.proxy_url.clone() {
            let target_host = parsed
                .host_str()
                .ok_or_else(|| DialError::InvalidUrl("upstream url has no host".into()))?
                .to_string();
            let target_port = parsed
                .port_or_known_default()
                .ok_or_else(|| DialError::InvalidUrl("upstream url has no resolvable port".into()))?;

            let dial_through_proxy = async {
                let tcp_stream = connect_via_proxy(&proxy_url, &target_host, target_port).await?;
                tokio_tungstenite::client_async_tls(http_request, tcp_stream)
                    .await
                    .map_err(classify_connect_error)
            };
            tokio::time::timeout(request.timeout, dial_through_proxy)
                .await
                .map_err(|_| DialError::Timeout)??
        } else {
            tokio::time::timeout(request.timeout, tokio_tungstenite::connect_async(http_request))
                .await
                .map_err(|_| DialError::Timeout)?
                .map_err(classify_connect_error)?
        };

        let handshake_headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(DialedConn {
            conn: Arc::new(UpstreamConn::new(stream)),
            handshake_headers,
        })
    }
}

/// Open a TCP tunnel to `target_host:target_port` through an HTTP
/// forward proxy via `CONNECT`, per the account's configured
/// `proxy_url` (§2, §4.2 "optional proxy URL"). The returned stream is
/// handed straight to `tokio_tungstenite::client_async_tls`, which
/// performs the WS upgrade (and TLS handshake, for `wss`) over it
/// exactly as it would over a direct connection.
async fn connect_via_proxy(proxy_url: &str, target_host: &str, target_port: u16) -> Result<TcpStream, DialError> {
    let proxy = url::Url::parse(proxy_url).map_err(|e| DialError::ProxyConnectFailed(format!("bad proxy url: {e}")))?;
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| DialError::ProxyConnectFailed("proxy url has no host".into()))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(1080);

    let mut stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|e| DialError::ProxyConnectFailed(e.to_string()))?;

    let mut request = format!("CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n");
    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or(""));
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| DialError::ProxyConnectFailed(e.to_string()))?;

    let status_line = read_connect_response(&mut stream).await?;
    let status_ok = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code == "200");
    if !status_ok {
        return Err(DialError::ProxyConnectFailed(format!("proxy rejected CONNECT: {}", status_line.trim())));
    }

    Ok(stream)
}

/// Read the proxy's `CONNECT` response one byte at a time, stopping
/// exactly at the blank line terminating the headers so no tunnel
/// bytes belonging to the caller's own protocol are consumed. Returns
/// the status line.
async fn read_connect_response(stream: &mut TcpStream) -> Result<String, DialError> {
    const MAX_RESPONSE_BYTES: usize = 8192;

    let mut response = Vec::new();
    let mut byte = [0_u8; 1];
    loop {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| DialError::ProxyConnectFailed(e.to_string()))?;
        if n == 0 {
            return Err(DialError::ProxyConnectFailed("proxy closed connection during CONNECT".into()));
        }
        response.push(byte[0]);
        if response.ends_with(b"\r\n\r\n") {
            break;
        }
        if response.len() > MAX_RESPONSE_BYTES {
            return Err(DialError::ProxyConnectFailed("proxy CONNECT response too large".into()));
        }
    }

    let status_line = response
        .split(|&b| b == b'\n')
        .next()
        .unwrap_or(&[]);
    Ok(String::from_utf8_lossy(status_line).trim().to_string())
}

fn classify_connect_error(err: tokio_tungstenite::tungstenite::Error) -> DialError {
    if let tokio_tungstenite::tungstenite::Error::Http(response) = &err {
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        return DialError::UpgradeRejected { status, headers };
    }
    err.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn dial_request_carries_proxy_as_optional() {
        let req = DialRequest {
            url: "wss://example.test/v1/responses".into(),
            headers: HashMap::new(),
            proxy_url: None,
            timeout: Duration::from_secs(10),
        };
        assert!(req.proxy_url.is_none());
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_before_connecting() {
        let dialer = TungsteniteDialer;
        let request = DialRequest {
            url: "not a url".into(),
            headers: HashMap::new(),
            proxy_url: None,
            timeout: Duration::from_secs(1),
        };
        let err = dialer.dial(&request).await.unwrap_err();
        assert!(matches!(err, DialError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn http_scheme_is_rejected_before_connecting() {
        let dialer = TungsteniteDialer;
        let request = DialRequest {
            url: "https://example.test/v1/responses".into(),
            headers: HashMap::new(),
            proxy_url: None,
            timeout: Duration::from_secs(1),
        };
        let err = dialer.dial(&request).await.unwrap_err();
        assert!(matches!(err, DialError::InvalidUrl(_)));
    }

    async fn drain_connect_request(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = [0_u8; 1024];
        let mut total = Vec::new();
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            total.extend_from_slice(&buf[..n]);
            if total.ends_with(b"\r\n\r\n") {
                return total;
            }
        }
    }

    #[tokio::test]
    async fn proxy_connect_tunnels_through_to_the_upgrade() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = drain_connect_request(&mut stream).await;
            stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.unwrap();
            let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        });

        let dialer = TungsteniteDialer;
        let request = DialRequest {
            url: "ws://example.test/v1/responses".into(),
            headers: HashMap::new(),
            proxy_url: Some(format!("http://{addr}")),
            timeout: Duration::from_secs(5),
        };
        let dialed = dialer.dial(&request).await.unwrap();
        dialed.conn.close().await;
    }

    #[tokio::test]
    async fn proxy_connect_sends_proxy_authorization_when_credentials_present() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let total = drain_connect_request(&mut stream).await;
            stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&total).to_string());
        });

        let proxy_url = format!("http://user:pass@{addr}");
        connect_via_proxy(&proxy_url, "example.test", 443).await.unwrap();
        let request_text = rx.await.unwrap();
        assert!(request_text.contains("CONNECT example.test:443"));
        assert!(request_text.contains("Proxy-Authorization: Basic"));
    }

    #[tokio::test]
    async fn proxy_connect_rejection_is_a_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = drain_connect_request(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let proxy_url = format!("http://{addr}");
        let err = connect_via_proxy(&proxy_url, "example.test", 443).await.unwrap_err();
        assert!(matches!(err, DialError::ProxyConnectFailed(_)));
    }
}
