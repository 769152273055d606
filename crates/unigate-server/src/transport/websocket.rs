//! WebSocket listener and transport using tokio-tungstenite.
//!
//! Clients present their bearer token during the upgrade, either as an
//! `Authorization: Bearer <token>` header or a `?token=<token>` query
//! parameter. Clients that cannot set either send an `AUTH` message first.
//!
//! A plain `GET /health` on the same port is answered with a small JSON
//! liveness response instead of an upgrade.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use unigate_core::{
    now_millis, AuthToken, GateError, GateResult, Transport, TransportFuture, MAX_ENVELOPE_SIZE,
};

/// Hard ceiling on a single WebSocket message. Anything between
/// `MAX_ENVELOPE_SIZE` and this reaches the codec and is rejected per
/// message; anything larger is a transport error.
const MAX_WS_MESSAGE_SIZE: usize = 4 * MAX_ENVELOPE_SIZE;

/// An accepted, upgraded WebSocket connection.
pub struct WebSocketTransport {
    ws: WebSocketStream<TcpStream>,
    remote_addr: SocketAddr,
    credential: Option<AuthToken>,
}

impl WebSocketTransport {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields upgraded connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> GateResult<mpsc::Receiver<WebSocketTransport>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GateError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketTransport>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let Some(stream) = answer_health(stream).await else {
                            debug!(remote = %addr, "health check answered");
                            return;
                        };
                        match upgrade(stream, addr).await {
                            Ok(transport) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                if tx.send(transport).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

/// Serve `GET /health` directly on the socket. Any other request is handed
/// back untouched for the WebSocket upgrade.
async fn answer_health(mut stream: TcpStream) -> Option<TcpStream> {
    let mut head = [0u8; 16];
    let n = stream.peek(&mut head).await.ok()?;
    if !is_health_request(&head[..n]) {
        return Some(stream);
    }

    // Consume the request so closing does not reset the connection.
    let mut request = [0u8; 1024];
    let _ = stream.read(&mut request).await;

    let body = json!({
        "status": "ok",
        "timestamp": now_millis(),
        "version": env!("CARGO_PKG_VERSION"),
    })
    .to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(error = %e, "health response failed");
    }
    let _ = stream.shutdown().await;
    None
}

fn is_health_request(head: &[u8]) -> bool {
    head.starts_with(b"GET /health ") || head.starts_with(b"GET /health?")
}

async fn upgrade(stream: TcpStream, remote_addr: SocketAddr) -> GateResult<WebSocketTransport> {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_WS_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_WS_MESSAGE_SIZE);

    let mut credential = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        credential = token_from_request(request);
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config))
        .await
        .map_err(|e| GateError::Transport(format!("WS upgrade failed: {e}")))?;

    Ok(WebSocketTransport {
        ws,
        remote_addr,
        credential,
    })
}

/// Bearer token from the upgrade request: header first, then query string.
fn token_from_request(request: &Request) -> Option<AuthToken> {
    let from_header = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = from_header {
        return Some(AuthToken::new(token));
    }

    request
        .uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|token| !token.is_empty())
        .map(AuthToken::new)
}

fn is_closed(e: &WsError) -> bool {
    matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

impl Transport for WebSocketTransport {
    /// Text and binary messages are both accepted; control frames are
    /// handled here and never surface.
    fn recv(&mut self) -> TransportFuture<'_, Option<Vec<u8>>> {
        Box::pin(async move {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
                    Some(Ok(Message::Binary(data))) => return Ok(Some(data.to_vec())),
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = self.ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) if is_closed(&e) => return Ok(None),
                    Some(Err(e)) => {
                        return Err(GateError::Transport(format!("WS recv failed: {e}")));
                    }
                    None => {
                        return Err(GateError::Transport(
                            "WS stream ended without close".to_string(),
                        ))
                    }
                }
            }
        })
    }

    fn send<'a>(&'a mut self, data: &'a [u8]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            // Encoded envelopes are JSON, so they go out as text frames.
            let message = match std::str::from_utf8(data) {
                Ok(text) => Message::Text(text.to_string().into()),
                Err(_) => Message::Binary(data.to_vec().into()),
            };
            self.ws
                .send(message)
                .await
                .map_err(|e| GateError::Transport(format!("WS send failed: {e}")))
        })
    }

    fn close<'a>(&'a mut self, code: u16, reason: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            };
            match self.ws.close(Some(frame)).await {
                Ok(()) => Ok(()),
                Err(e) if is_closed(&e) => Ok(()),
                Err(e) => Err(GateError::Transport(format!("WS close failed: {e}"))),
            }
        })
    }

    fn credential(&self) -> Option<AuthToken> {
        self.credential.clone()
    }

    /// Peer IP; auth attempts are throttled per address, not per port.
    fn peer(&self) -> String {
        self.remote_addr.ip().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = auth {
            builder = builder.header("Authorization", value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn bearer_header_wins() {
        let req = request("/ws?token=from-query", Some("Bearer from-header"));
        assert_eq!(token_from_request(&req).unwrap().as_str(), "from-header");
    }

    #[test]
    fn query_token_is_used_without_header() {
        let req = request("/ws?room=1&token=abc.123.def", None);
        assert_eq!(token_from_request(&req).unwrap().as_str(), "abc.123.def");
    }

    #[test]
    fn health_request_line_is_recognized() {
        assert!(is_health_request(b"GET /health HTTP/1.1\r\n"));
        assert!(is_health_request(b"GET /health?full=1 HTTP/1.1"));
        assert!(!is_health_request(b"GET /healthz HTTP/1.1"));
        assert!(!is_health_request(b"GET /ws?token=abc HTTP/1.1"));
        assert!(!is_health_request(b"POST /health HTTP/1.1"));
    }

    #[tokio::test]
    async fn health_check_is_answered_without_upgrade() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            response
        });

        let (stream, _) = listener.accept().await.unwrap();
        assert!(answer_health(stream).await.is_none());

        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let body: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn upgrade_requests_pass_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n")
            .await
            .unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = answer_health(stream).await.unwrap();
        // Nothing was consumed.
        let mut head = [0u8; 7];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"GET /ws");
    }

    #[test]
    fn no_token_anywhere() {
        assert!(token_from_request(&request("/ws", None)).is_none());
        assert!(token_from_request(&request("/ws?token=", Some("Basic xyz"))).is_none());
    }
}
