//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, performs the HTTP upgrade, and keeps the upgrade
//! request URI: its query string carries the session token.

use guac_core::{GuacError, GuacResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Path and query of the upgrade request, e.g. `/?token=...&width=800`.
    pub request_uri: String,
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields upgraded connections, and the accept task.
/// Aborting the task stops accepting; connections already handed out live on.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> GuacResult<(mpsc::Receiver<WebSocketConnection>, JoinHandle<()>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GuacError::Transport(format!("WS bind failed: {e}")))?;

    let local_addr = tcp_listener.local_addr().unwrap_or(bind_addr);
    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    let task = tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match accept(stream).await {
                            Ok((ws_stream, request_uri)) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    request_uri,
                                };
                                if tx.send(conn).await.is_err() {
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

    Ok((rx, task))
}

/// Upgrade one TCP stream, capturing the request URI.
async fn accept(stream: TcpStream) -> GuacResult<(WebSocketStream<TcpStream>, String)> {
    let mut request_uri = String::new();
    let callback = |request: &Request, response: Response| {
        request_uri = request.uri().to_string();
        Ok::<Response, ErrorResponse>(response)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| GuacError::Transport(e.to_string()))?;
    Ok((ws_stream, request_uri))
}
