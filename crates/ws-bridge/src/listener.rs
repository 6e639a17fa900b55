use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};

use crate::manager::{SessionManager, SessionRegistry};
use crate::session::SessionSettings;

/// Bound on reading the HTTP request head of a new connection.
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest request head inspected when telling health checks from upgrades.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Configuration for the bridge listener.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address to bind the listening socket to.
    pub listen_addr: SocketAddr,
    /// Settings applied to every client session.
    pub session: SessionSettings,
}

/// The WebSocket-facing bridge server.
///
/// Answers plain HTTP requests as a health check, upgrades WebSocket
/// requests, and hands each upgraded client to the [`SessionManager`].
pub struct Bridge {
    listen_addr: SocketAddr,
    manager: Arc<SessionManager>,
    shutdown: broadcast::Sender<()>,
}

impl Bridge {
    /// Create a bridge. Sending on `shutdown` stops the accept loop and every
    /// live session.
    pub fn new(config: BridgeConfig, shutdown: broadcast::Sender<()>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let manager = SessionManager::new(registry, config.session, shutdown.clone());
        Self {
            listen_addr: config.listen_addr,
            manager: Arc::new(manager),
            shutdown,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(self.manager.registry())
    }

    /// Bind `listen_addr` and serve until shutdown.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener until shutdown.
    ///
    /// Each connection is handled in its own Tokio task.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "ntrip bridge listening");

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::warn!(%err, "accept failed");
                            continue;
                        }
                    };
                    let manager = Arc::clone(&self.manager);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, remote_addr, manager).await {
                            tracing::debug!(%remote_addr, %err, "connection handler error");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Handle a single TCP connection: health check or WebSocket session.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    manager: Arc<SessionManager>,
) -> anyhow::Result<()> {
    let head = tokio::time::timeout(REQUEST_HEAD_TIMEOUT, peek_request_head(&stream)).await??;

    if !is_websocket_upgrade(&head) {
        tracing::debug!(%remote_addr, "health check");
        return respond_health(stream, head.len()).await;
    }

    // Capture request details for logging while accepting the upgrade.
    let captured: Arc<Mutex<Option<(String, String)>>> = Arc::new(Mutex::new(None));
    let captured_cb = Arc::clone(&captured);
    let callback =
        move |req: &HsRequest, response: HsResponse| -> Result<HsResponse, ErrorResponse> {
            let user_agent = req
                .headers()
                .get(http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("<none>")
                .to_string();
            if let Ok(mut guard) = captured_cb.lock() {
                *guard = Some((req.uri().path().to_string(), user_agent));
            }
            Ok(response)
        };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    if let Some((path, user_agent)) = captured.lock().ok().and_then(|g| g.clone()) {
        tracing::debug!(%remote_addr, %path, %user_agent, "websocket upgrade accepted");
    }

    manager.serve(ws, remote_addr).await;
    Ok(())
}

/// Peek at the request head without consuming it, so the WebSocket
/// handshake can still read it.
async fn peek_request_head(stream: &TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let mut seen = 0;
    loop {
        let n = stream.peek(&mut buf).await?;
        let head = &buf[..n];
        if n == 0 || n == buf.len() || head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(head.to_vec());
        }
        if n == seen {
            // Peek returns immediately while old bytes are queued; back off
            // until more of the head arrives.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        seen = n;
    }
}

/// True when the request head carries `Upgrade: websocket`.
fn is_websocket_upgrade(head: &[u8]) -> bool {
    String::from_utf8_lossy(head).lines().skip(1).any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.to_ascii_lowercase().contains("websocket")
        })
    })
}

/// Answer with `200 OK` and a short text body, then close.
async fn respond_health(mut stream: TcpStream, head_len: usize) -> anyhow::Result<()> {
    // Drain the request so closing does not reset the connection.
    let mut discard = vec![0u8; head_len];
    if head_len > 0 {
        stream.read_exact(&mut discard).await?;
    }

    let status = StatusCode::OK;
    let body = "OK\n";
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("OK"),
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
