//! Outbound byte-stream connections to NTRIP casters: plain TCP or TLS.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::messages::ConnectRequest;

/// Root store and client config, loaded once from the OS store.
static TLS_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("no addresses found for {host}")]
    NoAddress { host: String },

    #[error("connection to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("invalid TLS server name '{host}'")]
    InvalidServerName { host: String },

    #[error("TLS setup failed: {0}")]
    TlsConfig(String),

    #[error("TLS handshake with {host} failed: {source}")]
    Tls { host: String, source: io::Error },

    #[error("failed to send NTRIP request: {0}")]
    Write(io::Error),

    #[error("timed out connecting to {addr} after {}s", .timeout.as_secs())]
    Timeout { addr: String, timeout: Duration },
}

/// Where to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl UpstreamTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&ConnectRequest> for UpstreamTarget {
    fn from(req: &ConnectRequest) -> Self {
        Self {
            host: req.host().to_string(),
            port: req.effective_port(),
            tls: req.ssl,
        }
    }
}

/// Caster connection: plain TCP or TLS. Implements AsyncRead + AsyncWrite.
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl UpstreamStream {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            UpstreamStream::Plain(s) => s.peer_addr(),
            UpstreamStream::Tls(s) => s.get_ref().0.peer_addr(),
        }
    }
}

impl fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamStream::Plain(_) => f.write_str("UpstreamStream::Plain"),
            UpstreamStream::Tls(_) => f.write_str("UpstreamStream::Tls"),
        }
    }
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// TLS client config for caster connections, cached after the first call.
///
/// The ring provider is passed explicitly, so no process-wide default
/// provider has to be installed.
fn tls_config() -> Result<Arc<ClientConfig>, ConnectError> {
    if let Some(config) = TLS_CONFIG.get() {
        return Ok(Arc::clone(config));
    }

    let mut root_store = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::warn!(%err, "error while loading native root certificates");
    }
    let (added, ignored) = root_store.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "loaded native root certificates");

    let provider = tokio_rustls::rustls::crypto::ring::default_provider();
    let config = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectError::TlsConfig(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Arc::clone(TLS_CONFIG.get_or_init(|| Arc::new(config))))
}

/// Open a TCP connection to `target`, wrapping it in TLS when requested.
///
/// Every resolved address is tried in order; the last connect error is
/// reported if none succeeds.
pub async fn dial(target: &UpstreamTarget) -> Result<UpstreamStream, ConnectError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|source| ConnectError::Resolve {
            host: target.host.clone(),
            source,
        })?
        .collect();

    let mut last_err = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(err) => {
                tracing::debug!(%addr, %err, "caster address unreachable");
                last_err = Some((addr, err));
            }
        }
    }

    let tcp = match (tcp, last_err) {
        (Some(stream), _) => stream,
        (None, Some((addr, source))) => {
            return Err(ConnectError::Connect {
                addr: addr.to_string(),
                source,
            })
        }
        (None, None) => {
            return Err(ConnectError::NoAddress {
                host: target.host.clone(),
            })
        }
    };
    let _ = tcp.set_nodelay(true);

    if !target.tls {
        return Ok(UpstreamStream::Plain(tcp));
    }

    let server_name = ServerName::try_from(target.host.clone()).map_err(|_| {
        ConnectError::InvalidServerName {
            host: target.host.clone(),
        }
    })?;
    let connector = TlsConnector::from(tls_config()?);
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|source| ConnectError::Tls {
            host: target.host.clone(),
            source,
        })?;

    Ok(UpstreamStream::Tls(Box::new(tls)))
}

/// Write the NTRIP request. Bytes reach the caster in the order written.
pub async fn send_handshake(
    stream: &mut UpstreamStream,
    request: &[u8],
) -> Result<(), ConnectError> {
    stream.write_all(request).await.map_err(ConnectError::Write)?;
    stream.flush().await.map_err(ConnectError::Write)
}

/// Dial and send the request, bounded by `timeout` when one is set.
pub async fn open(
    target: &UpstreamTarget,
    request: &[u8],
    timeout: Option<Duration>,
) -> Result<UpstreamStream, ConnectError> {
    let attempt = async {
        let mut stream = dial(target).await?;
        send_handshake(&mut stream, request).await?;
        Ok(stream)
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| ConnectError::Timeout {
                addr: target.address(),
                timeout: limit,
            })?,
        None => attempt.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn target(port: u16) -> UpstreamTarget {
        UpstreamTarget {
            host: "127.0.0.1".to_string(),
            port,
            tls: false,
        }
    }

    #[test]
    fn target_from_request_applies_default_port() {
        let req: ConnectRequest = serde_json::from_str(
            r#"{"host":" caster.example.com ","mountpoint":"M","ssl":true}"#,
        )
        .unwrap();
        let target = UpstreamTarget::from(&req);
        assert_eq!(target.host, "caster.example.com");
        assert_eq!(target.port, 443);
        assert!(target.tls);
        assert_eq!(target.address(), "caster.example.com:443");
    }

    #[test]
    fn tls_config_builds_with_explicit_provider() {
        let first = tls_config().unwrap();
        let second = tls_config().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn open_writes_request_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            sock.read_to_end(&mut received).await.unwrap();
            received
        });

        let request = b"GET /M HTTP/1.1\r\nHost: x\r\n\r\n";
        let stream = open(&target(port), request, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(stream.peer_addr().is_ok());
        drop(stream);

        let received = server.await.unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = open(&target(port), b"x", Some(Duration::from_secs(5)))
            .await
            .err()
            .expect("dial should fail");
        assert!(matches!(err, ConnectError::Connect { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn unresolvable_host_is_resolve_error() {
        let target = UpstreamTarget {
            host: "caster.invalid".to_string(),
            port: 2101,
            tls: false,
        };
        let err = open(&target, b"x", Some(Duration::from_secs(10)))
            .await
            .err()
            .expect("resolution should fail");
        assert!(
            matches!(err, ConnectError::Resolve { .. } | ConnectError::NoAddress { .. } | ConnectError::Timeout { .. }),
            "got {err:?}"
        );
    }
}
