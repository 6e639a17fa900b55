//! End-to-end tests for the bridge.
//!
//! Each test starts a real bridge on a loopback port, a scripted caster on
//! another, and drives the bridge with a real WebSocket client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use ws_bridge::{Bridge, BridgeConfig, ServerMessage, SessionRegistry, SessionSettings, SessionStatus};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);
const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    registry: Arc<SessionRegistry>,
}

async fn start_bridge(session: SessionSettings) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, _) = broadcast::channel(1);

    let bridge = Bridge::new(
        BridgeConfig {
            listen_addr: addr,
            session,
        },
        shutdown.clone(),
    );
    let registry = bridge.registry();
    tokio::spawn(async move { bridge.serve(listener).await });

    Harness {
        addr,
        shutdown,
        registry,
    }
}

async fn connect_client(harness: &Harness) -> Client {
    let url = format!("ws://{}/", harness.addr);
    let (ws, _) = timeout(WAIT, connect_async(url))
        .await
        .expect("client connect timed out")
        .expect("client connect failed");
    ws
}

async fn start_caster() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Accept one caster connection and read the request head.
async fn accept_request(listener: &TcpListener) -> (TcpStream, String) {
    let (mut sock, _) = timeout(WAIT, listener.accept())
        .await
        .expect("caster accept timed out")
        .unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        timeout(WAIT, sock.read_exact(&mut byte))
            .await
            .expect("request read timed out")
            .unwrap();
        head.push(byte[0]);
    }
    (sock, String::from_utf8(head).unwrap())
}

async fn send_json(ws: &mut Client, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn send_connect(ws: &mut Client, port: u16) {
    send_json(
        ws,
        json!({"type": "connect", "host": "127.0.0.1", "port": port, "mountpoint": "MOUNT"}),
    )
    .await;
}

/// Next non-control frame, or `None` when the connection ended.
async fn next_frame(ws: &mut Client) -> Option<Message> {
    loop {
        match timeout(WAIT, ws.next()).await.expect("timed out waiting for frame") {
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(msg)) => return Some(msg),
            Some(Err(_)) | None => return None,
        }
    }
}

async fn next_server_message(ws: &mut Client) -> ServerMessage {
    match next_frame(ws).await {
        Some(Message::Text(text)) => serde_json::from_str(&text).expect("valid server message"),
        other => panic!("expected a JSON text frame, got {other:?}"),
    }
}

/// Collect binary frames until `len` bytes have arrived.
async fn collect_binary(ws: &mut Client, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        match next_frame(ws).await {
            Some(Message::Binary(bytes)) => out.extend_from_slice(&bytes),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }
    out
}

/// Assert that no frame arrives within `window`.
async fn expect_silence(ws: &mut Client, window: Duration) {
    if let Ok(frame) = timeout(window, ws.next()).await {
        panic!("expected no frame, got {frame:?}");
    }
}

/// The caster side sees EOF once the bridge closes its connection.
async fn expect_caster_eof(sock: &mut TcpStream) {
    let mut buf = [0u8; 256];
    loop {
        match timeout(WAIT, sock.read(&mut buf))
            .await
            .expect("caster socket was not closed")
        {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Bring a client to the streaming state against a fresh caster.
async fn streaming_session(harness: &Harness) -> (Client, TcpStream) {
    let (caster, port) = start_caster().await;
    let mut ws = connect_client(harness).await;
    send_connect(&mut ws, port).await;
    let (mut sock, _) = accept_request(&caster).await;
    sock.write_all(b"ICY 200 OK\r\n\r\n").await.unwrap();
    assert_eq!(
        next_server_message(&mut ws).await,
        ServerMessage::status(SessionStatus::Connected)
    );
    (ws, sock)
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_success_forwards_bytes_after_header() {
    let harness = start_bridge(SessionSettings::default()).await;
    let (caster, port) = start_caster().await;
    let mut ws = connect_client(&harness).await;

    send_json(
        &mut ws,
        json!({"type": "connect", "host": "127.0.0.1", "port": port.to_string(),
               "mountpoint": "MOUNT", "user": "user", "password": "pass"}),
    )
    .await;

    let (mut sock, head) = accept_request(&caster).await;
    assert!(head.starts_with("GET /MOUNT HTTP/1.1\r\n"), "{head}");
    assert!(head.contains("Host: 127.0.0.1\r\n"), "{head}");
    assert!(head.contains("Authorization: Basic dXNlcjpwYXNz\r\n"), "{head}");
    assert!(head.contains("Ntrip-Version: Ntrip/2.0\r\n"), "{head}");

    sock.write_all(b"ICY 200 OK\r\n\r\nDATA").await.unwrap();

    assert_eq!(
        next_server_message(&mut ws).await,
        ServerMessage::status(SessionStatus::Connected)
    );
    assert_eq!(collect_binary(&mut ws, 4).await, b"DATA");
}

#[tokio::test]
async fn handshake_failure_sends_one_error_and_no_data() {
    let harness = start_bridge(SessionSettings::default()).await;
    let (caster, port) = start_caster().await;
    let mut ws = connect_client(&harness).await;

    send_connect(&mut ws, port).await;
    let (mut sock, _) = accept_request(&caster).await;
    sock.write_all(b"HTTP/1.0 401 Unauthorized\r\n\r\n")
        .await
        .unwrap();

    match next_server_message(&mut ws).await {
        ServerMessage::Error { message } => assert!(message.contains("401"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
    expect_caster_eof(&mut sock).await;
    expect_silence(&mut ws, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn header_split_across_chunks_still_connects() {
    let harness = start_bridge(SessionSettings::default()).await;
    let (caster, port) = start_caster().await;
    let mut ws = connect_client(&harness).await;

    send_connect(&mut ws, port).await;
    let (mut sock, _) = accept_request(&caster).await;
    sock.write_all(b"ICY 200").await.unwrap();
    sock.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    sock.write_all(b" OK\r\n\r\n").await.unwrap();

    assert_eq!(
        next_server_message(&mut ws).await,
        ServerMessage::status(SessionStatus::Connected)
    );
}

#[tokio::test]
async fn caster_that_never_answers_times_out() {
    let settings = SessionSettings {
        handshake_timeout: Some(Duration::from_millis(200)),
        ..SessionSettings::default()
    };
    let harness = start_bridge(settings).await;
    let (caster, port) = start_caster().await;
    let mut ws = connect_client(&harness).await;

    send_connect(&mut ws, port).await;
    let (mut sock, _) = accept_request(&caster).await;

    match next_server_message(&mut ws).await {
        ServerMessage::Error { message } => assert!(message.contains("timed out"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
    expect_caster_eof(&mut sock).await;
}

#[tokio::test]
async fn dial_failure_reports_error_and_allows_reconnect() {
    let harness = start_bridge(SessionSettings::default()).await;
    let mut ws = connect_client(&harness).await;

    let (closed, closed_port) = start_caster().await;
    drop(closed);
    send_connect(&mut ws, closed_port).await;
    assert!(matches!(
        next_server_message(&mut ws).await,
        ServerMessage::Error { .. }
    ));

    let (caster, port) = start_caster().await;
    send_connect(&mut ws, port).await;
    let (mut sock, _) = accept_request(&caster).await;
    sock.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
    assert_eq!(
        next_server_message(&mut ws).await,
        ServerMessage::status(SessionStatus::Connected)
    );
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upstream_byte_order_is_preserved() {
    let harness = start_bridge(SessionSettings::default()).await;
    let (mut ws, mut sock) = streaming_session(&harness).await;

    let mut expected = Vec::new();
    for i in 0..20u8 {
        let chunk: Vec<u8> = (0..(i as usize * 37 + 1)).map(|j| (j as u8) ^ i).collect();
        expected.extend_from_slice(&chunk);
        sock.write_all(&chunk).await.unwrap();
        if i % 3 == 0 {
            tokio::time::sleep(Duration::from_millis(i as u64)).await;
        }
    }

    let received = collect_binary(&mut ws, expected.len()).await;
    assert_eq!(received, expected);
}

#[tokio::test]
async fn report_is_forwarded_immediately_and_on_each_tick() {
    let settings = SessionSettings {
        keepalive_interval: Some(Duration::from_millis(150)),
        ..SessionSettings::default()
    };
    let harness = start_bridge(settings).await;
    let (mut ws, sock) = streaming_session(&harness).await;
    let (read_half, _write_half) = sock.into_split();
    let mut lines = BufReader::new(read_half);

    // Rejected reports never reach the caster.
    send_json(&mut ws, json!({"type": "report", "sentence": "GPGGA,no-dollar"})).await;
    send_json(&mut ws, json!({"type": "report", "sentence": format!("{GGA}\n")})).await;

    for _ in 0..3 {
        let mut line = String::new();
        timeout(WAIT, lines.read_line(&mut line)).await.unwrap().unwrap();
        assert_eq!(line, format!("{GGA}\r\n"));
    }

    // A newer report supersedes the stored one.
    let newer = "$GNGGA,000001,0000.000,N,00000.000,E,1,08,0.9,1.0,M,0.0,M,,*00";
    send_json(&mut ws, json!({"type": "gga", "sentence": newer})).await;
    loop {
        let mut line = String::new();
        timeout(WAIT, lines.read_line(&mut line)).await.unwrap().unwrap();
        if line == format!("{newer}\r\n") {
            break;
        }
        assert_eq!(line, format!("{GGA}\r\n"));
    }
    let mut line = String::new();
    timeout(WAIT, lines.read_line(&mut line)).await.unwrap().unwrap();
    assert_eq!(line, format!("{newer}\r\n"));
}

#[tokio::test]
async fn caster_close_sends_disconnected() {
    let harness = start_bridge(SessionSettings::default()).await;
    let (mut ws, sock) = streaming_session(&harness).await;

    drop(sock);
    assert_eq!(
        next_server_message(&mut ws).await,
        ServerMessage::status(SessionStatus::Disconnected)
    );
    expect_silence(&mut ws, Duration::from_millis(200)).await;
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_disconnect_reports_once() {
    let harness = start_bridge(SessionSettings::default()).await;
    let (mut ws, mut sock) = streaming_session(&harness).await;

    send_json(&mut ws, json!({"type": "disconnect"})).await;
    send_json(&mut ws, json!({"type": "disconnect"})).await;

    assert_eq!(
        next_server_message(&mut ws).await,
        ServerMessage::status(SessionStatus::Disconnected)
    );
    expect_caster_eof(&mut sock).await;
    expect_silence(&mut ws, Duration::from_millis(300)).await;

    // The client transport stays open after disconnect.
    send_json(&mut ws, json!({"type": "disconnect"})).await;
    expect_silence(&mut ws, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn disconnect_is_handled_while_caster_stops_reading() {
    let settings = SessionSettings {
        keepalive_interval: Some(Duration::from_millis(20)),
        ..SessionSettings::default()
    };
    let harness = start_bridge(settings).await;

    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let caster = socket.listen(8).unwrap();
    let port = caster.local_addr().unwrap().port();

    let mut ws = connect_client(&harness).await;
    send_connect(&mut ws, port).await;
    let (mut sock, _) = accept_request(&caster).await;
    sock.write_all(b"ICY 200 OK\r\n\r\n").await.unwrap();
    assert_eq!(
        next_server_message(&mut ws).await,
        ServerMessage::status(SessionStatus::Connected)
    );

    // The caster never reads from here on.
    let oversized = format!("$GPGGA,{}", "9".repeat(1024 * 1024));
    send_json(&mut ws, json!({"type": "report", "sentence": oversized})).await;
    for i in 0..2000 {
        let sentence = format!("$GPGGA,{i:06},{}", "0".repeat(200));
        send_json(&mut ws, json!({"type": "report", "sentence": sentence})).await;
    }
    send_json(&mut ws, json!({"type": "disconnect"})).await;

    assert_eq!(
        next_server_message(&mut ws).await,
        ServerMessage::status(SessionStatus::Disconnected)
    );
    expect_caster_eof(&mut sock).await;
}

#[tokio::test]
async fn second_connect_replaces_first_caster() {
    let harness = start_bridge(SessionSettings::default()).await;
    let (mut ws, mut old_sock) = streaming_session(&harness).await;

    let (caster, port) = start_caster().await;
    send_connect(&mut ws, port).await;

    // The old socket is closed before anything else happens on it.
    expect_caster_eof(&mut old_sock).await;
    let _ = old_sock.write_all(b"OLD").await;

    let (mut new_sock, _) = accept_request(&caster).await;
    new_sock.write_all(b"ICY 200 OK\r\n\r\nNEW").await.unwrap();

    assert_eq!(
        next_server_message(&mut ws).await,
        ServerMessage::status(SessionStatus::Connected)
    );
    assert_eq!(collect_binary(&mut ws, 3).await, b"NEW");
}

#[tokio::test]
async fn malformed_messages_are_ignored() {
    let harness = start_bridge(SessionSettings::default()).await;
    let (caster, port) = start_caster().await;
    let mut ws = connect_client(&harness).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    send_json(&mut ws, json!({"type": "subscribe"})).await;
    send_json(&mut ws, json!({"type": "connect", "port": port})).await;
    send_json(
        &mut ws,
        json!({"type": "connect", "host": "127.0.0.1", "port": port,
               "mountpoint": "M HTTP/1.1\r\nX-Injected: 1\r\n\r\nPOST /admin"}),
    )
    .await;
    ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    expect_silence(&mut ws, Duration::from_millis(200)).await;

    send_connect(&mut ws, port).await;
    let (mut sock, head) = accept_request(&caster).await;
    assert!(head.starts_with("GET /MOUNT HTTP/1.1\r\n"), "{head}");
    assert!(!head.contains("X-Injected"), "{head}");
    sock.write_all(b"ICY 200 OK\r\n\r\n").await.unwrap();
    assert_eq!(
        next_server_message(&mut ws).await,
        ServerMessage::status(SessionStatus::Connected)
    );
}

#[tokio::test]
async fn client_close_releases_session_and_caster() {
    let harness = start_bridge(SessionSettings::default()).await;
    let (mut ws, mut sock) = streaming_session(&harness).await;
    assert_eq!(harness.registry.len(), 1);

    ws.close(None).await.unwrap();
    expect_caster_eof(&mut sock).await;
    let registry = Arc::clone(&harness.registry);
    wait_until(move || registry.is_empty()).await;
}

#[tokio::test]
async fn close_client_on_upstream_end_closes_websocket() {
    let settings = SessionSettings {
        close_client_on_upstream_end: true,
        ..SessionSettings::default()
    };
    let harness = start_bridge(settings).await;
    let (caster, port) = start_caster().await;
    let mut ws = connect_client(&harness).await;

    send_connect(&mut ws, port).await;
    let (mut sock, _) = accept_request(&caster).await;
    sock.write_all(b"ICY 401 Unauthorized\r\n\r\n").await.unwrap();

    assert!(matches!(
        next_server_message(&mut ws).await,
        ServerMessage::Error { .. }
    ));
    match next_frame(&mut ws).await {
        None | Some(Message::Close(_)) => {}
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_closes_sessions() {
    let harness = start_bridge(SessionSettings::default()).await;
    let (mut ws, mut sock) = streaming_session(&harness).await;

    harness.shutdown.send(()).unwrap();

    expect_caster_eof(&mut sock).await;
    match next_frame(&mut ws).await {
        None | Some(Message::Close(_)) => {}
        other => panic!("expected close, got {other:?}"),
    }
    let registry = Arc::clone(&harness.registry);
    wait_until(move || registry.is_empty()).await;
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

#[tokio::test]
async fn plain_http_request_gets_ok() {
    let harness = start_bridge(SessionSettings::default()).await;
    let mut sock = TcpStream::connect(harness.addr).await.unwrap();
    sock.write_all(b"GET / HTTP/1.1\r\nHost: bridge\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    timeout(WAIT, sock.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("Content-Type: text/plain\r\n"), "{response}");
    assert!(response.ends_with("\r\n\r\nOK\n"), "{response}");
}
