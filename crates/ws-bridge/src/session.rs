use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use ntrip_proto::{build_request, PositionReport, DEFAULT_MAX_HEADER_BYTES};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uuid::Uuid;

use crate::messages::{ClientMessage, ConnectRequest, ServerMessage, SessionStatus};
use crate::relay::{Inbound, Relay, RelayTimer, UpstreamEvent};
use crate::upstream::{self, UpstreamTarget};

/// Capacity of the per-session upstream event queue.
const EVENT_QUEUE: usize = 64;

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Period for re-sending the last position report. `None` sends reports
    /// only when they arrive.
    pub keepalive_interval: Option<Duration>,
    /// Bound on dial + TLS + request write.
    pub connect_timeout: Option<Duration>,
    /// Bound on waiting for the caster's response header.
    pub handshake_timeout: Option<Duration>,
    /// Largest response header accepted from a caster.
    pub max_header_bytes: usize,
    /// Close the client WebSocket whenever the caster connection ends.
    pub close_client_on_upstream_end: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(Duration::from_secs(10)),
            connect_timeout: Some(Duration::from_secs(10)),
            handshake_timeout: Some(Duration::from_secs(15)),
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            close_client_on_upstream_end: false,
        }
    }
}

/// Lifecycle of the session's current caster connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connect has been requested yet.
    Idle,
    /// Dial in flight.
    Connecting,
    /// Request sent, waiting for the header terminator.
    Handshaking,
    /// Header accepted, relaying correction data.
    Streaming,
    /// The last caster connection has ended. A new connect may follow.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Streaming => "streaming",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session's event loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    ClientClosed,
    ClientError,
    UpstreamEnded,
    Shutdown,
}

/// `Err` stops the event loop.
type Flow = Result<(), SessionExit>;

enum Upstream {
    Dialing(JoinHandle<()>),
    Live(Relay),
}

/// One browser client and, at most, one caster connection.
///
/// All state changes happen on the task running [`Session::run`]; upstream
/// tasks only talk to it through the event queue.
pub(crate) struct Session<W> {
    id: Uuid,
    settings: Arc<SessionSettings>,
    client: W,
    state: SessionState,
    last_report: Option<PositionReport>,
    upstream: Option<Upstream>,
    /// Bumped on every connect and teardown; events from older attempts are
    /// discarded.
    generation: u64,
    events_tx: mpsc::Sender<UpstreamEvent>,
    events_rx: mpsc::Receiver<UpstreamEvent>,
}

impl<W> Session<W>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    pub(crate) fn new(id: Uuid, settings: Arc<SessionSettings>, client: W) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        Self {
            id,
            settings,
            client,
            state: SessionState::Idle,
            last_report: None,
            upstream: None,
            generation: 0,
            events_tx,
            events_rx,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until the client goes away, the process shuts down,
    /// or (when configured) the caster connection ends.
    pub(crate) async fn run<R>(
        mut self,
        mut client_rx: R,
        mut shutdown: broadcast::Receiver<()>,
    ) -> SessionExit
    where
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let exit = loop {
            let flow = tokio::select! {
                frame = client_rx.next() => self.on_client_frame(frame).await,
                Some(event) = self.events_rx.recv() => self.on_upstream_event(event).await,
                timer = next_timer(&mut self.upstream) => self.on_timer(timer).await,
                _ = shutdown.recv() => Err(SessionExit::Shutdown),
            };
            if let Err(exit) = flow {
                break exit;
            }
        };

        self.teardown().await;
        if matches!(exit, SessionExit::Shutdown | SessionExit::UpstreamEnded) {
            let _ = self.client.send(Message::Close(None)).await;
        }
        exit
    }

    async fn on_client_frame(&mut self, frame: Option<Result<Message, WsError>>) -> Flow {
        match frame {
            None | Some(Ok(Message::Close(_))) => Err(SessionExit::ClientClosed),
            Some(Err(err)) => {
                tracing::debug!(session_id = %self.id, %err, "client transport error");
                Err(SessionExit::ClientError)
            }
            Some(Ok(Message::Text(text))) => match ClientMessage::parse(&text) {
                Some(msg) => self.dispatch(msg).await,
                None => {
                    tracing::debug!(session_id = %self.id, "dropping malformed client message");
                    Ok(())
                }
            },
            // Binary frames carry nothing for us; ping/pong are answered by
            // the transport.
            Some(Ok(_)) => Ok(()),
        }
    }

    pub(crate) async fn dispatch(&mut self, msg: ClientMessage) -> Flow {
        match msg {
            ClientMessage::Connect(req) => self.connect(req).await,
            ClientMessage::Report { sentence } => self.report(&sentence).await,
            ClientMessage::Disconnect => self.disconnect().await,
        }
    }

    async fn connect(&mut self, req: ConnectRequest) -> Flow {
        if self.upstream.is_some() {
            tracing::info!(session_id = %self.id, state = %self.state, "replacing caster connection");
            self.teardown().await;
        }

        self.generation += 1;
        let generation = self.generation;
        let target = UpstreamTarget::from(&req);
        let request = build_request(&req.mountpoint, &target.host, req.credentials().as_ref());

        tracing::info!(
            session_id = %self.id,
            host = %target.host,
            port = target.port,
            mountpoint = %req.mountpoint,
            tls = target.tls,
            "connecting to caster"
        );

        let events = self.events_tx.clone();
        let timeout = self.settings.connect_timeout;
        let task = tokio::spawn(async move {
            let result = upstream::open(&target, &request, timeout).await;
            let _ = events.send(UpstreamEvent::Dialed { generation, result }).await;
        });

        self.upstream = Some(Upstream::Dialing(task));
        self.set_state(SessionState::Connecting);
        Ok(())
    }

    async fn report(&mut self, sentence: &str) -> Flow {
        match PositionReport::parse(sentence) {
            Ok(report) => {
                self.last_report = Some(report);
                self.forward_report();
                Ok(())
            }
            Err(err) => {
                tracing::debug!(session_id = %self.id, %err, "ignoring position report");
                Ok(())
            }
        }
    }

    async fn disconnect(&mut self) -> Flow {
        if self.upstream.is_none() {
            return Ok(());
        }
        tracing::info!(session_id = %self.id, state = %self.state, "client requested disconnect");
        self.teardown().await;
        self.send(ServerMessage::status(SessionStatus::Disconnected))
            .await
    }

    pub(crate) async fn on_upstream_event(&mut self, event: UpstreamEvent) -> Flow {
        if event.generation() != self.generation || self.upstream.is_none() {
            tracing::trace!(session_id = %self.id, "dropping stale upstream event");
            return Ok(());
        }

        match event {
            UpstreamEvent::Dialed {
                result: Ok(stream), ..
            } => {
                if let Ok(peer) = stream.peer_addr() {
                    tracing::debug!(session_id = %self.id, %peer, "caster socket open");
                }
                let relay = Relay::start(
                    stream,
                    self.generation,
                    self.events_tx.clone(),
                    self.settings.max_header_bytes,
                    self.settings.handshake_timeout,
                    self.settings.keepalive_interval,
                );
                self.upstream = Some(Upstream::Live(relay));
                self.set_state(SessionState::Handshaking);
                // A report received while dialing goes out right behind the request.
                self.forward_report();
                Ok(())
            }
            UpstreamEvent::Dialed {
                result: Err(err), ..
            } => {
                tracing::warn!(session_id = %self.id, %err, "caster dial failed");
                self.fail(err.to_string()).await
            }
            UpstreamEvent::Data { bytes, .. } => self.on_upstream_bytes(bytes).await,
            UpstreamEvent::Closed { .. } => {
                let truncated = match self.upstream.as_mut() {
                    Some(Upstream::Live(relay)) => relay.on_eof(),
                    _ => None,
                };
                match truncated {
                    Some(err) => {
                        tracing::warn!(session_id = %self.id, %err, "caster closed during handshake");
                        self.fail(err.to_string()).await
                    }
                    None => {
                        tracing::info!(session_id = %self.id, "caster closed the stream");
                        self.teardown().await;
                        self.send(ServerMessage::status(SessionStatus::Disconnected))
                            .await?;
                        self.upstream_ended()
                    }
                }
            }
            UpstreamEvent::Failed { error, .. } => {
                tracing::warn!(session_id = %self.id, %error, "caster socket error");
                self.fail(error.to_string()).await
            }
        }
    }

    async fn on_upstream_bytes(&mut self, bytes: Vec<u8>) -> Flow {
        let Some(Upstream::Live(relay)) = self.upstream.as_mut() else {
            return Ok(());
        };

        match relay.on_bytes(bytes) {
            Ok(Inbound::Pending) => Ok(()),
            Ok(Inbound::Connected { leftover }) => {
                tracing::info!(session_id = %self.id, "caster accepted request");
                self.set_state(SessionState::Streaming);
                self.send(ServerMessage::status(SessionStatus::Connected))
                    .await?;
                if leftover.is_empty() {
                    Ok(())
                } else {
                    self.send_binary(leftover).await
                }
            }
            Ok(Inbound::Payload(bytes)) => self.send_binary(bytes).await,
            Err(err) => {
                tracing::warn!(session_id = %self.id, %err, "caster rejected request");
                self.fail(err.to_string()).await
            }
        }
    }

    async fn on_timer(&mut self, timer: RelayTimer) -> Flow {
        match timer {
            RelayTimer::HandshakeExpired => {
                let waited = self.settings.handshake_timeout.unwrap_or_default();
                tracing::warn!(session_id = %self.id, ?waited, "caster handshake timed out");
                self.fail(format!(
                    "NTRIP handshake timed out after {}s",
                    waited.as_secs()
                ))
                .await
            }
            RelayTimer::KeepAlive => {
                if self.last_report.is_some() {
                    tracing::debug!(session_id = %self.id, "re-sending position report");
                }
                self.forward_report();
                Ok(())
            }
        }
    }

    /// Queue the stored report for the caster, if both exist.
    fn forward_report(&self) {
        let (Some(Upstream::Live(relay)), Some(report)) =
            (self.upstream.as_ref(), self.last_report.as_ref())
        else {
            return;
        };

        if !relay.queue_report(report) {
            tracing::debug!(session_id = %self.id, "caster not reading; report dropped");
        }
    }

    /// Close the caster connection after a failure and tell the client.
    async fn fail(&mut self, message: String) -> Flow {
        self.teardown().await;
        self.send(ServerMessage::error(message)).await?;
        self.upstream_ended()
    }

    fn upstream_ended(&self) -> Flow {
        if self.settings.close_client_on_upstream_end {
            Err(SessionExit::UpstreamEnded)
        } else {
            Ok(())
        }
    }

    /// Release the caster connection and its timers. A no-op when there is
    /// none.
    pub(crate) async fn teardown(&mut self) {
        match self.upstream.take() {
            Some(Upstream::Dialing(task)) => task.abort(),
            Some(Upstream::Live(relay)) => relay.close().await,
            None => return,
        }
        self.generation += 1;
        self.set_state(SessionState::Closed);
    }

    fn set_state(&mut self, next: SessionState) {
        tracing::debug!(session_id = %self.id, from = %self.state, to = %next, "session state");
        self.state = next;
    }

    async fn send(&mut self, msg: ServerMessage) -> Flow {
        let frame = match msg.to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(session_id = %self.id, %err, "failed to encode client message");
                return Ok(());
            }
        };
        self.send_frame(frame).await
    }

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Flow {
        self.send_frame(Message::Binary(bytes.into())).await
    }

    async fn send_frame(&mut self, frame: Message) -> Flow {
        if let Err(err) = self.client.send(frame).await {
            tracing::debug!(session_id = %self.id, %err, "client send failed");
            return Err(SessionExit::ClientError);
        }
        Ok(())
    }
}

async fn next_timer(upstream: &mut Option<Upstream>) -> RelayTimer {
    match upstream {
        Some(Upstream::Live(relay)) => relay.next_timer().await,
        _ => std::future::pending().await,
    }
}
