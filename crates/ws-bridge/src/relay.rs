use std::io;
use std::time::Duration;

use ntrip_proto::{HandshakeBuffer, HandshakeError, PositionReport};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::upstream::{ConnectError, UpstreamStream};

/// Size of each read from the caster socket.
const READ_CHUNK: usize = 16 * 1024;

/// Reports waiting for the writer task. When the caster stops reading, newer
/// reports are dropped rather than queued.
const OUTBOUND_QUEUE: usize = 4;

/// Bound on a single write to the caster.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `close` waits for the writer to shut the socket down before
/// dropping it.
const CLOSE_GRACE: Duration = Duration::from_millis(200);

/// Events delivered to a session's queue by its upstream tasks.
///
/// Each event carries the generation of the upstream attempt that produced
/// it so the session can drop events from a connection it already replaced.
#[derive(Debug)]
pub(crate) enum UpstreamEvent {
    Dialed {
        generation: u64,
        result: Result<UpstreamStream, ConnectError>,
    },
    Data {
        generation: u64,
        bytes: Vec<u8>,
    },
    Closed {
        generation: u64,
    },
    Failed {
        generation: u64,
        error: io::Error,
    },
}

impl UpstreamEvent {
    pub(crate) fn generation(&self) -> u64 {
        match self {
            UpstreamEvent::Dialed { generation, .. }
            | UpstreamEvent::Data { generation, .. }
            | UpstreamEvent::Closed { generation }
            | UpstreamEvent::Failed { generation, .. } => *generation,
        }
    }
}

/// What the session should do with a chunk that arrived from the caster.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Inbound {
    /// Header still incomplete.
    Pending,
    /// Header accepted. `leftover` is payload that followed it.
    Connected { leftover: Vec<u8> },
    /// Raw correction data to forward as-is.
    Payload(Vec<u8>),
}

/// Timers owned by a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayTimer {
    HandshakeExpired,
    KeepAlive,
}

enum Phase {
    Handshaking {
        buffer: HandshakeBuffer,
        deadline: Option<Instant>,
    },
    Streaming,
}

/// A live caster connection owned by one session.
///
/// Holds the queue feeding the writer task, the task pumping the read half
/// into the session's queue, and the keep-alive timer once streaming has
/// started. The session never awaits the caster socket directly.
pub(crate) struct Relay {
    phase: Phase,
    outbound: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    keepalive_period: Option<Duration>,
    keepalive: Option<Interval>,
}

impl Relay {
    /// Split `stream` and start pumping its read half into `events`.
    pub(crate) fn start(
        stream: UpstreamStream,
        generation: u64,
        events: mpsc::Sender<UpstreamEvent>,
        max_header_bytes: usize,
        handshake_timeout: Option<Duration>,
        keepalive_period: Option<Duration>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(drain_outbound(
            write_half,
            outbound_rx,
            generation,
            events.clone(),
        ));
        let reader = tokio::spawn(pump_upstream(read_half, generation, events));

        Self {
            phase: Phase::Handshaking {
                buffer: HandshakeBuffer::new(max_header_bytes),
                deadline: handshake_timeout.map(|t| Instant::now() + t),
            },
            outbound,
            reader,
            writer,
            keepalive_period,
            keepalive: None,
        }
    }

    /// Feed a chunk from the caster through the handshake or pass it on.
    pub(crate) fn on_bytes(&mut self, bytes: Vec<u8>) -> Result<Inbound, HandshakeError> {
        let Phase::Handshaking { buffer, .. } = &mut self.phase else {
            return Ok(Inbound::Payload(bytes));
        };

        match buffer.feed(&bytes)? {
            None => Ok(Inbound::Pending),
            Some(response) => {
                tracing::debug!(header = %response.header, "caster accepted request");
                self.phase = Phase::Streaming;
                self.keepalive = self.keepalive_period.map(|period| {
                    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    interval
                });
                Ok(Inbound::Connected {
                    leftover: response.leftover,
                })
            }
        }
    }

    /// The caster closed its side. Returns the handshake error when this
    /// happened before the header was complete.
    pub(crate) fn on_eof(&mut self) -> Option<HandshakeError> {
        match &mut self.phase {
            Phase::Handshaking { buffer, .. } => Some(buffer.finish()),
            Phase::Streaming => None,
        }
    }

    /// Hand `report` to the writer task. Returns `false` when the caster is
    /// not keeping up and the report was dropped. Write failures arrive as
    /// [`UpstreamEvent::Failed`].
    pub(crate) fn queue_report(&self, report: &PositionReport) -> bool {
        match self.outbound.try_send(report.to_wire()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            // The writer already stopped and reported why.
            Err(mpsc::error::TrySendError::Closed(_)) => true,
        }
    }

    /// Resolves when the handshake deadline passes or, once streaming, on
    /// each keep-alive tick. Pending forever when neither timer is armed.
    pub(crate) async fn next_timer(&mut self) -> RelayTimer {
        match &self.phase {
            Phase::Handshaking {
                deadline: Some(deadline),
                ..
            } => {
                tokio::time::sleep_until(*deadline).await;
                RelayTimer::HandshakeExpired
            }
            Phase::Handshaking { deadline: None, .. } => std::future::pending().await,
            Phase::Streaming => match self.keepalive.as_mut() {
                Some(interval) => {
                    interval.tick().await;
                    RelayTimer::KeepAlive
                }
                None => std::future::pending().await,
            },
        }
    }

    /// Stop the reader, clear the timer and close the caster socket. Waits
    /// at most `CLOSE_GRACE` for the writer; a writer stuck on a caster that
    /// stopped reading is aborted, which drops the socket.
    pub(crate) async fn close(self) {
        let Relay {
            outbound,
            reader,
            mut writer,
            ..
        } = self;
        reader.abort();
        drop(outbound);
        if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            tracing::debug!("caster writer still blocked; dropping socket");
            writer.abort();
        }
    }
}

/// Write queued reports to the caster until the relay is closed or a write
/// fails or stalls for longer than `WRITE_TIMEOUT`.
async fn drain_outbound(
    mut writer: WriteHalf<UpstreamStream>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    generation: u64,
    events: mpsc::Sender<UpstreamEvent>,
) {
    while let Some(bytes) = outbound.recv().await {
        let written = tokio::time::timeout(WRITE_TIMEOUT, async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        })
        .await
        .unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("caster write timed out after {}s", WRITE_TIMEOUT.as_secs()),
            ))
        });
        if let Err(error) = written {
            let _ = events.send(UpstreamEvent::Failed { generation, error }).await;
            return;
        }
    }

    // Relay closed.
    match tokio::time::timeout(CLOSE_GRACE, writer.shutdown()).await {
        Ok(Err(err)) => tracing::debug!(%err, "error shutting down caster socket"),
        Err(_) => tracing::debug!("caster socket shutdown timed out"),
        Ok(Ok(())) => {}
    }
}

/// Forward everything read from the caster into the session queue until
/// EOF, a read error, or the session going away.
async fn pump_upstream(
    mut reader: ReadHalf<UpstreamStream>,
    generation: u64,
    events: mpsc::Sender<UpstreamEvent>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let event = match reader.read(&mut buf).await {
            Ok(0) => UpstreamEvent::Closed { generation },
            Ok(n) => UpstreamEvent::Data {
                generation,
                bytes: buf[..n].to_vec(),
            },
            Err(error) => UpstreamEvent::Failed { generation, error },
        };
        let last = !matches!(event, UpstreamEvent::Data { .. });
        if events.send(event).await.is_err() || last {
            return;
        }
    }
}
