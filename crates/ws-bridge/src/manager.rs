use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::session::{Session, SessionExit, SessionSettings};

/// Metadata kept for each live client session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub remote_addr: SocketAddr,
    pub connected_at: Instant,
}

/// Registry of live client sessions.
///
/// Created once at startup and shared by `Arc`. Entries are added when a
/// client is accepted and removed when its [`Registration`] drops, so every
/// exit path of the per-client task cleans up.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, SessionInfo>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, SessionInfo>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a session for `remote_addr`. It stays registered until the
    /// returned guard is dropped.
    pub fn register(self: &Arc<Self>, remote_addr: SocketAddr) -> Registration {
        let id = Uuid::new_v4();
        self.lock().insert(
            id,
            SessionInfo {
                remote_addr,
                connected_at: Instant::now(),
            },
        );
        Registration {
            id,
            registry: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<SessionInfo> {
        self.lock().get(id).cloned()
    }
}

/// Keeps a session registered for as long as it lives.
#[derive(Debug)]
pub struct Registration {
    id: Uuid,
    registry: Arc<SessionRegistry>,
}

impl Registration {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

/// Creates one [`Session`] per accepted client and runs it to completion.
pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    settings: Arc<SessionSettings>,
    shutdown: broadcast::Sender<()>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        settings: SessionSettings,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            registry,
            settings: Arc::new(settings),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Serve one client WebSocket until it closes, errors, or the process
    /// shuts down. The caster connection, if any, is always released before
    /// this returns.
    pub async fn serve<S>(&self, ws: WebSocketStream<S>, remote_addr: SocketAddr) -> SessionExit
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let registration = self.registry.register(remote_addr);
        let session_id = registration.id();
        tracing::info!(
            %session_id,
            %remote_addr,
            active = self.registry.len(),
            "client session opened"
        );

        let (client_tx, client_rx) = ws.split();
        let session = Session::new(session_id, Arc::clone(&self.settings), client_tx);
        let exit = session.run(client_rx, self.shutdown.subscribe()).await;

        let lifetime = self
            .registry
            .get(&session_id)
            .map(|info| info.connected_at.elapsed())
            .unwrap_or_default();
        drop(registration);
        tracing::info!(
            %session_id,
            %remote_addr,
            ?exit,
            lifetime_ms = lifetime.as_millis() as u64,
            active = self.registry.len(),
            "client session closed"
        );
        exit
    }
}
