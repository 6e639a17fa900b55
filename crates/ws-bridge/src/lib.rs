//! WebSocket to NTRIP caster bridge.
//!
//! Browsers cannot open raw TCP or TLS sockets, so a browser-based GNSS
//! rover talks JSON over a WebSocket to this crate, which opens the caster
//! connection on its behalf, performs the NTRIP handshake and relays the
//! correction stream back as binary frames.
//!
//! # Architecture
//!
//! ```text
//! Browser  <--WS-->  Bridge/SessionManager  <--TCP/TLS-->  NTRIP caster
//!                          |
//!                 Session (one per client)
//!                   |            |
//!            client frames   UpstreamEvent queue <-- Relay reader task
//! ```
//!
//! Every client gets a session whose event loop is
//! the only place its state changes. Client frames, caster bytes, dial
//! results and timers are all consumed by that single loop, so a teardown
//! and a reconnect can never race.

pub mod listener;
pub mod manager;
pub mod messages;
mod relay;
pub mod session;
pub mod upstream;

// Re-export the primary public types at the crate root for convenience.
pub use listener::{Bridge, BridgeConfig};
pub use manager::{Registration, SessionInfo, SessionManager, SessionRegistry};
pub use messages::{ClientMessage, ConnectRequest, ServerMessage, SessionStatus};
pub use session::{SessionExit, SessionSettings, SessionState};
pub use upstream::{ConnectError, UpstreamStream, UpstreamTarget};
