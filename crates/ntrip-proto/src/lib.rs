//! # ntrip-proto
//!
//! Pure protocol pieces of the NTRIP client side: building the caster
//! request, buffering and classifying the caster's response header, and
//! validating the position sentences a rover sends upstream. Nothing in this
//! crate performs I/O.
//!
//! ## Quick start
//!
//! ```rust
//! use ntrip_proto::{build_request, Credentials, HandshakeBuffer};
//!
//! let creds = Credentials::new("rover", Some("secret"));
//! let request = build_request("RTCM3", "caster.example.com", Some(&creds));
//! assert!(request.starts_with(b"GET /RTCM3 HTTP/1.1\r\n"));
//!
//! let mut buffer = HandshakeBuffer::default();
//! assert!(buffer.feed(b"ICY 200").unwrap().is_none());
//! let response = buffer.feed(b" OK\r\n\r\nDATA").unwrap().unwrap();
//! assert_eq!(response.leftover, b"DATA");
//! ```

pub mod handshake;
pub mod position;
pub mod request;

pub use handshake::{
    excerpt, status_accepted, HandshakeBuffer, HandshakeError, HandshakeResponse,
    DEFAULT_MAX_HEADER_BYTES, HEADER_TERMINATOR, MAX_EXCERPT_CHARS,
};
pub use position::{PositionReport, ReportError, MAX_REPORT_BYTES};
pub use request::{build_request, Credentials, USER_AGENT};
