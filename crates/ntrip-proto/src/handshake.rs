use thiserror::Error;

/// Blank line that ends the caster's response header.
pub const HEADER_TERMINATOR: &[u8; 4] = b"\r\n\r\n";

/// Default bound on buffered header bytes before the response is given up on.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;

/// Longest header excerpt carried in diagnostics sent back to clients.
pub const MAX_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The caster answered with a status other than success.
    #[error("NTRIP handshake failed: {}", excerpt(.header, MAX_EXCERPT_CHARS))]
    Rejected { header: String },

    /// No header terminator within the configured limit.
    #[error("NTRIP handshake failed: response header exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    /// The caster closed the connection before finishing its header.
    #[error("NTRIP handshake failed: caster closed the connection after {received} header bytes")]
    Truncated { received: usize },
}

/// A successfully parsed caster response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Header text, decoded byte-for-char (latin-1) and without the terminator.
    pub header: String,
    /// Bytes that followed the terminator in the same read. These are
    /// correction data and must be forwarded as-is.
    pub leftover: Vec<u8>,
}

/// Accumulates caster bytes until the response header is complete.
///
/// The result is independent of how the header is split across chunks.
#[derive(Debug)]
pub struct HandshakeBuffer {
    buf: Vec<u8>,
    max_header_bytes: usize,
}

impl Default for HandshakeBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_BYTES)
    }
}

impl HandshakeBuffer {
    pub fn new(max_header_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_header_bytes,
        }
    }

    /// Number of bytes buffered so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append `chunk` and try to complete the header.
    ///
    /// Returns `Ok(None)` while the terminator has not arrived yet,
    /// `Ok(Some(_))` for an accepted response and an error for a rejected,
    /// oversized or otherwise unusable one. Once a final answer has been
    /// returned the buffer is empty again.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<HandshakeResponse>, HandshakeError> {
        // The terminator may straddle the previous chunk boundary.
        let search_from = self.buf.len().saturating_sub(HEADER_TERMINATOR.len() - 1);
        self.buf.extend_from_slice(chunk);

        let Some(pos) = find_terminator(&self.buf[search_from..]).map(|p| p + search_from) else {
            if self.buf.len() > self.max_header_bytes {
                self.buf.clear();
                return Err(HandshakeError::HeaderTooLarge {
                    limit: self.max_header_bytes,
                });
            }
            return Ok(None);
        };

        if pos > self.max_header_bytes {
            self.buf.clear();
            return Err(HandshakeError::HeaderTooLarge {
                limit: self.max_header_bytes,
            });
        }

        let mut bytes = std::mem::take(&mut self.buf);
        let leftover = bytes.split_off(pos + HEADER_TERMINATOR.len());
        let header = decode_latin1(&bytes[..pos]);

        if status_accepted(&header) {
            Ok(Some(HandshakeResponse { header, leftover }))
        } else {
            Err(HandshakeError::Rejected { header })
        }
    }

    /// The upstream ended before the terminator arrived.
    pub fn finish(&mut self) -> HandshakeError {
        let received = self.buf.len();
        self.buf.clear();
        HandshakeError::Truncated { received }
    }
}

/// Classify a response header by its status line.
///
/// `ICY 200 OK` (NTRIP 1.0) and HTTP status lines carrying a `200` token
/// (NTRIP 2.0) are accepted. A `SOURCETABLE 200 OK` answer means the
/// mountpoint is unknown and is rejected.
pub fn status_accepted(header: &str) -> bool {
    let status_line = header.lines().next().unwrap_or("").trim();

    if status_line.starts_with("ICY 200") {
        return true;
    }
    if status_line.starts_with("SOURCETABLE") {
        return false;
    }
    status_line.split_whitespace().skip(1).any(|token| token == "200")
}

/// Truncate `text` to at most `max_chars` characters for diagnostics.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

// Caster identifiers are not always UTF-8; map every byte to one char.
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}
