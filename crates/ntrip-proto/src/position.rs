use std::fmt;

use thiserror::Error;

/// Longest sentence accepted, in bytes. NMEA 0183 caps a sentence at 82
/// characters; the headroom covers proprietary and multi-constellation
/// variants.
pub const MAX_REPORT_BYTES: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error("position report is empty")]
    Empty,
    #[error("position report must start with '$'")]
    MissingPrefix,
    #[error("position report must be a single line")]
    MultiLine,
    #[error("position report exceeds {limit} bytes")]
    TooLong { limit: usize },
}

/// A single client-supplied positioning sentence (typically `$GPGGA`/`$GNGGA`).
///
/// Surrounding whitespace and line terminators are stripped on parse; the
/// wire form re-adds exactly one CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionReport(String);

impl PositionReport {
    pub fn parse(sentence: &str) -> Result<Self, ReportError> {
        let sentence = sentence.trim();
        if sentence.len() > MAX_REPORT_BYTES {
            return Err(ReportError::TooLong {
                limit: MAX_REPORT_BYTES,
            });
        }
        if sentence.is_empty() {
            return Err(ReportError::Empty);
        }
        if !sentence.starts_with('$') {
            return Err(ReportError::MissingPrefix);
        }
        if sentence.contains(['\r', '\n']) {
            return Err(ReportError::MultiLine);
        }
        Ok(Self(sentence.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bytes written to the caster: the sentence followed by CRLF.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut line = Vec::with_capacity(self.0.len() + 2);
        line.extend_from_slice(self.0.as_bytes());
        line.extend_from_slice(b"\r\n");
        line
    }
}

impl fmt::Display for PositionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
