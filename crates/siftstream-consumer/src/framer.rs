//! Newline-delimited JSON framing over an unbounded chunked body.
//!
//! Chunks are buffered as bytes so a multi-byte character split across two
//! chunks is reassembled before decoding.

use std::collections::VecDeque;

use serde_json::Value;

const DELIMITER: u8 = b'\n';

/// A line that could not be decoded as JSON.
#[derive(Clone, Debug, thiserror::Error)]
#[error("could not parse into JSON: {line} with error: {message}")]
pub struct DecodeError {
    pub line: String,
    pub message: String,
}

/// Splits a byte stream into JSON records, keeping the unterminated tail.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the records it completes.
    ///
    /// Lines are decoded lazily as the returned iterator is advanced. A line
    /// that fails to decode yields an `Err` and iteration carries on.
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Records {
        let chunk = chunk.as_ref();
        self.buffer.extend_from_slice(chunk);

        if !chunk.contains(&DELIMITER) {
            return Records::default();
        }

        let mut lines: VecDeque<Vec<u8>> = self
            .buffer
            .split(|b| *b == DELIMITER)
            .map(<[u8]>::to_vec)
            .collect();

        // The last piece is always the new tail, possibly empty.
        self.buffer = lines.pop_back().unwrap_or_default();

        Records { lines }
    }

    /// Unconsumed bytes not yet terminated by a newline.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Lazily decoded records completed by one [`LineFramer::feed`] call.
#[derive(Debug, Default)]
pub struct Records {
    lines: VecDeque<Vec<u8>>,
}

impl Iterator for Records {
    type Item = Result<Value, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.pop_front()?;
            // Keep-alive newlines carry nothing to decode.
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(serde_json::from_slice(&line).map_err(|e| DecodeError {
                line: String::from_utf8_lossy(&line).into_owned(),
                message: e.to_string(),
            }));
        }
    }
}
