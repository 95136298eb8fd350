//! Delimiter-based line framing for byte streams.

use crate::error::ProtocolError;
use crate::MAX_LINE_LENGTH;
use bytes::{Buf, BytesMut};

/// Splits an incoming byte stream into text lines.
///
/// The delimiter defaults to `\n`; a `\r` left at the end of a line is
/// stripped so both `\n` and `\r\n` peers are accepted.
///
/// A line that outgrows the maximum length is rejected once and then skipped
/// up to its delimiter; lines completed before it stay available.
pub struct LineDecoder {
    buffer: BytesMut,
    delimiter: Vec<u8>,
    max_length: usize,
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_delimiter("\n")
    }

    /// Creates a decoder splitting on `delimiter`. An empty delimiter falls
    /// back to `\n`.
    pub fn with_delimiter(delimiter: &str) -> Self {
        let delimiter = if delimiter.is_empty() {
            b"\n".to_vec()
        } else {
            delimiter.as_bytes().to_vec()
        };
        Self {
            buffer: BytesMut::with_capacity(4096),
            delimiter,
            max_length: MAX_LINE_LENGTH,
            discarding: false,
        }
    }

    /// Sets the maximum number of bytes buffered without a delimiter.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Appends received bytes.
    ///
    /// When the unterminated remainder exceeds the maximum length it is
    /// dropped and [`ProtocolError::LineTooLong`] is returned; the rest of
    /// that line is skipped as it arrives. Complete lines buffered before it
    /// are kept.
    pub fn extend(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.buffer.extend_from_slice(data);
        if self.discarding && !self.skip_overflow() {
            return Ok(());
        }

        let tail = self.last_delimiter_end().unwrap_or(0);
        let pending = self.buffer.len() - tail;
        if pending > self.max_length {
            self.buffer.truncate(tail);
            self.discarding = true;
            return Err(ProtocolError::LineTooLong {
                size: pending,
                max: self.max_length,
            });
        }
        Ok(())
    }

    /// Drops the remainder of an over-long line. Returns whether its
    /// delimiter has been seen.
    fn skip_overflow(&mut self) -> bool {
        match find(&self.buffer, &self.delimiter) {
            Some(pos) => {
                self.buffer.advance(pos + self.delimiter.len());
                self.discarding = false;
                true
            }
            None => {
                // Keep a partial delimiter that may complete with the next chunk.
                let keep = (self.delimiter.len() - 1).min(self.buffer.len());
                let drop = self.buffer.len() - keep;
                self.buffer.advance(drop);
                false
            }
        }
    }

    /// Returns the next complete line, without its delimiter.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = find(&self.buffer, &self.delimiter)?;
        let line = self.buffer.split_to(pos);
        self.buffer.advance(self.delimiter.len());
        let mut text = String::from_utf8_lossy(&line).into_owned();
        if text.ends_with('\r') {
            text.pop();
        }
        Some(text)
    }

    /// Returns the number of buffered bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    fn last_delimiter_end(&self) -> Option<usize> {
        let d = &self.delimiter;
        if self.buffer.len() < d.len() {
            return None;
        }
        (0..=self.buffer.len() - d.len())
            .rev()
            .find(|&i| &self.buffer[i..i + d.len()] == d.as_slice())
            .map(|i| i + d.len())
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        return haystack.iter().position(|&b| b == needle[0]);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Appends the line terminator to `text` unless it already ends with one.
pub fn encode_line(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}
