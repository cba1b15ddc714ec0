//! Incremental text deltas from whole-sequence decodes.
//!
//! Some decoders can only turn a complete token sequence into text; decoding
//! one token at a time mangles leading whitespace and splits multi-byte
//! characters. The engine therefore reports the full decode of everything
//! generated so far, and [`StreamDiffer`] turns each snapshot into the new
//! suffix that has not been emitted yet.

use crate::error::CoreError;

/// Tracks how much decoded text has already been emitted.
#[derive(Debug, Clone, Default)]
pub struct StreamDiffer {
    emitted_len: usize,
}

impl StreamDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the part of `full_text` past what was previously emitted.
    ///
    /// A snapshot shorter than the emitted prefix, or one whose previous
    /// length falls inside a character, is a protocol violation.
    pub fn next_delta<'a>(&mut self, full_text: &'a str) -> Result<&'a str, CoreError> {
        if full_text.len() < self.emitted_len {
            return Err(CoreError::ProtocolViolation(format!(
                "decoded text shrank from {} to {} bytes",
                self.emitted_len,
                full_text.len()
            )));
        }
        if !full_text.is_char_boundary(self.emitted_len) {
            return Err(CoreError::ProtocolViolation(format!(
                "emitted prefix of {} bytes ends inside a character",
                self.emitted_len
            )));
        }
        let delta = &full_text[self.emitted_len..];
        self.emitted_len = full_text.len();
        Ok(delta)
    }

    /// Bytes of decoded text emitted so far.
    pub fn emitted_len(&self) -> usize {
        self.emitted_len
    }
}
