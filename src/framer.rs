//! Line framing for byte streams.
//!
//! A [`Framer`] turns arbitrary read chunks into complete lines. Content
//! after the last separator is held back and prefixed to the next chunk,
//! so the output never depends on where the reads happened to split.
//!
//! The separator is a type parameter: the IRC stream and the FTP control
//! channel each own an independent `Framer<Crlf>`.
//!
//! Empty lines are dropped. A CRLF split across two reads therefore
//! needs no special casing: the CR terminates the line and the LF that
//! opens the next chunk only produces an empty line.

use std::marker::PhantomData;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::NetError;

/// Longest line accepted by default.
pub const MAX_LINE_LEN: usize = 8191;

/// A line terminator family.
pub trait Separator {
    /// Returns true if `byte` ends a line.
    fn is_separator(byte: u8) -> bool;
}

/// CR, LF or any run of the two.
#[derive(Clone, Copy, Debug, Default)]
pub struct Crlf;

impl Separator for Crlf {
    #[inline]
    fn is_separator(byte: u8) -> bool {
        byte == b'\r' || byte == b'\n'
    }
}

/// Incremental line splitter.
#[derive(Debug)]
pub struct Framer<S: Separator> {
    pending: BytesMut,
    max_len: usize,
    _separator: PhantomData<S>,
}

impl<S: Separator> Default for Framer<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Separator> Framer<S> {
    /// Create a framer with the default length cap.
    pub fn new() -> Self {
        Self::with_max_len(MAX_LINE_LEN)
    }

    /// Create a framer that rejects lines longer than `max_len` bytes.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            max_len,
            _separator: PhantomData,
        }
    }

    /// True when no partial line is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Bytes of the buffered partial line.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Drop any buffered partial line.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Feed one read chunk and collect every line it completes.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::MessageTooLong`] if a line, complete or
    /// still pending, grows past the cap. The framer is cleared and the
    /// caller is expected to close the connection.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, NetError> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(line) = self.next_line()? {
            lines.push(line);
        }
        Ok(lines)
    }

    fn next_line(&mut self) -> Result<Option<Bytes>, NetError> {
        loop {
            let Some(end) = self.pending.iter().position(|b| S::is_separator(*b)) else {
                if self.pending.len() > self.max_len {
                    return Err(self.overflow(self.pending.len()));
                }
                return Ok(None);
            };

            if end == 0 {
                self.pending.advance(1);
                continue;
            }
            if end > self.max_len {
                return Err(self.overflow(end));
            }

            let line = self.pending.split_to(end).freeze();
            self.pending.advance(1);
            return Ok(Some(line));
        }
    }

    fn overflow(&mut self, actual: usize) -> NetError {
        self.pending.clear();
        NetError::MessageTooLong {
            actual,
            limit: self.max_len,
        }
    }
}

impl<S: Separator> Decoder for Framer<S> {
    type Item = Bytes;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, NetError> {
        if !src.is_empty() {
            let chunk = src.split();
            self.pending.extend_from_slice(&chunk);
        }
        self.next_line()
    }
}
