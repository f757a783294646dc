//! Streaming MessagePack value decoder.
//!
//! Transforms byte chunks into decoded values. MessagePack is
//! self-delimiting, so there is no header to parse: the decoder keeps
//! partial items buffered in a single `BytesMut` and emits one value per
//! complete item.
//!
//! # Example
//!
//! ```
//! use packwire::codec::DecodeStream;
//!
//! let mut decoder = DecodeStream::new();
//!
//! // Data arrives in chunks from the reader.
//! let mut bytes = Vec::new();
//! rmpv::encode::write_value(&mut bytes, &rmpv::Value::from("hello")).unwrap();
//! let values = decoder.push(&bytes).unwrap();
//!
//! assert_eq!(values, vec![rmpv::Value::from("hello")]);
//! ```

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use rmpv::Value;

use crate::error::Result;

/// Initial capacity of the accumulation buffer.
const INITIAL_CAPACITY: usize = 64 * 1024;

/// Buffer that accumulates incoming bytes and extracts complete values.
///
/// A truncated item is not an error: it stays buffered until the next feed
/// completes it. Any other decode failure is fatal for the stream and is
/// returned as an error.
pub struct DecodeStream {
    buffer: BytesMut,
}

impl DecodeStream {
    /// Create an empty decode stream.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Append a chunk of bytes without decoding.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Try to extract the next complete value from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(value))` if a complete value was decoded
    /// - `Ok(None)` if more bytes are needed
    /// - `Err(...)` if the buffered bytes are not valid MessagePack
    pub fn next_value(&mut self) -> Result<Option<Value>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.buffer[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                self.buffer.advance(consumed);
                Ok(Some(value))
            }
            Err(err) if is_truncated(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Push a chunk and extract all values it completes.
    ///
    /// Convenience wrapper over [`feed`](Self::feed) and
    /// [`next_value`](Self::next_value).
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Value>> {
        self.feed(chunk);
        let mut values = Vec::new();
        while let Some(value) = self.next_value()? {
            values.push(value);
        }
        Ok(values)
    }

    /// Number of buffered bytes still waiting for completion.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for DecodeStream {
    fn default() -> Self {
        Self::new()
    }
}

/// A read error caused by running out of input, as opposed to malformed
/// input.
fn is_truncated(err: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error;
    match err {
        Error::InvalidMarkerRead(io) | Error::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}
