//! MessagePack value encoder.
//!
//! Transforms values into byte chunks, one chunk per value. MessagePack is
//! self-delimiting, so chunks concatenate into a valid stream with no
//! additional framing.

use bytes::Bytes;
use rmpv::Value;

use crate::error::Result;

/// Encoder producing one byte chunk per value.
///
/// Implemented as a marker struct with static methods; there is no state to
/// carry between values.
pub struct EncodeStream;

impl EncodeStream {
    /// Encode a value to a MessagePack byte chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn encode(value: &Value) -> Result<Bytes> {
        let mut bytes = Vec::with_capacity(128);
        rmpv::encode::write_value(&mut bytes, value)?;
        Ok(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DecodeStream;

    #[test]
    fn test_encode_decode_round_trip() {
        let value = Value::Array(vec![
            Value::from(1u64),
            Value::from(0u32),
            Value::Nil,
            Value::from(3),
        ]);
        let chunk = EncodeStream::encode(&value).unwrap();

        let mut decoder = DecodeStream::new();
        let values = decoder.push(&chunk).unwrap();
        assert_eq!(values, vec![value]);
    }

    #[test]
    fn test_chunks_concatenate_into_a_stream() {
        let first = EncodeStream::encode(&Value::from("one")).unwrap();
        let second = EncodeStream::encode(&Value::from(2)).unwrap();

        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);

        let mut decoder = DecodeStream::new();
        let values = decoder.push(&stream).unwrap();
        assert_eq!(values, vec![Value::from("one"), Value::from(2)]);
    }

    #[test]
    fn test_nil_encodes_to_single_byte() {
        let chunk = EncodeStream::encode(&Value::Nil).unwrap();
        assert_eq!(chunk.as_ref(), &[0xc0]);
    }
}
