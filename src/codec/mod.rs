//! Codec module - streaming MessagePack adapters for the session pipelines.
//!
//! Two stream transforms connect the engine to its byte streams:
//!
//! - [`DecodeStream`] - bytes in, decoded values out, buffering partial items
//! - [`EncodeStream`] - values in, byte chunks out, one chunk per value
//!
//! The session consumes these as opaque transforms; no other codec contract
//! is assumed.

mod decode;
mod encode;

pub use decode::DecodeStream;
pub use encode::EncodeStream;
