//! Error types for packwire.

use std::sync::Arc;

use rmpv::Value;
use thiserror::Error;

/// Main error type for all packwire operations.
///
/// The enum is `Clone` (stream-level payloads are held behind `Arc`) so the
/// single pipeline outcome can be observed by every `wait()` caller.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// I/O error on the underlying byte streams.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The inbound byte stream stopped being decodable MessagePack.
    #[error("MessagePack decode error: {0}")]
    Decode(Arc<rmpv::decode::Error>),

    /// A value could not be encoded to MessagePack.
    #[error("MessagePack encode error: {0}")]
    Encode(Arc<rmpv::encode::Error>),

    /// A session operation was attempted outside the Running state.
    #[error("Session is not running")]
    NotRunning,

    /// `start` was called on a session that already ran.
    #[error("Session is already running")]
    AlreadyRunning,

    /// An inbound request named a method with no handler.
    #[error("No MessagePack-RPC method '{0}' exists")]
    NoMethodFound(String),

    /// Two concurrent receives were issued for the same msgid.
    #[error("msgid {0} is already reserved")]
    AlreadyReserved(u32),

    /// A response arrived for a msgid that was never reserved.
    #[error("msgid {0} is not reserved")]
    NotReserved(u32),

    /// The session tore down while a response was still pending.
    #[error("Session closed before a response arrived")]
    SessionClosed,

    /// A pipeline task ended abnormally (panicked).
    #[error("pipeline task failed: {0}")]
    Pipeline(String),

    /// A notification handler failed; the payload is the handler's error value.
    #[error("handler failed: {0}")]
    Handler(Value),

    /// The peer answered with a non-nil error slot.
    #[error("remote error: {0}")]
    Remote(Value),

    /// Sending a request failed inside `Client::call`.
    #[error("call to '{method}' with params {params} failed: {source}")]
    Call {
        method: String,
        params: String,
        #[source]
        source: Box<RpcError>,
    },
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io(Arc::new(err))
    }
}

impl From<rmpv::decode::Error> for RpcError {
    fn from(err: rmpv::decode::Error) -> Self {
        RpcError::Decode(Arc::new(err))
    }
}

impl From<rmpv::encode::Error> for RpcError {
    fn from(err: rmpv::encode::Error) -> Self {
        RpcError::Encode(Arc::new(err))
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
