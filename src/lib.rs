//! # packwire
//!
//! Bidirectional MessagePack-RPC engine: a full-duplex [`Session`] that
//! multiplexes requests, responses, and notifications over a pair of byte
//! streams, plus a thin [`Client`] issuing calls over it.
//!
//! ## Architecture
//!
//! - **Consumer pipeline**: reader bytes -> streaming decode -> classify ->
//!   dispatch (requests/notifications) or resolve (responses)
//! - **Producer pipeline**: internal queue -> encode -> writer
//! - **Reservator**: pairs each generated msgid with its eventual response
//! - **Dispatcher**: user-supplied method table answering the peer
//!
//! Both sides of a connection run the same engine; either side may call,
//! answer, and notify at any time.
//!
//! ## Example
//!
//! ```ignore
//! use packwire::{Client, Dispatcher, Session, Value};
//!
//! #[tokio::main]
//! async fn main() -> packwire::Result<()> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:9000").await?;
//!     let (reader, writer) = stream.into_split();
//!
//!     let session = Session::new(reader, writer);
//!     let mut dispatcher = Dispatcher::new();
//!     dispatcher.register("sum", |params: Vec<Value>| async move {
//!         let total: i64 = params.iter().filter_map(Value::as_i64).sum();
//!         Ok(Value::from(total))
//!     });
//!     session.set_dispatcher(dispatcher);
//!     session.start()?;
//!
//!     let client = Client::new(session.clone());
//!     let three = client.call("sum", vec![Value::from(1), Value::from(2)]).await?;
//!     assert_eq!(three, Value::from(3));
//!
//!     session.shutdown().await
//! }
//! ```

pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod reservator;
pub mod session;

pub use client::{Client, Indexer};
pub use dispatcher::{DispatchError, Dispatcher, Handler, HandlerResult};
pub use error::{Result, RpcError};
pub use message::{is_message, Message};
pub use reservator::Reservator;
pub use session::{ResponseFuture, Session, SessionConfig};

// The value type of every message slot, re-exported for convenience.
pub use rmpv::Value;
