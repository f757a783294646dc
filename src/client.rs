//! Request issuer built on [`Session`].
//!
//! A [`Client`] allocates msgids, builds Request/Notification messages, and
//! pairs each request with its response through the session's reservation
//! table. Multiple clients may share one session as long as they share one
//! [`Indexer`], so their msgid spaces do not collide.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rmpv::Value;

use crate::error::{Result, RpcError};
use crate::message::Message;
use crate::session::Session;

type DeserializerFn = dyn Fn(Value) -> Value + Send + Sync;

/// Monotonic msgid source, wrapping modulo 2^32.
///
/// Successive calls return 0, 1, 2, ... 2^32-1, 0, 1, ... Thread-safe at
/// the granularity of single `next()` calls.
#[derive(Debug, Default)]
pub struct Indexer {
    counter: AtomicU32,
}

impl Indexer {
    /// Create an indexer starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an indexer starting at an arbitrary point in the id space.
    pub fn starting_at(start: u32) -> Self {
        Self {
            counter: AtomicU32::new(start),
        }
    }

    /// Produce the next msgid.
    pub fn next(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// Issuer of requests and notifications over a shared [`Session`].
#[derive(Clone)]
pub struct Client {
    session: Session,
    indexer: Arc<Indexer>,
    error_deserializer: Arc<DeserializerFn>,
}

impl Client {
    /// Create a client with its own msgid space.
    pub fn new(session: Session) -> Self {
        Self::with_indexer(session, Arc::new(Indexer::new()))
    }

    /// Create a client sharing an existing msgid space.
    ///
    /// Required when several clients issue calls over the same session.
    pub fn with_indexer(session: Session, indexer: Arc<Indexer>) -> Self {
        Self {
            session,
            indexer,
            error_deserializer: Arc::new(|value| value),
        }
    }

    /// The msgid source, for sharing with further clients.
    pub fn indexer(&self) -> Arc<Indexer> {
        self.indexer.clone()
    }

    /// Set the deserializer applied to non-nil response error slots before
    /// they surface as [`RpcError::Remote`]. Defaults to the identity.
    pub fn set_error_deserializer(
        &mut self,
        deserializer: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) {
        self.error_deserializer = Arc::new(deserializer);
    }

    /// Issue a request and await its response.
    ///
    /// The msgid is reserved before the request can reach the wire, and the
    /// send and the response wait run concurrently - a peer answering before
    /// the send resolves on a slow writer is handled correctly.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let msgid = self.indexer.next();
        let request = Message::request(msgid, method, params.clone());

        let response = self.session.recv(msgid).await?;
        let send = async {
            self.session.send(request).await.map_err(|source| RpcError::Call {
                method: method.to_string(),
                params: format!("{params:?}"),
                source: Box::new(source),
            })
        };
        let ((), response) = tokio::try_join!(send, response)?;

        match response {
            Message::Response { error, result, .. } => {
                if error == Value::Nil {
                    Ok(result)
                } else {
                    Err(RpcError::Remote((self.error_deserializer)(error)))
                }
            }
            // The reservator is resolved exclusively with responses.
            _ => Err(RpcError::SessionClosed),
        }
    }

    /// Send a notification; no response is awaited or expected.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        self.session
            .send(Message::notification(method, params))
            .await
    }
}
