//! Method dispatch table for inbound requests and notifications.
//!
//! Maps method names to async handlers. A handler receives the request
//! params and produces either a value for the response `result` slot or a
//! MessagePack-encodable error payload.
//!
//! # Example
//!
//! ```
//! use packwire::dispatcher::Dispatcher;
//! use rmpv::Value;
//!
//! let mut dispatcher = Dispatcher::new();
//! dispatcher.register("sum", |params: Vec<Value>| async move {
//!     let total: i64 = params.iter().filter_map(Value::as_i64).sum();
//!     Ok(Value::from(total))
//! });
//! assert!(dispatcher.has("sum"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rmpv::Value;

use crate::error::RpcError;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type for handler functions: a value for the response `result`
/// slot, or an error payload for the `error` slot.
pub type HandlerResult = std::result::Result<Value, Value>;

/// Trait for method handlers.
///
/// Implemented for every `Fn(Vec<Value>) -> impl Future<Output =
/// HandlerResult>` closure, so plain async closures register directly.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request with the given params.
    fn call(&self, params: Vec<Value>) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, params: Vec<Value>) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self)(params))
    }
}

/// Why a dispatch produced no result value.
#[derive(Debug, Clone)]
pub enum DispatchError {
    /// No handler is registered under the method name.
    NoMethodFound(String),
    /// The handler ran and failed with this payload.
    Failed(Value),
}

impl From<DispatchError> for RpcError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NoMethodFound(method) => RpcError::NoMethodFound(method),
            DispatchError::Failed(value) => RpcError::Handler(value),
        }
    }
}

/// Registry mapping method names to handlers.
///
/// Mutable after construction; the running session observes whichever
/// dispatcher was last installed at the moment of each dispatch.
#[derive(Default)]
pub struct Dispatcher {
    methods: HashMap<String, Arc<dyn Handler>>,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Register a method handler, replacing any previous entry.
    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.methods.insert(name.to_string(), Arc::new(handler));
    }

    /// Remove a method handler. Returns true if an entry existed.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.methods.remove(name).is_some()
    }

    /// Whether a handler is registered under the name.
    pub fn has(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Get a handler by method name.
    pub fn get(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.methods.get(method).cloned()
    }

    /// Dispatch a request to the appropriate handler.
    ///
    /// The existence check happens before the invoke, so a missing entry is
    /// never confused with a handler failure that merely looks missing.
    pub async fn dispatch(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> std::result::Result<Value, DispatchError> {
        let handler = self
            .get(method)
            .ok_or_else(|| DispatchError::NoMethodFound(method.to_string()))?;
        handler.call(params).await.map_err(DispatchError::Failed)
    }
}
