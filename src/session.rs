//! The MessagePack-RPC session engine.
//!
//! A [`Session`] takes exclusive hold of one inbound byte reader and one
//! outbound byte writer and runs two concurrent pipelines:
//!
//! ```text
//! reader ─► DecodeStream ─► classify ──┬─► Request      ─► dispatch ─► queue
//!                                      ├─► Response     ─► Reservator
//!                                      └─► Notification ─► dispatch
//!
//! send() ───────────────────────────────────────────────────────► queue
//! queue ─► EncodeStream ─► writer
//! ```
//!
//! The *consumer* decodes inbound bytes and classifies each value: requests
//! and notifications are dispatched on detached tasks (dispatch is never
//! serialized), responses resolve their msgid reservation. The *producer*
//! drains the internal queue, encodes, and writes.
//!
//! Lifecycle is `Idle -> Running -> Terminated`; the terminal state is
//! absorbing and a session is not restartable. [`Session::shutdown`] stops
//! the inbound side and drains the outbound queue; [`Session::force_shutdown`]
//! cancels both pipelines and may lose queued messages.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::task::{Context, Poll};

use bytes::BytesMut;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::{DecodeStream, EncodeStream};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::error::{Result, RpcError};
use crate::message::Message;
use crate::reservator::Reservator;

/// Default capacity of the outbound message queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default consumer read buffer size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum messages encoded into a single write.
const MAX_WRITE_BATCH: usize = 64;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type SerializerFn = dyn Fn(Value) -> Value + Send + Sync;
type InvalidMessageHook = dyn Fn(&Value) + Send + Sync;
type MessageErrorHook = dyn Fn(&RpcError, &Message) + Send + Sync;

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the outbound message queue. `send` suspends when the
    /// queue is full, which is how writer backpressure reaches callers.
    pub queue_capacity: usize,
    /// Size of the consumer's read buffer.
    pub read_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Where the session is in its life.
enum Lifecycle {
    Idle {
        reader: BoxedReader,
        writer: BoxedWriter,
    },
    Running(Runtime),
    Terminated,
}

/// State that exists only while the session is running.
struct Runtime {
    reservator: Arc<Reservator>,
    outbound: mpsc::Sender<Message>,
    consumer_cancel: CancellationToken,
    producer_cancel: CancellationToken,
    done: watch::Receiver<Option<Result<()>>>,
}

struct Shared {
    lifecycle: Mutex<Lifecycle>,
    dispatcher: RwLock<Arc<Dispatcher>>,
    error_serializer: RwLock<Arc<SerializerFn>>,
    on_invalid_message: RwLock<Option<Arc<InvalidMessageHook>>>,
    on_message_error: RwLock<Option<Arc<MessageErrorHook>>>,
    config: SessionConfig,
}

/// A full-duplex MessagePack-RPC session over a pair of byte streams.
///
/// Cheaply cloneable handle; clones share one underlying session. Build a
/// [`Client`](crate::client::Client) on top to issue calls, and install a
/// [`Dispatcher`] to answer the peer's.
///
/// # Example
///
/// ```ignore
/// let (stream, _peer) = tokio::io::duplex(4096);
/// let (reader, writer) = tokio::io::split(stream);
///
/// let session = Session::new(reader, writer);
/// let mut dispatcher = Dispatcher::new();
/// dispatcher.register("sum", |params: Vec<Value>| async move {
///     let total: i64 = params.iter().filter_map(Value::as_i64).sum();
///     Ok(Value::from(total))
/// });
/// session.set_dispatcher(dispatcher);
/// session.start()?;
/// // ... issue calls through a Client ...
/// session.shutdown().await?;
/// ```
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Create a session over the given streams with default configuration.
    ///
    /// The session holds the streams exclusively from [`start`](Self::start)
    /// until termination.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self::with_config(reader, writer, SessionConfig::default())
    }

    /// Create a session with custom configuration.
    pub fn with_config(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        config: SessionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle::Idle {
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                }),
                dispatcher: RwLock::new(Arc::new(Dispatcher::new())),
                error_serializer: RwLock::new(Arc::new(|value| value)),
                on_invalid_message: RwLock::new(None),
                on_message_error: RwLock::new(None),
                config,
            }),
        }
    }

    /// Install the dispatcher answering inbound requests and notifications.
    ///
    /// May be called at any time; each dispatch observes the dispatcher
    /// current at that moment.
    pub fn set_dispatcher(&self, dispatcher: Dispatcher) {
        *write(&self.shared.dispatcher) = Arc::new(dispatcher);
    }

    /// Set the serializer turning handler error payloads into wire values.
    /// Defaults to the identity.
    pub fn set_error_serializer(&self, serializer: impl Fn(Value) -> Value + Send + Sync + 'static) {
        *write(&self.shared.error_serializer) = Arc::new(serializer);
    }

    /// Set the hook invoked with decoded values that are not valid messages.
    pub fn on_invalid_message(&self, hook: impl Fn(&Value) + Send + Sync + 'static) {
        *write(&self.shared.on_invalid_message) = Some(Arc::new(hook));
    }

    /// Set the hook invoked when handling a valid message fails (orphan
    /// response, notification handler failure, response enqueue failure).
    pub fn on_message_error(&self, hook: impl Fn(&RpcError, &Message) + Send + Sync + 'static) {
        *write(&self.shared.on_message_error) = Some(Arc::new(hook));
    }

    /// Launch the consumer and producer pipelines.
    ///
    /// Must be called within a Tokio runtime. Fails with
    /// [`RpcError::AlreadyRunning`] when called twice.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = lock(&self.shared.lifecycle);
        let (reader, writer) = match std::mem::replace(&mut *lifecycle, Lifecycle::Terminated) {
            Lifecycle::Idle { reader, writer } => (reader, writer),
            other => {
                *lifecycle = other;
                return Err(RpcError::AlreadyRunning);
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(self.shared.config.queue_capacity);
        let (done_tx, done_rx) = watch::channel(None);
        let reservator = Arc::new(Reservator::new());
        let consumer_cancel = CancellationToken::new();
        let producer_cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let context = ConsumerContext {
            shared: self.shared.clone(),
            reservator: reservator.clone(),
            outbound: outbound_tx.clone(),
            cancel: consumer_cancel.clone(),
            abort: producer_cancel.clone(),
            tracker: tracker.clone(),
        };
        let consumer = tokio::spawn(consumer_loop(reader, context));
        let producer = tokio::spawn(producer_loop(outbound_rx, writer, producer_cancel.clone()));
        tokio::spawn(supervise(
            self.shared.clone(),
            consumer,
            producer,
            consumer_cancel.clone(),
            tracker,
            reservator.clone(),
            done_tx,
        ));

        *lifecycle = Lifecycle::Running(Runtime {
            reservator,
            outbound: outbound_tx,
            consumer_cancel,
            producer_cancel,
            done: done_rx,
        });
        tracing::debug!("session started");
        Ok(())
    }

    /// Enqueue a message onto the outbound queue.
    ///
    /// Resolves once the message is queued, not once it reaches the wire.
    /// Suspends while the queue is at capacity.
    pub async fn send(&self, message: Message) -> Result<()> {
        let outbound = match &*lock(&self.shared.lifecycle) {
            Lifecycle::Running(runtime) => runtime.outbound.clone(),
            _ => return Err(RpcError::NotRunning),
        };
        outbound
            .send(message)
            .await
            .map_err(|_| RpcError::NotRunning)
    }

    /// Reserve a msgid and return a future resolving to its response.
    ///
    /// The reservation is taken before this method returns, so a response
    /// racing the request cannot arrive unreserved. Fails with
    /// [`RpcError::AlreadyReserved`] when the msgid already has a waiter.
    pub async fn recv(&self, msgid: u32) -> Result<ResponseFuture> {
        let reservator = match &*lock(&self.shared.lifecycle) {
            Lifecycle::Running(runtime) => runtime.reservator.clone(),
            _ => return Err(RpcError::NotRunning),
        };
        let receiver = reservator.reserve(msgid).await?;
        Ok(ResponseFuture { receiver })
    }

    /// Wait until both pipelines have terminated.
    ///
    /// Resolves `Ok` on clean termination (reader EOF, `shutdown`,
    /// `force_shutdown`) and `Err` when a pipeline failed.
    pub async fn wait(&self) -> Result<()> {
        let done = match &*lock(&self.shared.lifecycle) {
            Lifecycle::Running(runtime) => runtime.done.clone(),
            _ => return Err(RpcError::NotRunning),
        };
        await_done(done).await
    }

    /// Graceful shutdown: stop accepting inbound messages, let in-flight
    /// dispatches finish, drain the outbound queue, flush the writer.
    ///
    /// Every message enqueued before this call returns is on the wire
    /// (modulo writer errors) by the time it resolves.
    pub async fn shutdown(&self) -> Result<()> {
        let (cancel, done) = match &*lock(&self.shared.lifecycle) {
            Lifecycle::Running(runtime) => {
                (runtime.consumer_cancel.clone(), runtime.done.clone())
            }
            _ => return Err(RpcError::NotRunning),
        };
        tracing::debug!("graceful shutdown requested");
        cancel.cancel();
        await_done(done).await
    }

    /// Abrupt shutdown: cancel both pipelines. Queued outbound messages may
    /// be lost.
    pub async fn force_shutdown(&self) -> Result<()> {
        let (consumer_cancel, producer_cancel, done) = match &*lock(&self.shared.lifecycle) {
            Lifecycle::Running(runtime) => (
                runtime.consumer_cancel.clone(),
                runtime.producer_cancel.clone(),
                runtime.done.clone(),
            ),
            _ => return Err(RpcError::NotRunning),
        };
        tracing::debug!("forced shutdown requested");
        consumer_cancel.cancel();
        producer_cancel.cancel();
        await_done(done).await
    }
}

/// Future resolving to the response for a reserved msgid.
///
/// Fails with [`RpcError::SessionClosed`] when the session tears down while
/// the response is still pending.
pub struct ResponseFuture {
    receiver: oneshot::Receiver<Message>,
}

impl Future for ResponseFuture {
    type Output = Result<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|res| res.map_err(|_| RpcError::SessionClosed))
    }
}

async fn await_done(mut done: watch::Receiver<Option<Result<()>>>) -> Result<()> {
    loop {
        {
            let value = done.borrow_and_update();
            if let Some(outcome) = value.as_ref() {
                return outcome.clone();
            }
        }
        if done.changed().await.is_err() {
            return Ok(());
        }
    }
}

impl Shared {
    fn current_dispatcher(&self) -> Arc<Dispatcher> {
        read(&self.dispatcher).clone()
    }

    fn serialize_error(&self, error: Value) -> Value {
        let serializer = read(&self.error_serializer).clone();
        let fallback = error.clone();
        // A panicking serializer falls back to the identity.
        match catch_unwind(AssertUnwindSafe(|| serializer(error))) {
            Ok(value) => value,
            Err(_) => fallback,
        }
    }

    fn invoke_invalid_message(&self, value: &Value) {
        let hook = read(&self.on_invalid_message).clone();
        if let Some(hook) = hook {
            // Hook panics never terminate the session.
            let _ = catch_unwind(AssertUnwindSafe(|| hook(value)));
        }
    }

    fn invoke_message_error(&self, error: &RpcError, message: &Message) {
        let hook = read(&self.on_message_error).clone();
        if let Some(hook) = hook {
            let _ = catch_unwind(AssertUnwindSafe(|| hook(error, message)));
        }
    }
}

/// Everything the consumer needs to classify and handle inbound values.
struct ConsumerContext {
    shared: Arc<Shared>,
    reservator: Arc<Reservator>,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    /// Detached dispatch tasks die with the producer on forced shutdown.
    abort: CancellationToken,
    tracker: TaskTracker,
}

impl ConsumerContext {
    async fn handle_value(&self, value: Value) {
        let message = match Message::from_value(value) {
            Ok(message) => message,
            Err(value) => {
                tracing::warn!("discarding invalid inbound value");
                self.shared.invoke_invalid_message(&value);
                return;
            }
        };
        match message {
            Message::Request {
                msgid,
                method,
                params,
            } => self.spawn_request(msgid, method, params),
            Message::Response { .. } => self.resolve_response(message).await,
            Message::Notification { method, params } => self.spawn_notification(method, params),
        }
    }

    fn spawn_request(&self, msgid: u32, method: String, params: Vec<Value>) {
        let shared = self.shared.clone();
        let outbound = self.outbound.clone();
        let abort = self.abort.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = abort.cancelled() => {}
                _ = respond_to_request(shared, outbound, msgid, method, params) => {}
            }
        });
    }

    async fn resolve_response(&self, message: Message) {
        let msgid = message.msgid().unwrap_or_default();
        if let Err(orphan) = self.reservator.resolve(msgid, message).await {
            let error = RpcError::NotReserved(msgid);
            tracing::warn!(msgid, "response for unreserved msgid");
            self.shared.invoke_message_error(&error, &orphan);
        }
    }

    fn spawn_notification(&self, method: String, params: Vec<Value>) {
        let shared = self.shared.clone();
        let abort = self.abort.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = abort.cancelled() => {}
                _ = run_notification(shared, method, params) => {}
            }
        });
    }
}

/// Consumer pipeline: reader bytes -> decoded values -> classified handling.
async fn consumer_loop(mut reader: BoxedReader, context: ConsumerContext) -> Result<()> {
    let mut decoder = DecodeStream::new();
    let mut buf = vec![0u8; context.shared.config.read_buffer_size];
    loop {
        let n = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => {
                tracing::debug!("consumer cancelled");
                return Ok(());
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!("reader closed");
                    return Ok(());
                }
                Ok(n) => n,
                Err(err) => return Err(err.into()),
            },
        };
        decoder.feed(&buf[..n]);
        loop {
            match decoder.next_value() {
                Ok(Some(value)) => context.handle_value(value).await,
                Ok(None) => break,
                // Values decoded before the error were already handled.
                Err(err) => return Err(err),
            }
        }
    }
}

/// Dispatch an inbound request and enqueue its response.
async fn respond_to_request(
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Message>,
    msgid: u32,
    method: String,
    params: Vec<Value>,
) {
    let dispatcher = shared.current_dispatcher();
    let response = match dispatcher.dispatch(&method, params).await {
        Ok(result) => Message::response(msgid, result),
        Err(DispatchError::Failed(error)) => {
            Message::response_error(msgid, shared.serialize_error(error))
        }
        Err(DispatchError::NoMethodFound(name)) => {
            let error = RpcError::NoMethodFound(name);
            Message::response_error(msgid, Value::from(error.to_string()))
        }
    };
    if let Err(failed) = outbound.send(response).await {
        let message = failed.0;
        tracing::warn!(msgid, "failed to enqueue response");
        shared.invoke_message_error(&RpcError::NotRunning, &message);
    }
}

/// Dispatch an inbound notification; failures reach the hook, never the wire.
async fn run_notification(shared: Arc<Shared>, method: String, params: Vec<Value>) {
    let dispatcher = shared.current_dispatcher();
    if let Err(err) = dispatcher.dispatch(&method, params.clone()).await {
        let error = RpcError::from(err);
        let message = Message::notification(method, params);
        shared.invoke_message_error(&error, &message);
    }
}

/// Producer pipeline: queue -> encode -> writer, batching ready messages.
async fn producer_loop(
    mut queue: mpsc::Receiver<Message>,
    mut writer: BoxedWriter,
    cancel: CancellationToken,
) -> Result<()> {
    let mut batch = Vec::with_capacity(MAX_WRITE_BATCH);
    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("producer cancelled");
                return Ok(());
            }
            message = queue.recv() => match message {
                Some(message) => message,
                None => {
                    writer.flush().await?;
                    tracing::debug!("outbound queue drained");
                    return Ok(());
                }
            },
        };

        // Collect whatever else is already queued so one write covers it.
        batch.clear();
        batch.push(first);
        while batch.len() < MAX_WRITE_BATCH {
            match queue.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }

        let mut chunk = BytesMut::new();
        for message in batch.drain(..) {
            let value = message.into_value();
            chunk.extend_from_slice(&EncodeStream::encode(&value)?);
        }
        writer.write_all(&chunk).await?;
        writer.flush().await?;
    }
}

/// Watches both pipelines, runs the drain sequence, and publishes the
/// session outcome.
async fn supervise(
    shared: Arc<Shared>,
    mut consumer: JoinHandle<Result<()>>,
    mut producer: JoinHandle<Result<()>>,
    consumer_cancel: CancellationToken,
    tracker: TaskTracker,
    reservator: Arc<Reservator>,
    done_tx: watch::Sender<Option<Result<()>>>,
) {
    let mut early_producer: Option<Result<()>> = None;
    let consumer_outcome = tokio::select! {
        res = &mut consumer => flatten_join(res),
        res = &mut producer => {
            // The writer failed underneath us; stop accepting inbound too.
            early_producer = Some(flatten_join(res));
            consumer_cancel.cancel();
            flatten_join((&mut consumer).await)
        }
    };

    // Let in-flight dispatches finish enqueuing their responses (on forced
    // shutdown the abort token makes this return promptly).
    tracker.close();
    tracker.wait().await;

    // Dropping the runtime closes the master queue sender; the producer
    // drains whatever is left and exits.
    *lock(&shared.lifecycle) = Lifecycle::Terminated;

    let producer_outcome = match early_producer {
        Some(outcome) => outcome,
        None => flatten_join((&mut producer).await),
    };

    // Fail every response still being awaited.
    reservator.abort_all().await;

    let outcome = consumer_outcome.and(producer_outcome);
    match &outcome {
        Ok(()) => tracing::debug!("session terminated"),
        Err(err) => tracing::error!(error = %err, "session terminated with error"),
    }
    let _ = done_tx.send(Some(outcome));
}

fn flatten_join(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(outcome) => outcome,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(RpcError::Pipeline(err.to_string())),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}
