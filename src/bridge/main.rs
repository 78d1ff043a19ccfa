use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use super::ProtocolError;
use super::memory::ConnectionMemory;
use super::message::{CallOutcome, Message};
use super::semaphore::CallQueue;
use crate::abi::{FlatValue, Memory};
use crate::context::Options;
use crate::error::Error;
use crate::logging::{debug, info, warn};
use crate::platform::Platform;

/// Handler for a worker's call into main.
#[derive(Clone)]
pub enum MainHandler {
    Sync(Arc<dyn Fn(&Memory, &[FlatValue]) -> Result<Option<FlatValue>, Error> + Send + Sync>),
    Async(Arc<dyn Fn(Memory, Vec<FlatValue>) -> BoxFuture<'static, Result<Option<FlatValue>, Error>> + Send + Sync>),
}

impl MainHandler {
    pub fn sync<F>(handler: F) -> Self
    where
        F: Fn(&Memory, &[FlatValue]) -> Result<Option<FlatValue>, Error> + Send + Sync + 'static,
    {
        MainHandler::Sync(Arc::new(handler))
    }

    pub fn asynchronous<F>(handler: F) -> Self
    where
        F: Fn(Memory, Vec<FlatValue>) -> BoxFuture<'static, Result<Option<FlatValue>, Error>> + Send + Sync + 'static,
    {
        MainHandler::Async(Arc::new(handler))
    }

    async fn invoke(&self, memory: &Memory, params: Vec<FlatValue>) -> Result<Option<FlatValue>, Error> {
        match self {
            MainHandler::Sync(handler) => handler(memory, &params),
            MainHandler::Async(handler) => handler(memory.clone(), params).await,
        }
    }
}

struct Pending {
    id: u64,
    reply: oneshot::Sender<Result<Option<FlatValue>, ProtocolError>>,
}

struct Inner {
    memory: ConnectionMemory,
    to_worker: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    from_worker: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    pending: Mutex<Option<Pending>>,
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, MainHandler>>,
    queue: CallQueue,
    platform: Arc<Platform>,
}

/// The calling end of a connection.
///
/// Calls into the worker are asynchronous and serialized through a
/// [`CallQueue`]. [`listen`](MainConnection::listen) must run for replies
/// and for the worker's calls back into main to be processed.
#[derive(Clone)]
pub struct MainConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MainConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainConnection")
            .field("memory", &self.inner.memory)
            .field("handlers", &self.inner.handlers.read().len())
            .finish_non_exhaustive()
    }
}

impl MainConnection {
    pub(super) fn new(
        memory: ConnectionMemory,
        to_worker: mpsc::UnboundedSender<Message>,
        from_worker: mpsc::UnboundedReceiver<Message>,
        platform: Arc<Platform>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                memory,
                to_worker: Mutex::new(Some(to_worker)),
                from_worker: Mutex::new(Some(from_worker)),
                pending: Mutex::new(None),
                next_id: AtomicU64::new(1),
                handlers: RwLock::new(HashMap::new()),
                queue: CallQueue::new(),
                platform,
            }),
        }
    }

    /// Buffer used for calls into the worker.
    pub fn memory(&self) -> &ConnectionMemory {
        &self.inner.memory
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.inner.platform
    }

    /// Register the handler for calls named `name` (`qualifier#witName`).
    pub fn on(&self, name: impl Into<String>, handler: MainHandler) {
        let name = name.into();
        debug!(name = %name, "registering main handler");
        self.inner.handlers.write().insert(name, handler);
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.inner.handlers.read().contains_key(name)
    }

    /// Run `call` after every earlier queued call has finished.
    pub async fn lock<F, T>(&self, call: F) -> Result<T, ProtocolError>
    where
        F: std::future::Future<Output = T>,
    {
        self.inner.queue.lock(call).await
    }

    /// Reset the buffer before a new call marshals into it.
    pub fn prepare_call(&self) {
        self.inner.memory.reset();
    }

    /// Ask the worker to set itself up with `options`.
    pub async fn initialize_worker(&self, options: Options) -> Result<(), ProtocolError> {
        info!(encoding = options.encoding.name(), "initializing worker");
        self.request(|id| Message::InitializeWorker { id, options }).await.map(|_| ())
    }

    /// Call the worker export `name` with flat arguments already marshalled
    /// into [`memory`](Self::memory).
    pub async fn call_worker(&self, name: &str, params: Vec<FlatValue>) -> Result<Option<FlatValue>, ProtocolError> {
        debug!(name = %name, params = params.len(), "calling worker");
        let memory = self.inner.memory.clone();
        let name = name.to_string();
        self.request(move |id| Message::CallWorker { id, name, params, memory }).await
    }

    async fn request(&self, message: impl FnOnce(u64) -> Message) -> Result<Option<FlatValue>, ProtocolError> {
        let (reply, receiver) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.is_some() {
                return Err(ProtocolError::CallInFlight);
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let sender = self.inner.to_worker.lock().clone().ok_or(ProtocolError::ChannelClosed)?;
            sender.send(message(id)).map_err(|_| ProtocolError::ChannelClosed)?;
            *pending = Some(Pending { id, reply });
        }
        receiver.await.unwrap_or(Err(ProtocolError::ChannelClosed))
    }

    fn resolve(&self, id: u64, result: CallOutcome) -> Result<(), ProtocolError> {
        let mut pending = self.inner.pending.lock();
        match pending.take() {
            Some(call) if call.id == id => {
                let _ = call.reply.send(result.map_err(ProtocolError::Remote));
                Ok(())
            }
            other => {
                *pending = other;
                Err(ProtocolError::UnknownCorrelation(id))
            }
        }
    }

    async fn serve_call(&self, name: String, params: Vec<FlatValue>, memory: ConnectionMemory) {
        let handler = self.inner.handlers.read().get(&name).cloned();
        let result = match handler {
            Some(handler) => handler
                .invoke(memory.memory(), params)
                .await
                .map_err(|err| err.to_string()),
            None => Err(ProtocolError::HandlerNotFound(name.clone()).to_string()),
        };
        if let Err(message) = &result {
            warn!(name = %name, error = %message, "call from worker failed");
        }
        memory.complete(result);
    }

    /// Process messages from the worker until it disconnects.
    pub async fn listen(&self) -> Result<(), ProtocolError> {
        let mut receiver = self.inner.from_worker.lock().take().ok_or(ProtocolError::AlreadyListening)?;
        info!("main connection listening");
        while let Some(message) = receiver.recv().await {
            match message {
                Message::CallMain { name, params, memory } => self.serve_call(name, params, memory).await,
                Message::ReportResult { id, result } => {
                    if let Err(err) = self.resolve(id, result) {
                        warn!(error = %err, "dropping worker result");
                    }
                }
                other => {
                    warn!(method = other.method(), "unexpected message from worker");
                }
            }
        }
        info!("worker disconnected");
        Ok(())
    }

    /// Reject queued calls and disconnect from the worker.
    pub fn close(&self) {
        self.inner.queue.dispose();
        self.inner.to_worker.lock().take();
        if let Some(pending) = self.inner.pending.lock().take() {
            let _ = pending.reply.send(Err(ProtocolError::Disposed));
        }
    }
}
