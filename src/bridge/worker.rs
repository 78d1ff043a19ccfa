use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::ProtocolError;
use super::memory::ConnectionMemory;
use super::message::Message;
use crate::abi::{FlatType, FlatValue, Memory};
use crate::context::{InitError, Options};
use crate::error::Error;
use crate::logging::{debug, info, warn};
use crate::platform::Platform;

/// Handler for main's call into an export. Receives the buffer the
/// arguments were marshalled into.
pub type WorkerHandler = Arc<dyn Fn(&Memory, &[FlatValue]) -> Result<Option<FlatValue>, Error> + Send + Sync>;

/// Runs once when main initializes the worker.
pub type WorkerInitializer = Arc<dyn Fn(Options) -> Result<(), Error> + Send + Sync>;

/// The called end of a connection.
///
/// [`serve`](WorkerConnection::serve) blocks its thread dispatching main's
/// calls. [`call_main`](WorkerConnection::call_main) blocks until main has
/// answered or the timeout passes.
pub struct WorkerConnection {
    memory: ConnectionMemory,
    to_main: mpsc::UnboundedSender<Message>,
    from_main: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    handlers: RwLock<HashMap<String, WorkerHandler>>,
    initializer: RwLock<Option<WorkerInitializer>>,
    options: OnceLock<Options>,
    timeout: Duration,
    platform: Arc<Platform>,
}

impl std::fmt::Debug for WorkerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConnection")
            .field("memory", &self.memory)
            .field("timeout", &self.timeout)
            .field("options", &self.options.get())
            .finish_non_exhaustive()
    }
}

impl WorkerConnection {
    pub(super) fn new(
        memory: ConnectionMemory,
        to_main: mpsc::UnboundedSender<Message>,
        from_main: mpsc::UnboundedReceiver<Message>,
        platform: Arc<Platform>,
    ) -> Self {
        Self {
            memory,
            to_main,
            from_main: Mutex::new(Some(from_main)),
            handlers: RwLock::new(HashMap::new()),
            initializer: RwLock::new(None),
            options: OnceLock::new(),
            timeout: platform.default_timeout(),
            platform,
        }
    }

    /// Replace the timeout for calls into main.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Buffer used for calls into main.
    pub fn memory(&self) -> &ConnectionMemory {
        &self.memory
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    /// Options received from main, once initialized.
    pub fn options(&self) -> Option<&Options> {
        self.options.get()
    }

    /// Register the handler for main's calls named `name`.
    pub fn on(&self, name: impl Into<String>, handler: WorkerHandler) {
        let name = name.into();
        debug!(name = %name, "registering worker handler");
        self.handlers.write().insert(name, handler);
    }

    pub fn on_initialize(&self, initializer: WorkerInitializer) {
        *self.initializer.write() = Some(initializer);
    }

    /// Reset the buffer before a new call marshals into it.
    pub fn prepare_call(&self) {
        self.memory.reset();
    }

    /// Call the main handler `name` and block for its answer. The arguments
    /// must already be marshalled into [`memory`](Self::memory).
    pub fn call_main(&self, name: &str, params: Vec<FlatValue>, result_type: Option<FlatType>) -> Result<Option<FlatValue>, ProtocolError> {
        debug!(name = %name, params = params.len(), "calling main");
        self.memory.set_sync(0);
        self.to_main
            .send(Message::CallMain {
                name: name.to_string(),
                params,
                memory: self.memory.clone(),
            })
            .map_err(|_| ProtocolError::ChannelClosed)?;
        match self.memory.wait_for_sync(self.timeout) {
            Some(1) => self.memory.read_result(result_type),
            Some(flag) => Err(ProtocolError::UnexpectedSyncFlag(flag)),
            None => Err(ProtocolError::Timeout {
                name: name.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    fn initialize(&self, options: Options) -> Result<(), Error> {
        self.options.set(options).map_err(|_| InitError::WorkerInitialized)?;
        let initializer = self.initializer.read().clone();
        match initializer {
            Some(initializer) => initializer(options),
            None => Ok(()),
        }
    }

    fn dispatch(&self, name: &str, params: &[FlatValue], memory: &ConnectionMemory) -> Result<Option<FlatValue>, Error> {
        let handler = self
            .handlers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ProtocolError::HandlerNotFound(name.to_string()))?;
        handler(memory.memory(), params)
    }

    fn reply(&self, id: u64, result: Result<Option<FlatValue>, Error>) -> Result<(), ProtocolError> {
        let result = result.map_err(|err| {
            warn!(id, error = %err, "call from main failed");
            err.to_string()
        });
        self.to_main
            .send(Message::ReportResult { id, result })
            .map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Block the current thread serving main's messages until main
    /// disconnects. Must not run inside an async runtime.
    pub fn serve(&self) -> Result<(), ProtocolError> {
        let mut receiver = self.from_main.lock().take().ok_or(ProtocolError::AlreadyListening)?;
        info!("worker connection serving");
        while let Some(message) = receiver.blocking_recv() {
            match message {
                Message::InitializeWorker { id, options } => {
                    let result = self.initialize(options).map(|()| None);
                    self.reply(id, result)?;
                }
                Message::CallWorker { id, name, params, memory } => {
                    let result = self.dispatch(&name, &params, &memory);
                    self.reply(id, result)?;
                }
                other => {
                    warn!(method = other.method(), "unexpected message from main");
                }
            }
        }
        info!("main disconnected");
        Ok(())
    }
}
