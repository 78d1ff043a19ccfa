//! Cross-thread connection between a calling side and a worker.
//!
//! # Module Organization
//!
//! - [`memory`]: the shared buffer with its header and bump arena
//! - [`message`]: the envelope sent over the channels
//! - [`semaphore`]: the queue serializing calls into the worker
//! - `main` / `worker`: the two connection ends
//!
//! A main→worker call marshals its arguments into the main side's buffer,
//! sends [`Message::CallWorker`] and awaits the correlated
//! [`Message::ReportResult`]. A worker→main call marshals into the worker's
//! buffer, sends [`Message::CallMain`] and blocks on the buffer's sync flag
//! until main has written the result into the header.

mod main;
pub mod memory;
pub mod message;
pub mod semaphore;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::abi::{FlatType, Trap};
use crate::logging::info;
use crate::platform::Platform;

pub use main::{MainConnection, MainHandler};
pub use memory::{ConnectionMemory, DEFAULT_MEMORY_SIZE};
pub use message::{CallOutcome, Message};
pub use semaphore::CallQueue;
pub use worker::{WorkerConnection, WorkerHandler, WorkerInitializer};

/// Failure of the bridge itself, as opposed to the call it carries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Call to '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Unexpected sync flag {0} after waking")]
    UnexpectedSyncFlag(u32),

    #[error("No handler registered for '{0}'")]
    HandlerNotFound(String),

    #[error("A call into the worker is already in flight")]
    CallInFlight,

    #[error("Connection has been disposed")]
    Disposed,

    #[error("Connection channel closed")]
    ChannelClosed,

    #[error("Connection is already listening")]
    AlreadyListening,

    #[error("{0}")]
    Remote(String),

    #[error("No pending call with id {0}")]
    UnknownCorrelation(u64),

    #[error("Result tag {tag} does not match expected flat type {expected:?}")]
    ResultMismatch { tag: u32, expected: Option<FlatType> },
}

/// Create both ends of a connection. Each end owns a buffer of
/// `memory_size` bytes for the calls it originates.
pub fn connect(memory_size: usize, platform: Arc<Platform>) -> Result<(MainConnection, WorkerConnection), Trap> {
    let (to_worker, from_main) = mpsc::unbounded_channel();
    let (to_main, from_worker) = mpsc::unbounded_channel();
    let main_memory = ConnectionMemory::new(memory_size)?;
    let worker_memory = ConnectionMemory::new(memory_size)?;
    info!(main = main_memory.id(), worker = worker_memory.id(), size = memory_size, "connection created");
    Ok((
        MainConnection::new(main_memory, to_worker, from_worker, platform.clone()),
        WorkerConnection::new(worker_memory, to_main, from_main, platform),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::FlatValue;
    use crate::context::Options;
    use crate::error::Error;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_call_worker_round_trip() {
        let (main, worker) = connect(1024, Arc::new(Platform::default())).unwrap();
        worker.on(
            "inc",
            Arc::new(|_: &crate::abi::Memory, params: &[FlatValue]| -> Result<Option<FlatValue>, Error> {
                match params {
                    [FlatValue::I32(n)] => Ok(Some(FlatValue::I32(n + 1))),
                    _ => Err(Error::service("bad params")),
                }
            }),
        );
        let serving = std::thread::spawn(move || worker.serve());
        let listener = tokio::spawn({
            let main = main.clone();
            async move { main.listen().await }
        });

        main.initialize_worker(Options::default()).await.unwrap();
        let result = main.call_worker("inc", vec![FlatValue::I32(41)]).await.unwrap();
        assert_eq!(result, Some(FlatValue::I32(42)));

        let missing = main.call_worker("nope", Vec::new()).await.unwrap_err();
        assert!(matches!(missing, ProtocolError::Remote(msg) if msg.contains("nope")));

        main.close();
        serving.join().unwrap().unwrap();
        listener.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_initialize_is_rejected_remotely() {
        let (main, worker) = connect(256, Arc::new(Platform::default())).unwrap();
        let serving = std::thread::spawn(move || worker.serve());
        let listener = tokio::spawn({
            let main = main.clone();
            async move { main.listen().await }
        });

        main.initialize_worker(Options::default()).await.unwrap();
        let err = main.initialize_worker(Options::default()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Remote(msg) if msg.contains("already initialized")));

        main.close();
        serving.join().unwrap().unwrap();
        listener.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_overlapping_call_is_rejected_and_close_disposes() {
        let (main, _worker) = connect(256, Arc::new(Platform::default())).unwrap();
        let first = main.call_worker("idle", Vec::new());
        tokio::pin!(first);
        assert!(futures::poll!(first.as_mut()).is_pending());

        let second = main.call_worker("idle", Vec::new()).await;
        assert_eq!(second, Err(ProtocolError::CallInFlight));

        main.close();
        assert_eq!(first.await, Err(ProtocolError::Disposed));
    }

    #[test]
    fn test_unexpected_sync_flag_is_fatal() {
        let (to_main, mut from_worker) = mpsc::unbounded_channel();
        let (_to_worker, from_main) = mpsc::unbounded_channel();
        let memory = ConnectionMemory::new(256).unwrap();
        let worker = WorkerConnection::new(memory, to_main, from_main, Arc::new(Platform::default()))
            .with_timeout(Duration::from_secs(5));
        let main_side = std::thread::spawn(move || {
            if let Some(Message::CallMain { memory, .. }) = from_worker.blocking_recv() {
                memory.set_sync(2);
            }
        });

        let err = worker.call_main("pkg/iface#f", Vec::new(), None).unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedSyncFlag(2));
        main_side.join().unwrap();
    }

    #[test]
    fn test_call_main_times_out_without_listener() {
        let (_main, worker) = connect(256, Arc::new(Platform::default())).unwrap();
        let worker = worker.with_timeout(Duration::from_millis(20));
        let err = worker.call_main("pkg/iface#f", Vec::new(), None).unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout { .. }));
    }
}
