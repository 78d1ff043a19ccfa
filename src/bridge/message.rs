use super::memory::ConnectionMemory;
use crate::abi::FlatValue;
use crate::context::Options;

/// Outcome of a call, as reported over the channel.
pub type CallOutcome = Result<Option<FlatValue>, String>;

/// Envelope exchanged between the two ends of a connection.
///
/// Flat values travel as-is, 64-bit integers included. Call messages carry
/// the buffer their pointers refer to.
#[derive(Debug, Clone)]
pub enum Message {
    /// Main asks the worker to instantiate its module.
    InitializeWorker { id: u64, options: Options },

    /// Main calls an export implemented by the worker.
    CallWorker {
        id: u64,
        name: String,
        params: Vec<FlatValue>,
        memory: ConnectionMemory,
    },

    /// The worker calls an import served by main. The answer is written
    /// into `memory`.
    CallMain {
        name: String,
        params: Vec<FlatValue>,
        memory: ConnectionMemory,
    },

    /// The worker answers a `CallWorker` or `InitializeWorker`.
    ReportResult { id: u64, result: CallOutcome },
}

impl Message {
    pub fn method(&self) -> &'static str {
        match self {
            Message::InitializeWorker { .. } => "initializeWorker",
            Message::CallWorker { .. } => "callWorker",
            Message::CallMain { .. } => "callMain",
            Message::ReportResult { .. } => "reportResult",
        }
    }
}
