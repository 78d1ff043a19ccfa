//! Per-instance call context: encoding options, resource managers, and the
//! module memory once it is known.

use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::abi::Memory;
use crate::platform::Platform;
use crate::resource::ResourceManagers;

/// String encoding used for every string crossing the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config", derive(serde::Deserialize))]
pub enum Encoding {
    #[default]
    #[cfg_attr(feature = "config", serde(rename = "utf-8"))]
    Utf8,
    #[cfg_attr(feature = "config", serde(rename = "utf-16"))]
    Utf16,
    /// Accepted in configuration, but every string operation traps.
    #[cfg_attr(feature = "config", serde(rename = "latin1+utf-16"))]
    Latin1Utf16,
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Utf16 => "utf-16",
            Encoding::Latin1Utf16 => "latin1+utf-16",
        }
    }
}

/// Call options shared by every function bound with a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config", derive(serde::Deserialize))]
#[cfg_attr(feature = "config", serde(default))]
pub struct Options {
    pub encoding: Encoding,
}

/// Error raised while wiring a module instance to its context.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InitError {
    #[error("Memory is already initialized")]
    MemoryInitialized,

    #[error("Memory not yet initialized")]
    MemoryNotInitialized,

    #[error("The exports object must contain a memory object and a cabi_realloc function")]
    MissingExports,

    #[error("Export '{0}' not found")]
    MissingExport(String),

    #[error("Export '{0}' has the wrong kind")]
    ExportKind(String),

    #[error("Worker is already initialized")]
    WorkerInitialized,
}

/// Context threaded through every type and call operation.
#[derive(Debug)]
pub struct WasmContext {
    options: Options,
    resources: ResourceManagers,
    memory: OnceLock<Memory>,
    platform: Arc<Platform>,
}

impl Default for WasmContext {
    fn default() -> Self {
        Self::new(Options::default(), Arc::new(Platform::default()))
    }
}

impl WasmContext {
    pub fn new(options: Options, platform: Arc<Platform>) -> Self {
        Self {
            options,
            resources: ResourceManagers::default(),
            memory: OnceLock::new(),
            platform,
        }
    }

    /// A context whose memory is available right away.
    pub fn with_memory(options: Options, platform: Arc<Platform>, memory: Memory) -> Self {
        let cx = Self::new(options, platform);
        let _ = cx.memory.set(memory);
        cx
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn resources(&self) -> &ResourceManagers {
        &self.resources
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    /// Attach the module memory. Can only happen once.
    pub fn initialize(&self, memory: Memory) -> Result<(), InitError> {
        self.memory.set(memory).map_err(|_| InitError::MemoryInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.memory.get().is_some()
    }

    pub fn memory(&self) -> Result<Memory, InitError> {
        self.memory.get().cloned().ok_or(InitError::MemoryNotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::BumpMemory;

    #[test]
    fn test_memory_initialized_once() {
        let cx = WasmContext::default();
        assert_eq!(cx.memory().unwrap_err(), InitError::MemoryNotInitialized);
        let memory = Memory::new(BumpMemory::new()).unwrap();
        cx.initialize(memory.clone()).unwrap();
        assert!(cx.memory().unwrap().same(&memory));
        assert_eq!(cx.initialize(memory).unwrap_err(), InitError::MemoryInitialized);
    }

    #[test]
    fn test_default_options() {
        let cx = WasmContext::default();
        assert_eq!(cx.options().encoding, Encoding::Utf8);
    }
}
