//! Convenient re-exports for common usage patterns.
//!
//! This module provides a single import to bring all commonly used types
//! into scope.
//!
//! # Example
//!
//! ```ignore
//! use wit_bridge::prelude::*;
//!
//! let mut iface = InterfaceDesc::new("demo:files", "files");
//! iface.add_resource("file").add_method("size", Vec::new(), Some(TypeDesc::U64));
//! let world = WorldDesc::new("demo").import_interface(iface);
//! ```

// Unified error handling
pub use crate::error::{Error, Result, ResultError};

// ABI types
pub use crate::abi::{BumpMemory, FlatType, FlatValue, LinearMemory, Memory, MemoryRange, MemoryView, Trap, TypeDesc, Value};

// Calls, resources and bindings
pub use crate::bind::{BoundWorld, InterfaceDesc, InterfaceService, ResourceService, Service, ServiceFunction, WorldDesc};
pub use crate::callable::Callable;
pub use crate::context::{Encoding, Options, WasmContext};
pub use crate::module::{Exports, Imports, Module};
pub use crate::platform::Platform;
pub use crate::resource::{Resource, ResourceManager, ResourceRef};

#[cfg(feature = "bridge")]
pub use crate::bridge::{MainConnection, WorkerConnection, connect};
