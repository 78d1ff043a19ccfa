//! Component Model canonical ABI runtime.
//!
//! This library moves structured values across a module boundary using the
//! WebAssembly Component Model's canonical ABI: values are stored in linear
//! memory or flattened into call arguments, resources are passed as handles,
//! and calls can be relayed between a main thread and a worker that blocks
//! while main answers.
//!
//! # Quick Start
//!
//! ```ignore
//! use wit_bridge::prelude::*;
//!
//! let point = TypeDesc::record([("x", TypeDesc::U32), ("y", TypeDesc::U32)]);
//! let cx = WasmContext::with_memory(Options::default(), Default::default(), Memory::new(BumpMemory::new())?);
//! let range = point.alloc(&cx.memory()?)?;
//! point.store(&range, 0, &Value::Record(vec![("x".into(), Value::U32(1)), ("y".into(), Value::U32(2))]), &cx)?;
//! ```
//!
//! # Modules
//!
//! - [`abi`] - Memories, flat values and type descriptors (always available)
//! - [`callable`] - Lowering and lifting whole calls
//! - [`resource`] - Handle tables and host objects
//! - [`bind`] - Wiring worlds to modules and host services
//! - [`bridge`] - Main/worker connection (requires `bridge` feature)
//! - [`wit`] - Type descriptors from WIT (requires `wit` feature)
//! - [`config`] - TOML runtime configuration (requires `config` feature)
//!
//! # Feature Flags
//!
//! - `bridge` - Enable the main/worker connection (enabled by default)
//! - `wit` - Enable WIT type input (enabled by default)
//! - `config` - Enable TOML configuration (enabled by default)
//! - `logging` - Enable library-level tracing (consumers provide their own subscriber)
//! - `cli` - Enable the command-line interface binary
//! - `full` - Enable all features

pub mod abi;
pub mod bind;
#[cfg(feature = "bridge")]
pub mod bridge;
pub mod callable;
#[cfg(feature = "config")]
pub mod config;
pub mod context;
mod logging;
pub mod module;
pub mod platform;
pub mod prelude;
pub mod resource;
#[cfg(feature = "wit")]
pub mod wit;

mod error;

// Re-export the unified error type
pub use error::{Error, Result, ResultError};

pub use abi::{FlatType, FlatValue, Memory, Trap, TypeDesc, Value};
pub use callable::Callable;
pub use context::{Encoding, InitError, Options, WasmContext};
pub use platform::Platform;
pub use resource::{Resource, ResourceManager, ResourceRef};
