//! Canonical ABI marshalling.
//!
//! # Module Organization
//!
//! - [`error`]: the [`Trap`] raised for malformed data
//! - [`memory`]: memories, ranges and the allocator contract
//! - [`buffer`]: alignment arithmetic and raw byte helpers
//! - [`flat`]: flat register classes, joining and coercion
//! - [`value`]: host values moved across the boundary
//! - [`types`]: the type descriptor family

pub mod buffer;
mod error;
pub mod flat;
pub mod memory;
pub mod types;
pub mod value;

pub use error::Trap;
pub use flat::{FlatType, FlatValue, MAX_FLAT_PARAMS, MAX_FLAT_RESULTS};
pub use memory::{BumpMemory, LinearMemory, Memory, MemoryRange, MemoryView, RawMemory, ReadonlyMemoryRange};
pub use types::{TypeDesc, TypeKind};
pub use value::{NumericKind, TypedArray, Value};
