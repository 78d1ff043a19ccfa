//! Error types for canonical ABI operations.

use thiserror::Error;

use super::flat::FlatType;

/// A canonical ABI trap.
///
/// Traps are raised for malformed or out-of-range data crossing the module
/// boundary. They are always fatal to the current call and are never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Trap {
    #[error("Memory access out of bounds: offset {offset} with length {len} exceeds range size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u32 },

    #[error("Pointer {ptr} with length {len} exceeds memory size {memory_size}")]
    InvalidMemoryPointer {
        ptr: u32,
        len: u32,
        memory_size: usize,
    },

    #[error("Misaligned access: offset {offset} is not aligned to {alignment} (range alignment {range_alignment})")]
    Misaligned {
        offset: u32,
        alignment: u32,
        range_alignment: u32,
    },

    #[error("Allocation of {size} bytes returned pointer {ptr} not aligned to {alignment}")]
    MisalignedAllocation { ptr: u32, size: u32, alignment: u32 },

    #[error("Out of memory: cannot allocate {size} bytes with alignment {alignment}")]
    OutOfMemory { size: u32, alignment: u32 },

    #[error("Value {value} is out of range for {kind}")]
    OutOfRange { kind: &'static str, value: String },

    #[error("Invalid bool value: {0}")]
    InvalidBool(u32),

    #[error("Invalid char value: {0}")]
    InvalidChar(u32),

    #[error("Invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("Invalid UTF-16 in string")]
    InvalidUtf16,

    #[error("Unsupported string encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Invalid discriminant {discriminant} for variant with {num_cases} cases")]
    InvalidDiscriminant { discriminant: u32, num_cases: usize },

    #[error("Unknown case '{case}' for {kind}")]
    UnknownCase { kind: &'static str, case: String },

    #[error("Variant must have at least one case")]
    NoCases,

    #[error("Too many cases: {0}")]
    TooManyCases(usize),

    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Flat type mismatch: expected {expected}, got {got}")]
    FlatTypeMismatch { expected: FlatType, got: FlatType },

    #[error("Missing flat value")]
    MissingFlatValue,

    #[error("Flat value {value:#x} does not fit into {target}")]
    FlatValueTooLarge { value: u64, target: FlatType },

    #[error("Memory not available: {0}")]
    NullMemory(&'static str),

    #[error("{0} does not support realloc")]
    ReallocUnsupported(&'static str),

    #[error("Unknown resource handle {0}")]
    UnknownHandle(u32),

    #[error("No representation registered for resource handle {0}")]
    NoRepresentation(u32),

    #[error("Resource for handle {0} has been collected")]
    ResourceCollected(u32),

    #[error("Handle {handle} is out of bounds. Current handle counter is {counter}")]
    HandleOutOfBounds { handle: u32, counter: u32 },

    #[error("Handle {0} is already registered")]
    HandleRegistered(u32),

    #[error("Handle {0} is already in use as a proxy handle")]
    HandleInUse(u32),

    #[error("Proxy resource {0} cannot be removed manually; release it instead")]
    ProxyRemoval(u32),

    #[error("No proxy constructor set")]
    NoProxyConstructor,

    #[error("No proxy destructor set")]
    NoProxyDestructor,

    #[error("Unknown loop handle for representation {0}")]
    UnknownLoop(u32),

    #[error("Resource handle counter exhausted")]
    HandlesExhausted,

    #[error("Resource manager {0} already registered")]
    ManagerRegistered(String),

    #[error("Resource manager {0} not found")]
    ManagerNotFound(String),

    #[error("Method '{method}' not found on resource '{resource}'")]
    MethodNotFound { method: String, resource: String },

    #[error("Calling convention mismatch: {0}")]
    Convention(String),

    #[error("Received an error result, but no error class is defined")]
    MissingErrorClass,

    #[error("Big-endian platforms are not supported")]
    BigEndian,
}

impl Trap {
    pub(crate) fn out_of_range(kind: &'static str, value: impl ToString) -> Self {
        Trap::OutOfRange {
            kind,
            value: value.to_string(),
        }
    }

    pub(crate) fn mismatch(expected: impl Into<String>, got: impl std::fmt::Debug) -> Self {
        Trap::TypeMismatch {
            expected: expected.into(),
            got: format!("{:?}", got),
        }
    }

    pub(crate) fn convention(msg: impl Into<String>) -> Self {
        Trap::Convention(msg.into())
    }
}
