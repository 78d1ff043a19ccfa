//! Instantiated modules as seen by the bindings.
//!
//! A module is anything that can be instantiated against a set of
//! [`Imports`] and hands back its [`Exports`]. The exports must contain a
//! linear memory named `memory` and an allocator named `cabi_realloc` with
//! signature `(old_ptr, old_size, align, new_size) -> ptr`.

use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

use crate::abi::{FlatValue, LinearMemory, Memory, RawMemory, Trap};
use crate::callable::WasmFunction;
use crate::context::InitError;
use crate::error::Error;
use crate::logging::trace;

/// Functions provided to a module, grouped by import module name
/// (`$root`, `pkg/iface`, `[export]pkg/iface`).
pub type Imports = BTreeMap<String, BTreeMap<String, WasmFunction>>;

/// One export of an instance.
#[derive(Clone)]
pub enum Export {
    Memory(LinearMemory),
    Function(WasmFunction),
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Export::Memory(memory) => f.debug_tuple("Memory").field(&memory.len()).finish(),
            Export::Function(_) => f.write_str("Function"),
        }
    }
}

/// The exports of an instance, keyed by export name.
#[derive(Clone, Debug, Default)]
pub struct Exports {
    entries: BTreeMap<String, Export>,
}

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory(mut self, name: impl Into<String>, memory: LinearMemory) -> Self {
        self.entries.insert(name.into(), Export::Memory(memory));
        self
    }

    pub fn with_function(mut self, name: impl Into<String>, func: WasmFunction) -> Self {
        self.insert_function(name, func);
        self
    }

    pub fn insert_function(&mut self, name: impl Into<String>, func: WasmFunction) {
        self.entries.insert(name.into(), Export::Function(func));
    }

    pub fn get(&self, name: &str) -> Option<&Export> {
        self.entries.get(name)
    }

    pub fn function(&self, name: &str) -> Result<WasmFunction, InitError> {
        match self.entries.get(name) {
            Some(Export::Function(func)) => Ok(func.clone()),
            Some(Export::Memory(_)) => Err(InitError::ExportKind(name.to_string())),
            None => Err(InitError::MissingExport(name.to_string())),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn functions(&self) -> impl Iterator<Item = (&str, &WasmFunction)> {
        self.entries.iter().filter_map(|(name, export)| match export {
            Export::Function(func) => Some((name.as_str(), func)),
            Export::Memory(_) => None,
        })
    }
}

/// A compiled module that can be instantiated.
pub trait Module: Send + Sync {
    fn instantiate(&self, imports: &Imports) -> Result<Exports, Error>;
}

impl<F> Module for F
where
    F: Fn(&Imports) -> Result<Exports, Error> + Send + Sync,
{
    fn instantiate(&self, imports: &Imports) -> Result<Exports, Error> {
        self(imports)
    }
}

/// The memory of an instance, allocating through its `cabi_realloc`.
pub struct ModuleMemory {
    id: String,
    buffer: LinearMemory,
    realloc: WasmFunction,
}

impl ModuleMemory {
    pub fn from_exports(exports: &Exports) -> Result<Self, InitError> {
        let buffer = match exports.get("memory") {
            Some(Export::Memory(memory)) => memory.clone(),
            Some(Export::Function(_)) => return Err(InitError::ExportKind("memory".to_string())),
            None => return Err(InitError::MissingExports),
        };
        let realloc = match exports.get("cabi_realloc") {
            Some(Export::Function(func)) => func.clone(),
            Some(Export::Memory(_)) => return Err(InitError::ExportKind("cabi_realloc".to_string())),
            None => return Err(InitError::MissingExports),
        };
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            buffer,
            realloc,
        })
    }

    /// Wrap into a [`Memory`] ready for a context.
    pub fn into_memory(self) -> Result<Memory, Trap> {
        Memory::new(self)
    }
}

impl RawMemory for ModuleMemory {
    fn id(&self) -> &str {
        &self.id
    }

    fn byte_length(&self) -> usize {
        self.buffer.len()
    }

    fn read(&self, ptr: u32, dst: &mut [u8]) -> Result<(), Trap> {
        self.buffer.read(ptr, dst)
    }

    fn write(&self, ptr: u32, src: &[u8]) -> Result<(), Trap> {
        self.buffer.write(ptr, src)
    }

    fn realloc(&self, old_ptr: u32, old_size: u32, align: u32, new_size: u32) -> Result<u32, Trap> {
        let args = [
            FlatValue::I32(old_ptr),
            FlatValue::I32(old_size),
            FlatValue::I32(align),
            FlatValue::I32(new_size),
        ];
        let ptr = match (self.realloc)(&args) {
            Ok(Some(value)) => value.as_i32()?,
            Ok(None) => return Err(Trap::MissingFlatValue),
            Err(Error::Abi(trap)) => return Err(trap),
            Err(err) => return Err(Trap::convention(format!("cabi_realloc failed: {}", err))),
        };
        trace!(memory = %self.id, ptr, size = new_size, "module allocation");
        Ok(ptr)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::abi::{BumpMemory, MemoryView};

    fn guest_exports() -> Exports {
        let allocator = Arc::new(BumpMemory::new());
        let buffer = allocator.buffer().clone();
        let realloc: WasmFunction = Arc::new(move |args: &[FlatValue]| -> Result<Option<FlatValue>, Error> {
            match args {
                [FlatValue::I32(old_ptr), FlatValue::I32(old_size), FlatValue::I32(align), FlatValue::I32(new_size)] => {
                    let ptr = allocator.realloc(*old_ptr, *old_size, *align, *new_size)?;
                    Ok(Some(FlatValue::I32(ptr)))
                }
                _ => Err(Error::service("bad realloc arguments")),
            }
        });
        Exports::new().with_memory("memory", buffer).with_function("cabi_realloc", realloc)
    }

    #[test]
    fn test_alloc_goes_through_cabi_realloc() {
        let memory = ModuleMemory::from_exports(&guest_exports()).unwrap().into_memory().unwrap();
        let range = memory.alloc(8, 16).unwrap();
        assert_eq!(range.ptr() % 8, 0);
        range.set_u64(8, 7).unwrap();
        assert_eq!(range.as_readonly().get_u64(8).unwrap(), 7);
    }

    #[test]
    fn test_missing_exports() {
        let err = ModuleMemory::from_exports(&Exports::new()).err();
        assert_eq!(err, Some(InitError::MissingExports));

        let wrong = Exports::new()
            .with_memory("memory", LinearMemory::new())
            .with_memory("cabi_realloc", LinearMemory::new());
        assert_eq!(
            ModuleMemory::from_exports(&wrong).err(),
            Some(InitError::ExportKind("cabi_realloc".to_string()))
        );
    }
}
