//! Resources and raw resource handles.
//!
//! Both travel as a `u32` handle. A [`ResourceType`] resolves the handle
//! through the resource manager registered under its id, so lifting yields a
//! live [`Value::Resource`]. A [`ResourceHandleType`] leaves the number alone.

use super::primitive::Primitive;
use crate::abi::{FlatValue, Memory, MemoryRange, ReadonlyMemoryRange, Trap, Value};
use crate::context::WasmContext;

fn handle_of(value: &Value) -> Result<u32, Trap> {
    match value {
        Value::Resource(resource) => Ok(resource.handle()),
        Value::Handle(handle) => Ok(*handle),
        other => Err(Trap::mismatch("resource", other)),
    }
}

fn handle_from(value: Value) -> Result<u32, Trap> {
    match value {
        Value::U32(handle) => Ok(handle),
        other => Err(Trap::mismatch("u32 handle", other)),
    }
}

/// `resource T`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceType {
    wit_name: String,
    id: String,
}

impl ResourceType {
    pub fn new(wit_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            wit_name: wit_name.into(),
            id: id.into(),
        }
    }

    pub fn wit_name(&self) -> &str {
        &self.wit_name
    }

    /// Key of the resource manager in [`WasmContext::resources`].
    pub fn id(&self) -> &str {
        &self.id
    }

    fn resolve(&self, handle: u32, cx: &WasmContext) -> Result<Value, Trap> {
        let manager = cx.resources().ensure(&self.id)?;
        manager.get_resource(handle).map(Value::Resource)
    }

    pub fn load(&self, mem: &ReadonlyMemoryRange, offset: u32, cx: &WasmContext) -> Result<Value, Trap> {
        let handle = handle_from(Primitive::U32.load(mem, offset)?)?;
        self.resolve(handle, cx)
    }

    pub fn store(&self, mem: &MemoryRange, offset: u32, value: &Value) -> Result<(), Trap> {
        Primitive::U32.store(mem, offset, &Value::U32(handle_of(value)?))
    }

    pub fn lift_flat(&self, values: &mut dyn Iterator<Item = FlatValue>, cx: &WasmContext) -> Result<Value, Trap> {
        let handle = handle_from(Primitive::U32.lift_flat(values)?)?;
        self.resolve(handle, cx)
    }

    pub fn lower_flat(&self, out: &mut Vec<FlatValue>, value: &Value) -> Result<(), Trap> {
        Primitive::U32.lower_flat(out, &Value::U32(handle_of(value)?))
    }

    pub fn alloc(&self, memory: &Memory) -> Result<MemoryRange, Trap> {
        Primitive::U32.alloc(memory)
    }
}

/// A resource handle that is never resolved to an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandleType {
    wit_name: String,
}

impl ResourceHandleType {
    pub fn new(wit_name: impl Into<String>) -> Self {
        Self {
            wit_name: wit_name.into(),
        }
    }

    pub fn wit_name(&self) -> &str {
        &self.wit_name
    }

    pub fn load(&self, mem: &ReadonlyMemoryRange, offset: u32) -> Result<Value, Trap> {
        handle_from(Primitive::U32.load(mem, offset)?).map(Value::Handle)
    }

    pub fn store(&self, mem: &MemoryRange, offset: u32, value: &Value) -> Result<(), Trap> {
        Primitive::U32.store(mem, offset, &Value::U32(handle_of(value)?))
    }

    pub fn lift_flat(&self, values: &mut dyn Iterator<Item = FlatValue>) -> Result<Value, Trap> {
        handle_from(Primitive::U32.lift_flat(values)?).map(Value::Handle)
    }

    pub fn lower_flat(&self, out: &mut Vec<FlatValue>, value: &Value) -> Result<(), Trap> {
        Primitive::U32.lower_flat(out, &Value::U32(handle_of(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_type_accepts_handles_only() {
        let ty = ResourceHandleType::new("file");
        let mut out = Vec::new();
        ty.lower_flat(&mut out, &Value::Handle(7)).unwrap();
        assert_eq!(out, vec![FlatValue::I32(7)]);
        assert_eq!(ty.lift_flat(&mut out.into_iter()).unwrap(), Value::Handle(7));
        assert!(ty.lower_flat(&mut Vec::new(), &Value::U32(7)).is_err());
    }

    #[test]
    fn test_resource_without_manager_traps() {
        let cx = WasmContext::default();
        let ty = ResourceType::new("file", "io:fs/file");
        let err = ty.lift_flat(&mut vec![FlatValue::I32(1)].into_iter(), &cx).unwrap_err();
        assert_eq!(err, Trap::ManagerNotFound("io:fs/file".to_string()));
    }
}
