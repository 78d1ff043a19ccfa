//! Lists and typed numeric arrays.
//!
//! Both are a `{ptr, length}` pair pointing at `length` elements laid out
//! back to back.

use super::TypeDesc;
use crate::abi::flat::next_value;
use crate::abi::value::{NumericKind, TypedArray};
use crate::abi::{FlatValue, Memory, MemoryRange, MemoryView, ReadonlyMemoryRange, Trap, Value};
use crate::context::WasmContext;

const DATA: u32 = 0;
const LENGTH: u32 = 4;

fn byte_length(element_size: u32, length: u32) -> Result<u32, Trap> {
    element_size
        .checked_mul(length)
        .ok_or_else(|| Trap::out_of_range("list length", length))
}

fn read_header(mem: &ReadonlyMemoryRange, offset: u32) -> Result<(u32, u32), Trap> {
    Ok((mem.get_u32(offset + DATA)?, mem.get_u32(offset + LENGTH)?))
}

fn write_header(mem: &MemoryRange, offset: u32, ptr: u32, length: u32) -> Result<(), Trap> {
    mem.set_u32(offset + DATA, ptr)?;
    mem.set_u32(offset + LENGTH, length)
}

fn read_flat_header(values: &mut dyn Iterator<Item = FlatValue>) -> Result<(u32, u32), Trap> {
    Ok((next_value(values)?.as_i32()?, next_value(values)?.as_i32()?))
}

/// `list<T>` for an arbitrary element type.
#[derive(Debug, Clone)]
pub struct ListType {
    element: TypeDesc,
}

impl ListType {
    pub fn new(element: TypeDesc) -> Self {
        Self { element }
    }

    pub fn element(&self) -> &TypeDesc {
        &self.element
    }

    fn load_elements(&self, memory: &Memory, ptr: u32, length: u32, cx: &WasmContext) -> Result<Value, Trap> {
        let size = self.element.size();
        let reader = memory.readonly(ptr, byte_length(size, length)?)?;
        (0..length)
            .map(|i| self.element.load(&reader, i * size, cx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List)
    }

    fn store_elements(&self, memory: &Memory, value: &Value, cx: &WasmContext) -> Result<(u32, u32), Trap> {
        let items = match value {
            Value::List(items) => items,
            other => return Err(Trap::mismatch("list", other)),
        };
        let size = self.element.size();
        let length = items.len() as u32;
        let writer = memory.alloc(self.element.alignment(), byte_length(size, length)?)?;
        for (i, item) in items.iter().enumerate() {
            self.element.store(&writer, i as u32 * size, item, cx)?;
        }
        Ok((writer.ptr(), length))
    }

    /// Copy every element into a fresh allocation in `dest`, relocating any
    /// out-of-line data the elements own.
    fn relocate(&self, dest: &Memory, src: &Memory, ptr: u32, length: u32, cx: &WasmContext) -> Result<u32, Trap> {
        let size = self.element.size();
        let byte_len = byte_length(size, length)?;
        let reader = src.readonly(ptr, byte_len)?;
        let writer = dest.alloc(self.element.alignment(), byte_len)?;
        for i in 0..length {
            self.element.copy(&writer, i * size, &reader, i * size, cx)?;
        }
        Ok(writer.ptr())
    }

    pub fn load(&self, mem: &ReadonlyMemoryRange, offset: u32, cx: &WasmContext) -> Result<Value, Trap> {
        let (ptr, length) = read_header(mem, offset)?;
        self.load_elements(mem.memory(), ptr, length, cx)
    }

    pub fn store(&self, mem: &MemoryRange, offset: u32, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        let (ptr, length) = self.store_elements(mem.memory(), value, cx)?;
        write_header(mem, offset, ptr, length)
    }

    pub fn lift_flat(
        &self,
        memory: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        cx: &WasmContext,
    ) -> Result<Value, Trap> {
        let (ptr, length) = read_flat_header(values)?;
        self.load_elements(memory, ptr, length, cx)
    }

    pub fn lower_flat(&self, out: &mut Vec<FlatValue>, memory: &Memory, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        let (ptr, length) = self.store_elements(memory, value, cx)?;
        out.push(FlatValue::I32(ptr));
        out.push(FlatValue::I32(length));
        Ok(())
    }

    pub fn copy(
        &self,
        dest: &MemoryRange,
        dest_offset: u32,
        src: &ReadonlyMemoryRange,
        src_offset: u32,
        cx: &WasmContext,
    ) -> Result<(), Trap> {
        dest.assert_alignment(dest_offset, 4)?;
        src.assert_alignment(src_offset, 4)?;
        let (ptr, length) = read_header(src, src_offset)?;
        let new_ptr = self.relocate(dest.memory(), src.memory(), ptr, length, cx)?;
        write_header(dest, dest_offset, new_ptr, length)
    }

    pub fn copy_flat(
        &self,
        out: &mut Vec<FlatValue>,
        dest: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        src: &Memory,
        cx: &WasmContext,
    ) -> Result<(), Trap> {
        let (ptr, length) = read_flat_header(values)?;
        let new_ptr = self.relocate(dest, src, ptr, length, cx)?;
        out.push(FlatValue::I32(new_ptr));
        out.push(FlatValue::I32(length));
        Ok(())
    }
}

/// A list of numbers moved as one block of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedArrayType {
    kind: NumericKind,
}

impl TypedArrayType {
    pub fn new(kind: NumericKind) -> Self {
        Self { kind }
    }

    pub fn element_kind(&self) -> NumericKind {
        self.kind
    }

    fn load_elements(&self, memory: &Memory, ptr: u32, length: u32) -> Result<Value, Trap> {
        let size = self.kind.size();
        let byte_len = byte_length(size, length)?;
        let reader = memory.readonly(ptr, byte_len)?;
        reader.assert_alignment(0, size)?;
        let bytes = reader.get_bytes(0, byte_len)?;
        Ok(Value::TypedArray(TypedArray::from_le_bytes(self.kind, &bytes)))
    }

    fn store_elements(&self, memory: &Memory, value: &Value) -> Result<(u32, u32), Trap> {
        let array = match value {
            Value::TypedArray(array) if array.kind() == self.kind => array,
            other => return Err(Trap::mismatch(format!("{:?} array", self.kind), other)),
        };
        let bytes = array.to_le_bytes();
        let writer = memory.alloc(self.kind.size(), bytes.len() as u32)?;
        writer.set_bytes(0, &bytes)?;
        Ok((writer.ptr(), array.len() as u32))
    }

    fn relocate(&self, dest: &Memory, src: &Memory, ptr: u32, length: u32) -> Result<u32, Trap> {
        let byte_len = byte_length(self.kind.size(), length)?;
        let reader = src.readonly(ptr, byte_len)?;
        let writer = dest.alloc(self.kind.size(), byte_len)?;
        reader.copy_bytes(0, byte_len, &writer, 0)?;
        Ok(writer.ptr())
    }

    pub fn load(&self, mem: &ReadonlyMemoryRange, offset: u32) -> Result<Value, Trap> {
        let (ptr, length) = read_header(mem, offset)?;
        self.load_elements(mem.memory(), ptr, length)
    }

    pub fn store(&self, mem: &MemoryRange, offset: u32, value: &Value) -> Result<(), Trap> {
        let (ptr, length) = self.store_elements(mem.memory(), value)?;
        write_header(mem, offset, ptr, length)
    }

    pub fn lift_flat(&self, memory: &Memory, values: &mut dyn Iterator<Item = FlatValue>) -> Result<Value, Trap> {
        let (ptr, length) = read_flat_header(values)?;
        self.load_elements(memory, ptr, length)
    }

    pub fn lower_flat(&self, out: &mut Vec<FlatValue>, memory: &Memory, value: &Value) -> Result<(), Trap> {
        let (ptr, length) = self.store_elements(memory, value)?;
        out.push(FlatValue::I32(ptr));
        out.push(FlatValue::I32(length));
        Ok(())
    }

    pub fn copy(
        &self,
        dest: &MemoryRange,
        dest_offset: u32,
        src: &ReadonlyMemoryRange,
        src_offset: u32,
    ) -> Result<(), Trap> {
        dest.assert_alignment(dest_offset, 4)?;
        src.assert_alignment(src_offset, 4)?;
        let (ptr, length) = read_header(src, src_offset)?;
        let new_ptr = self.relocate(dest.memory(), src.memory(), ptr, length)?;
        write_header(dest, dest_offset, new_ptr, length)
    }

    pub fn copy_flat(
        &self,
        out: &mut Vec<FlatValue>,
        dest: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        src: &Memory,
    ) -> Result<(), Trap> {
        let (ptr, length) = read_flat_header(values)?;
        let new_ptr = self.relocate(dest, src, ptr, length)?;
        out.push(FlatValue::I32(new_ptr));
        out.push(FlatValue::I32(length));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::BumpMemory;

    #[test]
    fn test_list_of_strings_copy_is_deep() {
        let cx = WasmContext::default();
        let src = Memory::new(BumpMemory::new()).unwrap();
        let dest = Memory::new(BumpMemory::new()).unwrap();
        let list = ListType::new(TypeDesc::String);
        let value = Value::List(vec![Value::from("a"), Value::from("bc")]);

        let src_range = src.alloc(4, 8).unwrap();
        list.store(&src_range, 0, &value, &cx).unwrap();
        let dest_range = dest.alloc(4, 8).unwrap();
        list.copy(&dest_range, 0, &src_range.as_readonly(), 0, &cx).unwrap();

        assert_eq!(list.load(&dest_range.as_readonly(), 0, &cx).unwrap(), value);
    }

    #[test]
    fn test_typed_array_kind_checked() {
        let memory = Memory::new(BumpMemory::new()).unwrap();
        let ty = TypedArrayType::new(NumericKind::U16);
        let mut out = Vec::new();
        let wrong = Value::TypedArray(TypedArray::U8(vec![1]));
        assert!(ty.lower_flat(&mut out, &memory, &wrong).is_err());

        let right = Value::TypedArray(TypedArray::U16(vec![1, 65535]));
        ty.lower_flat(&mut out, &memory, &right).unwrap();
        assert_eq!(ty.lift_flat(&memory, &mut out.into_iter()).unwrap(), right);
    }
}
