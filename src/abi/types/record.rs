//! Records and tuples.
//!
//! Fields are laid out in declaration order, each at an offset aligned to
//! its own alignment; the total size is rounded up to the largest field
//! alignment.

use super::TypeDesc;
use crate::abi::buffer::align_to;
use crate::abi::{FlatType, FlatValue, Memory, MemoryRange, MemoryView, ReadonlyMemoryRange, Trap, Value};
use crate::context::WasmContext;

/// Computed layout of a sequence of fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    offsets: Vec<u32>,
    size: u32,
    alignment: u32,
    flat_types: Vec<FlatType>,
}

impl StructLayout {
    pub fn compute<'a>(types: impl IntoIterator<Item = &'a TypeDesc>) -> Self {
        let mut offsets = Vec::new();
        let mut flat_types = Vec::new();
        let mut offset = 0u32;
        let mut alignment = 1u32;
        for ty in types {
            offset = align_to(offset, ty.alignment());
            offsets.push(offset);
            offset = offset.saturating_add(ty.size());
            alignment = alignment.max(ty.alignment());
            flat_types.extend_from_slice(ty.flat_types());
        }
        Self {
            offsets,
            size: align_to(offset, alignment),
            alignment,
            flat_types,
        }
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn flat_types(&self) -> &[FlatType] {
        &self.flat_types
    }

    fn load<'a>(
        &self,
        types: impl Iterator<Item = &'a TypeDesc>,
        mem: &ReadonlyMemoryRange,
        offset: u32,
        cx: &WasmContext,
    ) -> Result<Vec<Value>, Trap> {
        mem.assert_alignment(offset, self.alignment)?;
        types
            .zip(&self.offsets)
            .map(|(ty, field)| ty.load(mem, offset + field, cx))
            .collect()
    }

    fn store<'a>(
        &self,
        fields: impl Iterator<Item = (&'a TypeDesc, &'a Value)>,
        mem: &MemoryRange,
        offset: u32,
        cx: &WasmContext,
    ) -> Result<(), Trap> {
        mem.assert_alignment(offset, self.alignment)?;
        for ((ty, value), field) in fields.zip(&self.offsets) {
            ty.store(mem, offset + field, value, cx)?;
        }
        Ok(())
    }

    fn copy<'a>(
        &self,
        types: impl Iterator<Item = &'a TypeDesc>,
        dest: &MemoryRange,
        dest_offset: u32,
        src: &ReadonlyMemoryRange,
        src_offset: u32,
        cx: &WasmContext,
    ) -> Result<(), Trap> {
        for (ty, field) in types.zip(&self.offsets) {
            ty.copy(dest, dest_offset + field, src, src_offset + field, cx)?;
        }
        Ok(())
    }
}

/// A named record field.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: TypeDesc,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: TypeDesc) -> Self {
        Self { name: name.into(), ty }
    }
}

/// `record { ... }`
#[derive(Debug, Clone)]
pub struct RecordType {
    fields: Vec<Field>,
    layout: StructLayout,
}

impl RecordType {
    pub fn new(fields: Vec<Field>) -> Self {
        let layout = StructLayout::compute(fields.iter().map(|f| &f.ty));
        Self { fields, layout }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn layout(&self) -> &StructLayout {
        &self.layout
    }

    /// Order the values of a record value by field declaration.
    fn field_values<'v>(&self, value: &'v Value) -> Result<Vec<&'v Value>, Trap> {
        let entries = match value {
            Value::Record(entries) => entries,
            other => return Err(Trap::mismatch("record", other)),
        };
        self.fields
            .iter()
            .map(|field| {
                entries
                    .iter()
                    .find(|(name, _)| name == &field.name)
                    .map(|(_, v)| v)
                    .ok_or_else(|| Trap::TypeMismatch {
                        expected: format!("field '{}'", field.name),
                        got: "missing".to_string(),
                    })
            })
            .collect()
    }

    fn named(&self, values: Vec<Value>) -> Value {
        Value::Record(
            self.fields
                .iter()
                .map(|f| f.name.clone())
                .zip(values)
                .collect(),
        )
    }

    pub fn load(&self, mem: &ReadonlyMemoryRange, offset: u32, cx: &WasmContext) -> Result<Value, Trap> {
        let values = self.layout.load(self.fields.iter().map(|f| &f.ty), mem, offset, cx)?;
        Ok(self.named(values))
    }

    pub fn store(&self, mem: &MemoryRange, offset: u32, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        let values = self.field_values(value)?;
        self.layout
            .store(self.fields.iter().map(|f| &f.ty).zip(values), mem, offset, cx)
    }

    pub fn lift_flat(
        &self,
        memory: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        cx: &WasmContext,
    ) -> Result<Value, Trap> {
        let lifted = self
            .fields
            .iter()
            .map(|f| f.ty.lift_flat(memory, values, cx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.named(lifted))
    }

    pub fn lower_flat(&self, out: &mut Vec<FlatValue>, memory: &Memory, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        for (field, v) in self.fields.iter().zip(self.field_values(value)?) {
            field.ty.lower_flat(out, memory, v, cx)?;
        }
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
        self.layout
            .copy(self.fields.iter().map(|f| &f.ty), dest, dest_offset, src, src_offset, cx)
    }

    pub fn copy_flat(
        &self,
        out: &mut Vec<FlatValue>,
        dest: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        src: &Memory,
        cx: &WasmContext,
    ) -> Result<(), Trap> {
        for field in &self.fields {
            field.ty.copy_flat(out, dest, values, src, cx)?;
        }
        Ok(())
    }
}

/// `tuple<...>`
#[derive(Debug, Clone)]
pub struct TupleType {
    types: Vec<TypeDesc>,
    layout: StructLayout,
}

impl TupleType {
    pub fn new(types: Vec<TypeDesc>) -> Self {
        let layout = StructLayout::compute(&types);
        Self { types, layout }
    }

    pub fn types(&self) -> &[TypeDesc] {
        &self.types
    }

    pub fn layout(&self) -> &StructLayout {
        &self.layout
    }

    fn elements<'v>(&self, value: &'v Value) -> Result<&'v [Value], Trap> {
        match value {
            Value::Tuple(items) if items.len() == self.types.len() => Ok(items),
            other => Err(Trap::mismatch(format!("tuple of {}", self.types.len()), other)),
        }
    }

    pub fn load(&self, mem: &ReadonlyMemoryRange, offset: u32, cx: &WasmContext) -> Result<Value, Trap> {
        self.layout.load(self.types.iter(), mem, offset, cx).map(Value::Tuple)
    }

    pub fn store(&self, mem: &MemoryRange, offset: u32, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        let items = self.elements(value)?;
        self.layout.store(self.types.iter().zip(items), mem, offset, cx)
    }

    pub fn lift_flat(
        &self,
        memory: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        cx: &WasmContext,
    ) -> Result<Value, Trap> {
        self.types
            .iter()
            .map(|ty| ty.lift_flat(memory, values, cx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Tuple)
    }

    pub fn lower_flat(&self, out: &mut Vec<FlatValue>, memory: &Memory, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        for (ty, v) in self.types.iter().zip(self.elements(value)?) {
            ty.lower_flat(out, memory, v, cx)?;
        }
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
        self.layout
            .copy(self.types.iter(), dest, dest_offset, src, src_offset, cx)
    }

    pub fn copy_flat(
        &self,
        out: &mut Vec<FlatValue>,
        dest: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        src: &Memory,
        cx: &WasmContext,
    ) -> Result<(), Trap> {
        for ty in &self.types {
            ty.copy_flat(out, dest, values, src, cx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let record = RecordType::new(vec![
            Field::new("a", TypeDesc::U8),
            Field::new("b", TypeDesc::U32),
            Field::new("c", TypeDesc::U16),
        ]);
        assert_eq!(record.layout().offsets(), &[0, 4, 8]);
        assert_eq!(record.layout().size(), 12);
        assert_eq!(record.layout().alignment(), 4);
        assert_eq!(record.layout().flat_types(), &[FlatType::I32, FlatType::I32, FlatType::I32]);
    }

    #[test]
    fn test_empty_tuple() {
        let tuple = TupleType::new(Vec::new());
        assert_eq!(tuple.layout().size(), 0);
        assert_eq!(tuple.layout().alignment(), 1);
    }
}
