//! Type descriptors.
//!
//! [`TypeDesc`] is a closed set of every type that can cross the module
//! boundary. Each family lives in its own module and the enum dispatches to
//! it, so every descriptor offers the same operations:
//!
//! - `load` / `store`: value to and from linear memory
//! - `lift_flat` / `lower_flat`: value to and from flat call arguments
//! - `copy` / `copy_flat`: move an encoded value between two memories
//!   without building a host value

mod flags;
mod list;
mod primitive;
mod record;
mod resource;
pub mod string;
mod variant;

use std::fmt;
use std::sync::Arc;

pub use flags::FlagsType;
pub use list::{ListType, TypedArrayType};
pub use primitive::Primitive;
pub use record::{Field, RecordType, StructLayout, TupleType};
pub use resource::{ResourceHandleType, ResourceType};
pub use variant::{Discriminant, EnumType, OptionType, ResultType, VariantLayout, VariantType};

use crate::abi::value::NumericKind;
use crate::abi::{FlatType, FlatValue, Memory, MemoryRange, MemoryView, ReadonlyMemoryRange, Trap, Value};
use crate::context::WasmContext;

static POINTER_PAIR: [FlatType; 2] = [FlatType::I32, FlatType::I32];
static HANDLE: [FlatType; 1] = [FlatType::I32];

/// Tag of a [`TypeDesc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Bool,
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
    F32,
    F64,
    Char,
    String,
    List,
    TypedArray,
    Record,
    Tuple,
    Flags,
    Variant,
    Enum,
    Option,
    Result,
    Resource,
    ResourceHandle,
    Borrow,
    Own,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeKind::Bool => "bool",
            TypeKind::U8 => "u8",
            TypeKind::U16 => "u16",
            TypeKind::U32 => "u32",
            TypeKind::U64 => "u64",
            TypeKind::S8 => "s8",
            TypeKind::S16 => "s16",
            TypeKind::S32 => "s32",
            TypeKind::S64 => "s64",
            TypeKind::F32 => "f32",
            TypeKind::F64 => "f64",
            TypeKind::Char => "char",
            TypeKind::String => "string",
            TypeKind::List => "list",
            TypeKind::TypedArray => "typed-array",
            TypeKind::Record => "record",
            TypeKind::Tuple => "tuple",
            TypeKind::Flags => "flags",
            TypeKind::Variant => "variant",
            TypeKind::Enum => "enum",
            TypeKind::Option => "option",
            TypeKind::Result => "result",
            TypeKind::Resource => "resource",
            TypeKind::ResourceHandle => "resource-handle",
            TypeKind::Borrow => "borrow",
            TypeKind::Own => "own",
        };
        f.write_str(name)
    }
}

/// A type that can cross the module boundary.
///
/// Cloning is cheap: compound descriptors are shared behind an `Arc`.
#[derive(Debug, Clone)]
pub enum TypeDesc {
    Primitive(Primitive),
    String,
    List(Arc<ListType>),
    TypedArray(TypedArrayType),
    Record(Arc<RecordType>),
    Tuple(Arc<TupleType>),
    Flags(Arc<FlagsType>),
    Variant(Arc<VariantType>),
    Enum(Arc<EnumType>),
    Option(Arc<OptionType>),
    Result(Arc<ResultType>),
    Resource(Arc<ResourceType>),
    ResourceHandle(Arc<ResourceHandleType>),
    Borrow(Arc<ResourceType>),
    Own(Arc<ResourceType>),
}

impl TypeDesc {
    pub const BOOL: TypeDesc = TypeDesc::Primitive(Primitive::Bool);
    pub const U8: TypeDesc = TypeDesc::Primitive(Primitive::U8);
    pub const U16: TypeDesc = TypeDesc::Primitive(Primitive::U16);
    pub const U32: TypeDesc = TypeDesc::Primitive(Primitive::U32);
    pub const U64: TypeDesc = TypeDesc::Primitive(Primitive::U64);
    pub const S8: TypeDesc = TypeDesc::Primitive(Primitive::S8);
    pub const S16: TypeDesc = TypeDesc::Primitive(Primitive::S16);
    pub const S32: TypeDesc = TypeDesc::Primitive(Primitive::S32);
    pub const S64: TypeDesc = TypeDesc::Primitive(Primitive::S64);
    pub const F32: TypeDesc = TypeDesc::Primitive(Primitive::F32);
    pub const F64: TypeDesc = TypeDesc::Primitive(Primitive::F64);
    pub const CHAR: TypeDesc = TypeDesc::Primitive(Primitive::Char);

    pub fn list(element: TypeDesc) -> Self {
        TypeDesc::List(Arc::new(ListType::new(element)))
    }

    pub fn typed_array(kind: NumericKind) -> Self {
        TypeDesc::TypedArray(TypedArrayType::new(kind))
    }

    pub fn record<N: Into<String>>(fields: impl IntoIterator<Item = (N, TypeDesc)>) -> Self {
        let fields = fields.into_iter().map(|(name, ty)| Field::new(name, ty)).collect();
        TypeDesc::Record(Arc::new(RecordType::new(fields)))
    }

    pub fn tuple(types: Vec<TypeDesc>) -> Self {
        TypeDesc::Tuple(Arc::new(TupleType::new(types)))
    }

    pub fn flags<N: Into<String>>(names: impl IntoIterator<Item = N>) -> Self {
        TypeDesc::Flags(Arc::new(FlagsType::new(names.into_iter().map(Into::into).collect())))
    }

    pub fn variant<N: Into<String>>(cases: impl IntoIterator<Item = (N, Option<TypeDesc>)>) -> Result<Self, Trap> {
        let cases = cases.into_iter().map(|(name, ty)| (name.into(), ty)).collect();
        VariantType::new(cases).map(|v| TypeDesc::Variant(Arc::new(v)))
    }

    pub fn enumeration<N: Into<String>>(names: impl IntoIterator<Item = N>) -> Result<Self, Trap> {
        EnumType::new(names.into_iter().map(Into::into).collect()).map(|e| TypeDesc::Enum(Arc::new(e)))
    }

    pub fn option(value_type: TypeDesc) -> Self {
        TypeDesc::Option(Arc::new(OptionType::new(value_type)))
    }

    pub fn result(ok: Option<TypeDesc>, err: Option<TypeDesc>) -> Self {
        TypeDesc::Result(Arc::new(ResultType::new(ok, err, None)))
    }

    /// A result whose error case is raised by services as `error_class`.
    pub fn result_with_error_class(ok: Option<TypeDesc>, err: Option<TypeDesc>, error_class: impl Into<String>) -> Self {
        TypeDesc::Result(Arc::new(ResultType::new(ok, err, Some(error_class.into()))))
    }

    pub fn kind(&self) -> TypeKind {
        match self {
            TypeDesc::Primitive(p) => match p {
                Primitive::Bool => TypeKind::Bool,
                Primitive::U8 => TypeKind::U8,
                Primitive::U16 => TypeKind::U16,
                Primitive::U32 => TypeKind::U32,
                Primitive::U64 => TypeKind::U64,
                Primitive::S8 => TypeKind::S8,
                Primitive::S16 => TypeKind::S16,
                Primitive::S32 => TypeKind::S32,
                Primitive::S64 => TypeKind::S64,
                Primitive::F32 => TypeKind::F32,
                Primitive::F64 => TypeKind::F64,
                Primitive::Char => TypeKind::Char,
            },
            TypeDesc::String => TypeKind::String,
            TypeDesc::List(_) => TypeKind::List,
            TypeDesc::TypedArray(_) => TypeKind::TypedArray,
            TypeDesc::Record(_) => TypeKind::Record,
            TypeDesc::Tuple(_) => TypeKind::Tuple,
            TypeDesc::Flags(_) => TypeKind::Flags,
            TypeDesc::Variant(_) => TypeKind::Variant,
            TypeDesc::Enum(_) => TypeKind::Enum,
            TypeDesc::Option(_) => TypeKind::Option,
            TypeDesc::Result(_) => TypeKind::Result,
            TypeDesc::Resource(_) => TypeKind::Resource,
            TypeDesc::ResourceHandle(_) => TypeKind::ResourceHandle,
            TypeDesc::Borrow(_) => TypeKind::Borrow,
            TypeDesc::Own(_) => TypeKind::Own,
        }
    }

    /// The shared union layout of variants, enums, options and results.
    pub fn variant_layout(&self) -> Option<&VariantLayout> {
        match self {
            TypeDesc::Variant(v) => Some(v.layout()),
            TypeDesc::Enum(e) => Some(e.layout()),
            TypeDesc::Option(o) => Some(o.layout()),
            TypeDesc::Result(r) => Some(r.layout()),
            _ => None,
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            TypeDesc::Primitive(p) => p.size(),
            TypeDesc::String | TypeDesc::List(_) | TypeDesc::TypedArray(_) => string::SIZE,
            TypeDesc::Record(r) => r.layout().size(),
            TypeDesc::Tuple(t) => t.layout().size(),
            TypeDesc::Flags(f) => f.size(),
            TypeDesc::Variant(_) | TypeDesc::Enum(_) | TypeDesc::Option(_) | TypeDesc::Result(_) => {
                self.variant_layout().map_or(0, VariantLayout::size)
            }
            TypeDesc::Resource(_) | TypeDesc::ResourceHandle(_) | TypeDesc::Borrow(_) | TypeDesc::Own(_) => 4,
        }
    }

    pub fn alignment(&self) -> u32 {
        match self {
            TypeDesc::Primitive(p) => p.alignment(),
            TypeDesc::String | TypeDesc::List(_) | TypeDesc::TypedArray(_) => string::ALIGNMENT,
            TypeDesc::Record(r) => r.layout().alignment(),
            TypeDesc::Tuple(t) => t.layout().alignment(),
            TypeDesc::Flags(f) => f.alignment(),
            TypeDesc::Variant(_) | TypeDesc::Enum(_) | TypeDesc::Option(_) | TypeDesc::Result(_) => {
                self.variant_layout().map_or(1, VariantLayout::alignment)
            }
            TypeDesc::Resource(_) | TypeDesc::ResourceHandle(_) | TypeDesc::Borrow(_) | TypeDesc::Own(_) => 4,
        }
    }

    pub fn flat_types(&self) -> &[FlatType] {
        match self {
            TypeDesc::Primitive(p) => match p.flat_type() {
                FlatType::I32 => &[FlatType::I32],
                FlatType::I64 => &[FlatType::I64],
                FlatType::F32 => &[FlatType::F32],
                FlatType::F64 => &[FlatType::F64],
            },
            TypeDesc::String | TypeDesc::List(_) | TypeDesc::TypedArray(_) => &POINTER_PAIR,
            TypeDesc::Record(r) => r.layout().flat_types(),
            TypeDesc::Tuple(t) => t.layout().flat_types(),
            TypeDesc::Flags(f) => f.flat_types(),
            TypeDesc::Variant(_) | TypeDesc::Enum(_) | TypeDesc::Option(_) | TypeDesc::Result(_) => {
                self.variant_layout().map(VariantLayout::flat_types).unwrap_or_default()
            }
            TypeDesc::Resource(_) | TypeDesc::ResourceHandle(_) | TypeDesc::Borrow(_) | TypeDesc::Own(_) => &HANDLE,
        }
    }

    pub fn load(&self, mem: &ReadonlyMemoryRange, offset: u32, cx: &WasmContext) -> Result<Value, Trap> {
        match self {
            TypeDesc::Primitive(p) => p.load(mem, offset),
            TypeDesc::String => string::load(mem, offset, cx),
            TypeDesc::List(l) => l.load(mem, offset, cx),
            TypeDesc::TypedArray(a) => a.load(mem, offset),
            TypeDesc::Record(r) => r.load(mem, offset, cx),
            TypeDesc::Tuple(t) => t.load(mem, offset, cx),
            TypeDesc::Flags(f) => f.load(mem, offset),
            TypeDesc::Variant(v) => v.load(mem, offset, cx),
            TypeDesc::Enum(e) => e.load(mem, offset, cx),
            TypeDesc::Option(o) => o.load(mem, offset, cx),
            TypeDesc::Result(r) => r.load(mem, offset, cx),
            TypeDesc::Resource(r) | TypeDesc::Borrow(r) | TypeDesc::Own(r) => r.load(mem, offset, cx),
            TypeDesc::ResourceHandle(h) => h.load(mem, offset),
        }
    }

    pub fn store(&self, mem: &MemoryRange, offset: u32, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        match self {
            TypeDesc::Primitive(p) => p.store(mem, offset, value),
            TypeDesc::String => string::store(mem, offset, value, cx),
            TypeDesc::List(l) => l.store(mem, offset, value, cx),
            TypeDesc::TypedArray(a) => a.store(mem, offset, value),
            TypeDesc::Record(r) => r.store(mem, offset, value, cx),
            TypeDesc::Tuple(t) => t.store(mem, offset, value, cx),
            TypeDesc::Flags(f) => f.store(mem, offset, value),
            TypeDesc::Variant(v) => v.store(mem, offset, value, cx),
            TypeDesc::Enum(e) => e.store(mem, offset, value, cx),
            TypeDesc::Option(o) => o.store(mem, offset, value, cx),
            TypeDesc::Result(r) => r.store(mem, offset, value, cx),
            TypeDesc::Resource(r) | TypeDesc::Borrow(r) | TypeDesc::Own(r) => r.store(mem, offset, value),
            TypeDesc::ResourceHandle(h) => h.store(mem, offset, value),
        }
    }

    pub fn lift_flat(
        &self,
        memory: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        cx: &WasmContext,
    ) -> Result<Value, Trap> {
        match self {
            TypeDesc::Primitive(p) => p.lift_flat(values),
            TypeDesc::String => string::lift_flat(memory, values, cx),
            TypeDesc::List(l) => l.lift_flat(memory, values, cx),
            TypeDesc::TypedArray(a) => a.lift_flat(memory, values),
            TypeDesc::Record(r) => r.lift_flat(memory, values, cx),
            TypeDesc::Tuple(t) => t.lift_flat(memory, values, cx),
            TypeDesc::Flags(f) => f.lift_flat(values),
            TypeDesc::Variant(v) => v.lift_flat(memory, values, cx),
            TypeDesc::Enum(e) => e.lift_flat(memory, values, cx),
            TypeDesc::Option(o) => o.lift_flat(memory, values, cx),
            TypeDesc::Result(r) => r.lift_flat(memory, values, cx),
            TypeDesc::Resource(r) | TypeDesc::Borrow(r) | TypeDesc::Own(r) => r.lift_flat(values, cx),
            TypeDesc::ResourceHandle(h) => h.lift_flat(values),
        }
    }

    pub fn lower_flat(&self, out: &mut Vec<FlatValue>, memory: &Memory, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        match self {
            TypeDesc::Primitive(p) => p.lower_flat(out, value),
            TypeDesc::String => string::lower_flat(out, memory, value, cx),
            TypeDesc::List(l) => l.lower_flat(out, memory, value, cx),
            TypeDesc::TypedArray(a) => a.lower_flat(out, memory, value),
            TypeDesc::Record(r) => r.lower_flat(out, memory, value, cx),
            TypeDesc::Tuple(t) => t.lower_flat(out, memory, value, cx),
            TypeDesc::Flags(f) => f.lower_flat(out, value),
            TypeDesc::Variant(v) => v.lower_flat(out, memory, value, cx),
            TypeDesc::Enum(e) => e.lower_flat(out, memory, value, cx),
            TypeDesc::Option(o) => o.lower_flat(out, memory, value, cx),
            TypeDesc::Result(r) => r.lower_flat(out, memory, value, cx),
            TypeDesc::Resource(r) | TypeDesc::Borrow(r) | TypeDesc::Own(r) => r.lower_flat(out, value),
            TypeDesc::ResourceHandle(h) => h.lower_flat(out, value),
        }
    }

    pub fn copy(
        &self,
        dest: &MemoryRange,
        dest_offset: u32,
        src: &ReadonlyMemoryRange,
        src_offset: u32,
        cx: &WasmContext,
    ) -> Result<(), Trap> {
        match self {
            TypeDesc::Primitive(p) => p.copy(dest, dest_offset, src, src_offset),
            TypeDesc::String => string::copy(dest, dest_offset, src, src_offset, cx),
            TypeDesc::List(l) => l.copy(dest, dest_offset, src, src_offset, cx),
            TypeDesc::TypedArray(a) => a.copy(dest, dest_offset, src, src_offset),
            TypeDesc::Record(r) => r.copy(dest, dest_offset, src, src_offset, cx),
            TypeDesc::Tuple(t) => t.copy(dest, dest_offset, src, src_offset, cx),
            TypeDesc::Flags(f) => f.copy(dest, dest_offset, src, src_offset),
            TypeDesc::Variant(_) | TypeDesc::Enum(_) | TypeDesc::Option(_) | TypeDesc::Result(_) => match self.variant_layout() {
                Some(layout) => layout.copy(dest, dest_offset, src, src_offset, cx),
                None => Err(Trap::convention("union without layout")),
            },
            TypeDesc::Resource(_) | TypeDesc::ResourceHandle(_) | TypeDesc::Borrow(_) | TypeDesc::Own(_) => {
                Primitive::U32.copy(dest, dest_offset, src, src_offset)
            }
        }
    }

    pub fn copy_flat(
        &self,
        out: &mut Vec<FlatValue>,
        dest: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        src: &Memory,
        cx: &WasmContext,
    ) -> Result<(), Trap> {
        match self {
            TypeDesc::Primitive(p) => p.copy_flat(out, values),
            TypeDesc::String => string::copy_flat(out, dest, values, src, cx),
            TypeDesc::List(l) => l.copy_flat(out, dest, values, src, cx),
            TypeDesc::TypedArray(a) => a.copy_flat(out, dest, values, src),
            TypeDesc::Record(r) => r.copy_flat(out, dest, values, src, cx),
            TypeDesc::Tuple(t) => t.copy_flat(out, dest, values, src, cx),
            TypeDesc::Flags(f) => f.copy_flat(out, values),
            TypeDesc::Variant(_) | TypeDesc::Enum(_) | TypeDesc::Option(_) | TypeDesc::Result(_) => match self.variant_layout() {
                Some(layout) => layout.copy_flat(out, dest, values, src, cx),
                None => Err(Trap::convention("union without layout")),
            },
            TypeDesc::Resource(_) | TypeDesc::ResourceHandle(_) | TypeDesc::Borrow(_) | TypeDesc::Own(_) => {
                Primitive::U32.copy_flat(out, values)
            }
        }
    }

    /// Allocate room for one value of this type.
    pub fn alloc(&self, memory: &Memory) -> Result<MemoryRange, Trap> {
        memory.alloc(self.alignment(), self.size())
    }

    /// Load a value from a readonly view of `memory` at `ptr`.
    pub fn load_at(&self, memory: &Memory, ptr: u32, cx: &WasmContext) -> Result<Value, Trap> {
        let range = memory.readonly(ptr, self.size())?;
        range.assert_alignment(0, self.alignment())?;
        self.load(&range, 0, cx)
    }
}

impl From<Primitive> for TypeDesc {
    fn from(primitive: Primitive) -> Self {
        TypeDesc::Primitive(primitive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::BumpMemory;

    #[test]
    fn test_compound_round_trip_three_levels() {
        let cx = WasmContext::default();
        let memory = Memory::new(BumpMemory::new()).unwrap();
        let ty = TypeDesc::list(TypeDesc::record([
            ("name", TypeDesc::String),
            ("tags", TypeDesc::option(TypeDesc::tuple(vec![TypeDesc::U8, TypeDesc::S64]))),
        ]));
        let value = Value::List(vec![
            Value::record([
                ("name", Value::from("a")),
                ("tags", Value::some(Value::Tuple(vec![Value::U8(1), Value::S64(-2)]))),
            ]),
            Value::record([("name", Value::from("b")), ("tags", Value::none())]),
        ]);

        let range = ty.alloc(&memory).unwrap();
        ty.store(&range, 0, &value, &cx).unwrap();
        assert_eq!(ty.load(&range.as_readonly(), 0, &cx).unwrap(), value);

        let mut flat = Vec::new();
        ty.lower_flat(&mut flat, &memory, &value, &cx).unwrap();
        assert_eq!(flat.len(), ty.flat_types().len());
        assert_eq!(ty.lift_flat(&memory, &mut flat.into_iter(), &cx).unwrap(), value);
    }

    #[test]
    fn test_resource_kinds_are_handles() {
        let resource = Arc::new(ResourceType::new("blob", "test:blob"));
        for ty in [TypeDesc::Borrow(resource.clone()), TypeDesc::Own(resource)] {
            assert_eq!((ty.size(), ty.alignment()), (4, 4));
            assert_eq!(ty.flat_types(), &[FlatType::I32]);
        }
    }

    #[test]
    fn test_result_copy_flat_between_memories() {
        let cx = WasmContext::default();
        let src = Memory::new(BumpMemory::new()).unwrap();
        let dest = Memory::new(BumpMemory::new()).unwrap();
        let ty = TypeDesc::result(Some(TypeDesc::String), Some(TypeDesc::U32));
        let value = Value::ok(Some(Value::from("moved")));

        let mut flat = Vec::new();
        ty.lower_flat(&mut flat, &src, &value, &cx).unwrap();
        let mut copied = Vec::new();
        ty.copy_flat(&mut copied, &dest, &mut flat.into_iter(), &src, &cx).unwrap();
        assert_eq!(ty.lift_flat(&dest, &mut copied.into_iter(), &cx).unwrap(), value);
    }
}
