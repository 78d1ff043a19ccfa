//! Discriminated unions: variants, enums, options and results.
//!
//! All four share [`VariantLayout`]. The payload of every case starts at the
//! same offset, aligned to the largest case alignment, so the layout does not
//! depend on which case is active. In flat form the discriminant is followed
//! by the slot-wise join of every case's flat types.

use std::collections::HashMap;

use super::TypeDesc;
use crate::abi::buffer::align_to;
use crate::abi::flat::{join_flat_types, narrow_values, next_value, widen_values};
use crate::abi::{FlatType, FlatValue, Memory, MemoryRange, MemoryView, ReadonlyMemoryRange, Trap, Value};
use crate::context::WasmContext;

/// Width of a variant discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discriminant {
    U8,
    U16,
    U32,
}

impl Discriminant {
    pub fn for_cases(count: usize) -> Result<Self, Trap> {
        match count {
            0 => Err(Trap::NoCases),
            1..=0x100 => Ok(Discriminant::U8),
            0x101..=0x1_0000 => Ok(Discriminant::U16),
            n if u32::try_from(n).is_ok() => Ok(Discriminant::U32),
            n => Err(Trap::TooManyCases(n)),
        }
    }

    pub fn size(self) -> u32 {
        match self {
            Discriminant::U8 => 1,
            Discriminant::U16 => 2,
            Discriminant::U32 => 4,
        }
    }

    fn load(self, mem: &ReadonlyMemoryRange, offset: u32) -> Result<u32, Trap> {
        match self {
            Discriminant::U8 => mem.get_u8(offset).map(u32::from),
            Discriminant::U16 => mem.get_u16(offset).map(u32::from),
            Discriminant::U32 => mem.get_u32(offset),
        }
    }

    fn store(self, mem: &MemoryRange, offset: u32, index: u32) -> Result<(), Trap> {
        match self {
            Discriminant::U8 => mem.set_u8(offset, index as u8),
            Discriminant::U16 => mem.set_u16(offset, index as u16),
            Discriminant::U32 => mem.set_u32(offset, index),
        }
    }
}

#[derive(Debug, Clone)]
struct Case {
    name: String,
    ty: Option<TypeDesc>,
}

/// Shared layout and codec of every discriminated union.
#[derive(Debug, Clone)]
pub struct VariantLayout {
    cases: Vec<Case>,
    index: HashMap<String, usize>,
    discriminant: Discriminant,
    payload_offset: u32,
    size: u32,
    alignment: u32,
    flat_types: Vec<FlatType>,
}

impl VariantLayout {
    pub fn new(cases: Vec<(String, Option<TypeDesc>)>) -> Result<Self, Trap> {
        let discriminant = Discriminant::for_cases(cases.len())?;
        Ok(Self::with_discriminant(cases, discriminant))
    }

    fn with_discriminant(cases: Vec<(String, Option<TypeDesc>)>, discriminant: Discriminant) -> Self {
        let payloads = || cases.iter().filter_map(|(_, ty)| ty.as_ref());
        let max_case_alignment = payloads().map(TypeDesc::alignment).max().unwrap_or(1);
        let max_case_size = payloads().map(TypeDesc::size).max().unwrap_or(0);
        let payload_offset = align_to(discriminant.size(), max_case_alignment);
        let alignment = discriminant.size().max(max_case_alignment);
        let size = align_to(payload_offset.saturating_add(max_case_size), alignment);

        let joined = payloads().fold(Vec::new(), |acc, ty| join_flat_types(&acc, ty.flat_types()));
        let mut flat_types = Vec::with_capacity(joined.len() + 1);
        flat_types.push(FlatType::I32);
        flat_types.extend(joined);

        let index = cases
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), i))
            .collect();
        let cases = cases
            .into_iter()
            .map(|(name, ty)| Case { name, ty })
            .collect();
        Self {
            cases,
            index,
            discriminant,
            payload_offset,
            size,
            alignment,
            flat_types,
        }
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

    pub fn discriminant(&self) -> Discriminant {
        self.discriminant
    }

    /// Offset of every case payload from the start of the value.
    pub fn payload_offset(&self) -> u32 {
        self.payload_offset
    }

    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    pub fn case_names(&self) -> impl Iterator<Item = &str> {
        self.cases.iter().map(|c| c.name.as_str())
    }

    pub fn case_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn case_name(&self, index: usize) -> Option<&str> {
        self.cases.get(index).map(|c| c.name.as_str())
    }

    pub fn case_type(&self, index: usize) -> Option<&TypeDesc> {
        self.cases.get(index).and_then(|c| c.ty.as_ref())
    }

    fn case(&self, discriminant: u32) -> Result<&Case, Trap> {
        self.cases
            .get(discriminant as usize)
            .ok_or(Trap::InvalidDiscriminant {
                discriminant,
                num_cases: self.cases.len(),
            })
    }

    fn joined_slots(&self) -> &[FlatType] {
        self.flat_types.get(1..).unwrap_or(&[])
    }

    pub fn load_case(
        &self,
        mem: &ReadonlyMemoryRange,
        offset: u32,
        cx: &WasmContext,
    ) -> Result<(usize, Option<Value>), Trap> {
        let discriminant = self.discriminant.load(mem, offset)?;
        let case = self.case(discriminant)?;
        let payload = match &case.ty {
            Some(ty) => Some(ty.load(mem, offset + self.payload_offset, cx)?),
            None => None,
        };
        Ok((discriminant as usize, payload))
    }

    pub fn store_case(
        &self,
        mem: &MemoryRange,
        offset: u32,
        index: usize,
        payload: Option<&Value>,
        cx: &WasmContext,
    ) -> Result<(), Trap> {
        let case = self.cases.get(index).ok_or(Trap::InvalidDiscriminant {
            discriminant: index as u32,
            num_cases: self.cases.len(),
        })?;
        self.discriminant.store(mem, offset, index as u32)?;
        match (&case.ty, payload) {
            (Some(ty), Some(value)) => ty.store(mem, offset + self.payload_offset, value, cx),
            (None, None) => Ok(()),
            (Some(_), None) => Err(Trap::mismatch(format!("payload for case '{}'", case.name), "none")),
            (None, Some(value)) => Err(Trap::mismatch(format!("no payload for case '{}'", case.name), value)),
        }
    }

    pub fn lift_case(
        &self,
        memory: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        cx: &WasmContext,
    ) -> Result<(usize, Option<Value>), Trap> {
        let discriminant = next_value(values)?.as_i32()?;
        let slots = self
            .joined_slots()
            .iter()
            .map(|_| next_value(values))
            .collect::<Result<Vec<_>, _>>()?;
        let case = self.case(discriminant)?;
        let payload = match &case.ty {
            Some(ty) => {
                let narrowed = narrow_values(&slots, ty.flat_types())?;
                Some(ty.lift_flat(memory, &mut narrowed.into_iter(), cx)?)
            }
            None => None,
        };
        Ok((discriminant as usize, payload))
    }

    pub fn lower_case(
        &self,
        out: &mut Vec<FlatValue>,
        memory: &Memory,
        index: usize,
        payload: Option<&Value>,
        cx: &WasmContext,
    ) -> Result<(), Trap> {
        let case = self.cases.get(index).ok_or(Trap::InvalidDiscriminant {
            discriminant: index as u32,
            num_cases: self.cases.len(),
        })?;
        let mut lowered = Vec::new();
        match (&case.ty, payload) {
            (Some(ty), Some(value)) => {
                ty.lower_flat(&mut lowered, memory, value, cx)?;
                if lowered.len() != ty.flat_types().len() {
                    return Err(Trap::convention("mismatched flat types"));
                }
            }
            (None, None) => {}
            (Some(_), None) => {
                return Err(Trap::mismatch(format!("payload for case '{}'", case.name), "none"));
            }
            (None, Some(value)) => {
                return Err(Trap::mismatch(format!("no payload for case '{}'", case.name), value));
            }
        }
        out.push(FlatValue::I32(index as u32));
        out.extend(widen_values(&lowered, self.joined_slots())?);
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
        let discriminant = self.discriminant.load(src, src_offset)?;
        let case = self.case(discriminant)?;
        self.discriminant.store(dest, dest_offset, discriminant)?;
        match &case.ty {
            Some(ty) => ty.copy(
                dest,
                dest_offset + self.payload_offset,
                src,
                src_offset + self.payload_offset,
                cx,
            ),
            None => Ok(()),
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
        let discriminant = next_value(values)?.as_i32()?;
        let slots = self
            .joined_slots()
            .iter()
            .map(|_| next_value(values))
            .collect::<Result<Vec<_>, _>>()?;
        let case = self.case(discriminant)?;
        out.push(FlatValue::I32(discriminant));
        match &case.ty {
            Some(ty) => {
                let narrowed = narrow_values(&slots, ty.flat_types())?;
                let mut copied = Vec::new();
                ty.copy_flat(&mut copied, dest, &mut narrowed.into_iter(), src, cx)?;
                out.extend(widen_values(&copied, self.joined_slots())?);
            }
            None => out.extend(slots),
        }
        Ok(())
    }
}

/// `variant { ... }`
#[derive(Debug, Clone)]
pub struct VariantType {
    layout: VariantLayout,
}

impl VariantType {
    pub fn new(cases: Vec<(String, Option<TypeDesc>)>) -> Result<Self, Trap> {
        VariantLayout::new(cases).map(|layout| Self { layout })
    }

    pub fn layout(&self) -> &VariantLayout {
        &self.layout
    }

    fn split<'v>(&self, value: &'v Value) -> Result<(usize, Option<&'v Value>), Trap> {
        match value {
            Value::Variant { case, payload } => {
                let index = self.layout.case_index(case).ok_or_else(|| Trap::UnknownCase {
                    kind: "variant",
                    case: case.clone(),
                })?;
                Ok((index, payload.as_deref()))
            }
            other => Err(Trap::mismatch("variant", other)),
        }
    }

    fn build(&self, (index, payload): (usize, Option<Value>)) -> Value {
        Value::Variant {
            case: self.layout.case_name(index).unwrap_or_default().to_string(),
            payload: payload.map(Box::new),
        }
    }

    pub fn load(&self, mem: &ReadonlyMemoryRange, offset: u32, cx: &WasmContext) -> Result<Value, Trap> {
        self.layout.load_case(mem, offset, cx).map(|c| self.build(c))
    }

    pub fn store(&self, mem: &MemoryRange, offset: u32, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        let (index, payload) = self.split(value)?;
        self.layout.store_case(mem, offset, index, payload, cx)
    }

    pub fn lift_flat(
        &self,
        memory: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        cx: &WasmContext,
    ) -> Result<Value, Trap> {
        self.layout.lift_case(memory, values, cx).map(|c| self.build(c))
    }

    pub fn lower_flat(&self, out: &mut Vec<FlatValue>, memory: &Memory, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        let (index, payload) = self.split(value)?;
        self.layout.lower_case(out, memory, index, payload, cx)
    }
}

/// `enum { ... }`: a variant whose cases carry no payload.
#[derive(Debug, Clone)]
pub struct EnumType {
    layout: VariantLayout,
}

impl EnumType {
    pub fn new(names: Vec<String>) -> Result<Self, Trap> {
        VariantLayout::new(names.into_iter().map(|n| (n, None)).collect()).map(|layout| Self { layout })
    }

    pub fn layout(&self) -> &VariantLayout {
        &self.layout
    }

    fn index(&self, value: &Value) -> Result<usize, Trap> {
        match value {
            Value::Enum(name) => self.layout.case_index(name).ok_or_else(|| Trap::UnknownCase {
                kind: "enum",
                case: name.clone(),
            }),
            other => Err(Trap::mismatch("enum", other)),
        }
    }

    fn build(&self, (index, _): (usize, Option<Value>)) -> Value {
        Value::Enum(self.layout.case_name(index).unwrap_or_default().to_string())
    }

    pub fn load(&self, mem: &ReadonlyMemoryRange, offset: u32, cx: &WasmContext) -> Result<Value, Trap> {
        self.layout.load_case(mem, offset, cx).map(|c| self.build(c))
    }

    pub fn store(&self, mem: &MemoryRange, offset: u32, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        self.layout.store_case(mem, offset, self.index(value)?, None, cx)
    }

    pub fn lift_flat(
        &self,
        memory: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        cx: &WasmContext,
    ) -> Result<Value, Trap> {
        self.layout.lift_case(memory, values, cx).map(|c| self.build(c))
    }

    pub fn lower_flat(&self, out: &mut Vec<FlatValue>, memory: &Memory, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        self.layout.lower_case(out, memory, self.index(value)?, None, cx)
    }
}

/// `option<T>`: case 0 is `none`, case 1 is `some`.
#[derive(Debug, Clone)]
pub struct OptionType {
    value_type: TypeDesc,
    layout: VariantLayout,
}

impl OptionType {
    pub fn new(value_type: TypeDesc) -> Self {
        let cases = vec![("none".to_string(), None), ("some".to_string(), Some(value_type.clone()))];
        let layout = VariantLayout::with_discriminant(cases, Discriminant::U8);
        Self { value_type, layout }
    }

    pub fn value_type(&self) -> &TypeDesc {
        &self.value_type
    }

    pub fn layout(&self) -> &VariantLayout {
        &self.layout
    }

    fn split<'v>(&self, value: &'v Value) -> Result<(usize, Option<&'v Value>), Trap> {
        match value {
            Value::Option(None) => Ok((0, None)),
            Value::Option(Some(inner)) => Ok((1, Some(inner.as_ref()))),
            other => Err(Trap::mismatch("option", other)),
        }
    }

    fn build((index, payload): (usize, Option<Value>)) -> Value {
        match (index, payload) {
            (1, Some(value)) => Value::some(value),
            _ => Value::none(),
        }
    }

    pub fn load(&self, mem: &ReadonlyMemoryRange, offset: u32, cx: &WasmContext) -> Result<Value, Trap> {
        self.layout.load_case(mem, offset, cx).map(Self::build)
    }

    pub fn store(&self, mem: &MemoryRange, offset: u32, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        let (index, payload) = self.split(value)?;
        self.layout.store_case(mem, offset, index, payload, cx)
    }

    pub fn lift_flat(
        &self,
        memory: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        cx: &WasmContext,
    ) -> Result<Value, Trap> {
        self.layout.lift_case(memory, values, cx).map(Self::build)
    }

    pub fn lower_flat(&self, out: &mut Vec<FlatValue>, memory: &Memory, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        let (index, payload) = self.split(value)?;
        self.layout.lower_case(out, memory, index, payload, cx)
    }
}

/// `result<T, E>`: case 0 is `ok`, case 1 is `error`.
///
/// `error_class` names the host error class that is turned into the error
/// case when a service raises it.
#[derive(Debug, Clone)]
pub struct ResultType {
    ok: Option<TypeDesc>,
    err: Option<TypeDesc>,
    error_class: Option<String>,
    layout: VariantLayout,
}

impl ResultType {
    pub fn new(ok: Option<TypeDesc>, err: Option<TypeDesc>, error_class: Option<String>) -> Self {
        let cases = vec![("ok".to_string(), ok.clone()), ("error".to_string(), err.clone())];
        let layout = VariantLayout::with_discriminant(cases, Discriminant::U8);
        Self {
            ok,
            err,
            error_class,
            layout,
        }
    }

    pub fn ok_type(&self) -> Option<&TypeDesc> {
        self.ok.as_ref()
    }

    pub fn err_type(&self) -> Option<&TypeDesc> {
        self.err.as_ref()
    }

    pub fn error_class(&self) -> Option<&str> {
        self.error_class.as_deref()
    }

    pub fn layout(&self) -> &VariantLayout {
        &self.layout
    }

    fn split<'v>(&self, value: &'v Value) -> Result<(usize, Option<&'v Value>), Trap> {
        match value {
            Value::Result(Ok(payload)) => Ok((0, payload.as_deref())),
            Value::Result(Err(payload)) => Ok((1, payload.as_deref())),
            other => Err(Trap::mismatch("result", other)),
        }
    }

    fn build((index, payload): (usize, Option<Value>)) -> Value {
        if index == 0 {
            Value::ok(payload)
        } else {
            Value::err(payload)
        }
    }

    pub fn load(&self, mem: &ReadonlyMemoryRange, offset: u32, cx: &WasmContext) -> Result<Value, Trap> {
        self.layout.load_case(mem, offset, cx).map(Self::build)
    }

    pub fn store(&self, mem: &MemoryRange, offset: u32, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        let (index, payload) = self.split(value)?;
        self.layout.store_case(mem, offset, index, payload, cx)
    }

    pub fn lift_flat(
        &self,
        memory: &Memory,
        values: &mut dyn Iterator<Item = FlatValue>,
        cx: &WasmContext,
    ) -> Result<Value, Trap> {
        self.layout.lift_case(memory, values, cx).map(Self::build)
    }

    pub fn lower_flat(&self, out: &mut Vec<FlatValue>, memory: &Memory, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
        let (index, payload) = self.split(value)?;
        self.layout.lower_case(out, memory, index, payload, cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::BumpMemory;

    fn cases(shape: &[(&str, Option<TypeDesc>)]) -> Vec<(String, Option<TypeDesc>)> {
        shape.iter().map(|(n, t)| (n.to_string(), t.clone())).collect()
    }

    #[test]
    fn test_discriminant_width() {
        assert_eq!(Discriminant::for_cases(1).unwrap(), Discriminant::U8);
        assert_eq!(Discriminant::for_cases(256).unwrap(), Discriminant::U8);
        assert_eq!(Discriminant::for_cases(257).unwrap(), Discriminant::U16);
        assert_eq!(Discriminant::for_cases(65536).unwrap(), Discriminant::U16);
        assert_eq!(Discriminant::for_cases(65537).unwrap(), Discriminant::U32);
        assert!(matches!(Discriminant::for_cases(0), Err(Trap::NoCases)));
    }

    #[test]
    fn test_variant_layout() {
        let v = VariantType::new(cases(&[
            ("a", Some(TypeDesc::U8)),
            ("b", Some(TypeDesc::U64)),
            ("c", None),
        ]))
        .unwrap();
        assert_eq!(v.layout().payload_offset(), 8);
        assert_eq!(v.layout().size(), 16);
        assert_eq!(v.layout().alignment(), 8);
        assert_eq!(v.layout().flat_types(), &[FlatType::I32, FlatType::I64]);
    }

    #[test]
    fn test_variant_flat_coercion() {
        let cx = WasmContext::default();
        let memory = Memory::new(BumpMemory::new()).unwrap();
        let v = VariantType::new(cases(&[("f", Some(TypeDesc::F32)), ("i", Some(TypeDesc::U64))])).unwrap();
        let value = Value::variant("f", Some(Value::F32(2.5)));
        let mut out = Vec::new();
        v.lower_flat(&mut out, &memory, &value, &cx).unwrap();
        assert_eq!(out, vec![FlatValue::I32(0), FlatValue::I64(u64::from(2.5f32.to_bits()))]);
        assert_eq!(v.lift_flat(&memory, &mut out.into_iter(), &cx).unwrap(), value);
    }

    #[test]
    fn test_enum_out_of_range() {
        let cx = WasmContext::default();
        let memory = Memory::new(BumpMemory::new()).unwrap();
        let e = EnumType::new(vec!["x".into(), "y".into()]).unwrap();
        let mut values = vec![FlatValue::I32(2)].into_iter();
        assert!(matches!(
            e.lift_flat(&memory, &mut values, &cx),
            Err(Trap::InvalidDiscriminant { discriminant: 2, num_cases: 2 })
        ));
    }

    #[test]
    fn test_option_none_pads() {
        let cx = WasmContext::default();
        let memory = Memory::new(BumpMemory::new()).unwrap();
        let opt = OptionType::new(TypeDesc::String);
        let mut out = Vec::new();
        opt.lower_flat(&mut out, &memory, &Value::none(), &cx).unwrap();
        assert_eq!(out, vec![FlatValue::I32(0), FlatValue::I32(0), FlatValue::I32(0)]);
        assert_eq!(opt.lift_flat(&memory, &mut out.into_iter(), &cx).unwrap(), Value::none());
    }
}
