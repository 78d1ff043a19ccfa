//! Scalar descriptors: bool, integers, floats and char.

use crate::abi::flat::next_value;
use crate::abi::{FlatType, FlatValue, Memory, MemoryRange, MemoryView, ReadonlyMemoryRange, Trap, Value};

const CANONICAL_NAN_32: u32 = 0x7fc0_0000;
const CANONICAL_NAN_64: u64 = 0x7ff8_0000_0000_0000;

/// A scalar type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
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
}

impl Primitive {
    pub fn name(self) -> &'static str {
        match self {
            Primitive::Bool => "bool",
            Primitive::U8 => "u8",
            Primitive::U16 => "u16",
            Primitive::U32 => "u32",
            Primitive::U64 => "u64",
            Primitive::S8 => "s8",
            Primitive::S16 => "s16",
            Primitive::S32 => "s32",
            Primitive::S64 => "s64",
            Primitive::F32 => "f32",
            Primitive::F64 => "f64",
            Primitive::Char => "char",
        }
    }

    pub fn size(self) -> u32 {
        match self {
            Primitive::Bool | Primitive::U8 | Primitive::S8 => 1,
            Primitive::U16 | Primitive::S16 => 2,
            Primitive::U32 | Primitive::S32 | Primitive::F32 | Primitive::Char => 4,
            Primitive::U64 | Primitive::S64 | Primitive::F64 => 8,
        }
    }

    pub fn alignment(self) -> u32 {
        self.size()
    }

    pub fn flat_type(self) -> FlatType {
        match self {
            Primitive::U64 | Primitive::S64 => FlatType::I64,
            Primitive::F32 => FlatType::F32,
            Primitive::F64 => FlatType::F64,
            _ => FlatType::I32,
        }
    }

    /// Inclusive value bounds of the integer types.
    fn bounds(self) -> Option<(i128, i128)> {
        let bounds = match self {
            Primitive::U8 => (0, i128::from(u8::MAX)),
            Primitive::U16 => (0, i128::from(u16::MAX)),
            Primitive::U32 => (0, i128::from(u32::MAX)),
            Primitive::U64 => (0, i128::from(u64::MAX)),
            Primitive::S8 => (i128::from(i8::MIN), i128::from(i8::MAX)),
            Primitive::S16 => (i128::from(i16::MIN), i128::from(i16::MAX)),
            Primitive::S32 => (i128::from(i32::MIN), i128::from(i32::MAX)),
            Primitive::S64 => (i128::from(i64::MIN), i128::from(i64::MAX)),
            _ => return None,
        };
        Some(bounds)
    }

    pub fn load(self, mem: &ReadonlyMemoryRange, offset: u32) -> Result<Value, Trap> {
        match self {
            Primitive::Bool => bool_from_bits(u32::from(mem.get_u8(offset)?)).map(Value::Bool),
            Primitive::U8 => mem.get_u8(offset).map(Value::U8),
            Primitive::U16 => mem.get_u16(offset).map(Value::U16),
            Primitive::U32 => mem.get_u32(offset).map(Value::U32),
            Primitive::U64 => mem.get_u64(offset).map(Value::U64),
            Primitive::S8 => mem.get_i8(offset).map(Value::S8),
            Primitive::S16 => mem.get_i16(offset).map(Value::S16),
            Primitive::S32 => mem.get_i32(offset).map(Value::S32),
            Primitive::S64 => mem.get_i64(offset).map(Value::S64),
            Primitive::F32 => mem.get_u32(offset).map(|bits| Value::F32(f32_from_bits(bits))),
            Primitive::F64 => mem.get_u64(offset).map(|bits| Value::F64(f64_from_bits(bits))),
            Primitive::Char => char_from_bits(mem.get_u32(offset)?).map(Value::Char),
        }
    }

    pub fn store(self, mem: &MemoryRange, offset: u32, value: &Value) -> Result<(), Trap> {
        match self.lower_value(value)? {
            FlatValue::I32(bits) => match self.size() {
                1 => mem.set_u8(offset, bits as u8),
                2 => mem.set_u16(offset, bits as u16),
                _ => mem.set_u32(offset, bits),
            },
            FlatValue::I64(bits) => mem.set_u64(offset, bits),
            FlatValue::F32(f) => mem.set_u32(offset, f.to_bits()),
            FlatValue::F64(f) => mem.set_u64(offset, f.to_bits()),
        }
    }

    pub fn lift_flat(self, values: &mut dyn Iterator<Item = FlatValue>) -> Result<Value, Trap> {
        let flat = next_value(values)?;
        match self {
            Primitive::Bool => bool_from_bits(flat.as_i32()?).map(Value::Bool),
            Primitive::U8 => {
                let v = flat.as_i32()?;
                u8::try_from(v).map(Value::U8).map_err(|_| Trap::out_of_range("u8", v))
            }
            Primitive::U16 => {
                let v = flat.as_i32()?;
                u16::try_from(v).map(Value::U16).map_err(|_| Trap::out_of_range("u16", v))
            }
            Primitive::U32 => flat.as_i32().map(Value::U32),
            Primitive::U64 => flat.as_i64().map(Value::U64),
            Primitive::S8 => signed_from_bits(flat.as_i32()?, 8, "s8").map(|v| Value::S8(v as i8)),
            Primitive::S16 => {
                signed_from_bits(flat.as_i32()?, 16, "s16").map(|v| Value::S16(v as i16))
            }
            Primitive::S32 => flat.as_i32().map(|v| Value::S32(v as i32)),
            Primitive::S64 => flat.as_i64().map(|v| Value::S64(v as i64)),
            Primitive::F32 => {
                let f = flat.as_f32()?;
                check_float("f32", f64::from(f), f64::from(f32::MAX))?;
                Ok(Value::F32(if f.is_nan() { f32_from_bits(CANONICAL_NAN_32) } else { f }))
            }
            Primitive::F64 => {
                let f = flat.as_f64()?;
                check_float("f64", f, f64::MAX)?;
                Ok(Value::F64(if f.is_nan() { f64_from_bits(CANONICAL_NAN_64) } else { f }))
            }
            Primitive::Char => char_from_bits(flat.as_i32()?).map(Value::Char),
        }
    }

    pub fn lower_flat(self, out: &mut Vec<FlatValue>, value: &Value) -> Result<(), Trap> {
        out.push(self.lower_value(value)?);
        Ok(())
    }

    /// Convert a host value into the flat value of this type, enforcing bounds.
    ///
    /// Signed integers become their unsigned bit pattern at the type's own
    /// width, so `-1i8` lowers to `255`.
    fn lower_value(self, value: &Value) -> Result<FlatValue, Trap> {
        match self {
            Primitive::Bool => match value {
                Value::Bool(b) => Ok(FlatValue::I32(u32::from(*b))),
                other => Err(Trap::mismatch("bool", other)),
            },
            Primitive::Char => match value {
                Value::Char(c) => Ok(FlatValue::I32(u32::from(*c))),
                other => Err(Trap::mismatch("char", other)),
            },
            Primitive::F32 => {
                let f = value.as_float().ok_or_else(|| Trap::mismatch("f32", value))?;
                check_float("f32", f, f64::from(f32::MAX))?;
                let bits = if f.is_nan() { CANONICAL_NAN_32 } else { (f as f32).to_bits() };
                Ok(FlatValue::F32(f32::from_bits(bits)))
            }
            Primitive::F64 => {
                let f = value.as_float().ok_or_else(|| Trap::mismatch("f64", value))?;
                check_float("f64", f, f64::MAX)?;
                let bits = if f.is_nan() { CANONICAL_NAN_64 } else { f.to_bits() };
                Ok(FlatValue::F64(f64::from_bits(bits)))
            }
            integer => {
                let v = value.as_integer().ok_or_else(|| Trap::mismatch(integer.name(), value))?;
                let (low, high) = integer.bounds().ok_or_else(|| Trap::mismatch("integer", value))?;
                if v < low || v > high {
                    return Err(Trap::out_of_range(integer.name(), v));
                }
                Ok(match integer {
                    Primitive::U64 => FlatValue::I64(v as u64),
                    Primitive::S64 => FlatValue::I64(v as i64 as u64),
                    Primitive::S8 => FlatValue::I32(u32::from(v as i8 as u8)),
                    Primitive::S16 => FlatValue::I32(u32::from(v as i16 as u16)),
                    Primitive::S32 => FlatValue::I32(v as i32 as u32),
                    _ => FlatValue::I32(v as u32),
                })
            }
        }
    }

    pub fn copy(
        self,
        dest: &MemoryRange,
        dest_offset: u32,
        src: &ReadonlyMemoryRange,
        src_offset: u32,
    ) -> Result<(), Trap> {
        dest.assert_alignment(dest_offset, self.alignment())?;
        src.assert_alignment(src_offset, self.alignment())?;
        src.copy_bytes(src_offset, self.size(), dest, dest_offset)
    }

    pub fn copy_flat(
        self,
        out: &mut Vec<FlatValue>,
        values: &mut dyn Iterator<Item = FlatValue>,
    ) -> Result<(), Trap> {
        let value = next_value(values)?;
        if value.flat_type() != self.flat_type() {
            return Err(Trap::FlatTypeMismatch {
                expected: self.flat_type(),
                got: value.flat_type(),
            });
        }
        out.push(value);
        Ok(())
    }

    pub fn alloc(self, memory: &Memory) -> Result<MemoryRange, Trap> {
        memory.alloc(self.alignment(), self.size())
    }
}

fn bool_from_bits(bits: u32) -> Result<bool, Trap> {
    match bits {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Trap::InvalidBool(other)),
    }
}

fn char_from_bits(bits: u32) -> Result<char, Trap> {
    char::from_u32(bits).ok_or(Trap::InvalidChar(bits))
}

/// Restore a signed value of `width` bits from its flat bit pattern.
///
/// Accepts both the width-`N` unsigned pattern and a sign-extended 32-bit
/// pattern.
fn signed_from_bits(bits: u32, width: u32, kind: &'static str) -> Result<i64, Trap> {
    let modulus = 1i64 << width;
    let max = (modulus >> 1) - 1;
    let min = -(modulus >> 1);
    let mut value = i64::from(bits);
    if value > max {
        value -= modulus;
    }
    if (min..=max).contains(&value) {
        return Ok(value);
    }
    let extended = i64::from(bits as i32);
    if (min..=max).contains(&extended) {
        return Ok(extended);
    }
    Err(Trap::out_of_range(kind, bits))
}

fn check_float(kind: &'static str, value: f64, max: f64) -> Result<(), Trap> {
    if value < -max || value > max {
        return Err(Trap::out_of_range(kind, value));
    }
    Ok(())
}

fn f32_from_bits(bits: u32) -> f32 {
    let f = f32::from_bits(bits);
    if f.is_nan() { f32::from_bits(CANONICAL_NAN_32) } else { f }
}

fn f64_from_bits(bits: u64) -> f64 {
    let f = f64::from_bits(bits);
    if f.is_nan() { f64::from_bits(CANONICAL_NAN_64) } else { f }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lower(p: Primitive, v: Value) -> Result<FlatValue, Trap> {
        let mut out = Vec::new();
        p.lower_flat(&mut out, &v)?;
        out.pop().ok_or(Trap::MissingFlatValue)
    }

    fn lift(p: Primitive, v: FlatValue) -> Result<Value, Trap> {
        p.lift_flat(&mut std::iter::once(v))
    }

    #[test]
    fn test_signed_bit_patterns() {
        assert_eq!(lower(Primitive::S8, Value::S8(-1)).unwrap(), FlatValue::I32(255));
        assert_eq!(lift(Primitive::S8, FlatValue::I32(255)).unwrap(), Value::S8(-1));
        assert_eq!(lift(Primitive::S8, FlatValue::I32(u32::MAX)).unwrap(), Value::S8(-1));
        assert_eq!(lower(Primitive::S16, Value::S16(-2)).unwrap(), FlatValue::I32(0xFFFE));
        assert_eq!(lift(Primitive::S64, FlatValue::I64(u64::MAX)).unwrap(), Value::S64(-1));
        assert!(lift(Primitive::S8, FlatValue::I32(0x1_0000)).is_err());
    }

    #[test]
    fn test_integer_bounds() {
        assert!(lower(Primitive::U8, Value::U32(256)).is_err());
        assert!(lower(Primitive::U8, Value::S32(-1)).is_err());
        assert_eq!(lower(Primitive::U8, Value::S32(200)).unwrap(), FlatValue::I32(200));
        assert!(lift(Primitive::U16, FlatValue::I32(70_000)).is_err());
        assert!(lower(Primitive::S32, Value::U64(u64::from(u32::MAX))).is_err());
    }

    #[test]
    fn test_bool_is_strict() {
        assert_eq!(lift(Primitive::Bool, FlatValue::I32(1)).unwrap(), Value::Bool(true));
        assert!(matches!(lift(Primitive::Bool, FlatValue::I32(2)), Err(Trap::InvalidBool(2))));
    }

    #[test]
    fn test_char_validation() {
        assert!(matches!(lift(Primitive::Char, FlatValue::I32(0xD800)), Err(Trap::InvalidChar(_))));
        assert!(lift(Primitive::Char, FlatValue::I32(0x11_0000)).is_err());
        assert_eq!(lift(Primitive::Char, FlatValue::I32(0x1F600)).unwrap(), Value::Char('😀'));
    }

    #[test]
    fn test_float_nan_and_infinity() {
        let nan = lower(Primitive::F32, Value::F32(f32::from_bits(0x7fc0_0001))).unwrap();
        assert_eq!(nan.as_f32().unwrap().to_bits(), CANONICAL_NAN_32);
        assert!(lower(Primitive::F64, Value::F64(f64::INFINITY)).is_err());
        assert!(lift(Primitive::F32, FlatValue::F32(f32::NEG_INFINITY)).is_err());
        let lifted = lift(Primitive::F64, FlatValue::F64(f64::from_bits(0x7ff0_0000_0000_0001)));
        assert!(matches!(lifted, Ok(Value::F64(f)) if f.to_bits() == CANONICAL_NAN_64));
    }
}
