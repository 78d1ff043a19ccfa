//! Flat (register-class) values used when values travel as call arguments.
//!
//! Signed integers cross as their unsigned bit pattern, so the integer
//! variants of [`FlatValue`] are unsigned.

use std::fmt;

use super::Trap;

/// Maximum number of flat values passed as parameters before spilling to memory.
pub const MAX_FLAT_PARAMS: usize = 16;

/// Maximum number of flat values returned before switching to an out-pointer.
pub const MAX_FLAT_RESULTS: usize = 1;

/// A core wasm register class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlatType {
    I32,
    I64,
    F32,
    F64,
}

impl fmt::Display for FlatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlatType::I32 => "i32",
            FlatType::I64 => "i64",
            FlatType::F32 => "f32",
            FlatType::F64 => "f64",
        };
        f.write_str(name)
    }
}

impl FlatType {
    /// The zero value of this register class, used to pad variant payloads.
    pub fn zero(self) -> FlatValue {
        match self {
            FlatType::I32 => FlatValue::I32(0),
            FlatType::I64 => FlatValue::I64(0),
            FlatType::F32 => FlatValue::F32(0.0),
            FlatType::F64 => FlatValue::F64(0.0),
        }
    }

    /// Join two register classes into one that can carry both.
    ///
    /// Same class passes through, `i32`/`f32` joins to `i32`, and any other
    /// pair widens to `i64`.
    pub fn join(self, other: FlatType) -> FlatType {
        match (self, other) {
            (a, b) if a == b => a,
            (FlatType::I32, FlatType::F32) | (FlatType::F32, FlatType::I32) => FlatType::I32,
            _ => FlatType::I64,
        }
    }
}

/// Join the flat types of two variant cases slot by slot.
///
/// The result is as long as the longer input; slots only one side has are
/// taken as they are.
pub fn join_flat_types(a: &[FlatType], b: &[FlatType]) -> Vec<FlatType> {
    let len = a.len().max(b.len());
    (0..len)
        .filter_map(|i| match (a.get(i), b.get(i)) {
            (Some(x), Some(y)) => Some(x.join(*y)),
            (Some(x), None) | (None, Some(x)) => Some(*x),
            (None, None) => None,
        })
        .collect()
}

/// A core wasm value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlatValue {
    I32(u32),
    I64(u64),
    F32(f32),
    F64(f64),
}

impl FlatValue {
    pub fn flat_type(&self) -> FlatType {
        match self {
            FlatValue::I32(_) => FlatType::I32,
            FlatValue::I64(_) => FlatType::I64,
            FlatValue::F32(_) => FlatType::F32,
            FlatValue::F64(_) => FlatType::F64,
        }
    }

    pub fn as_i32(&self) -> Result<u32, Trap> {
        match self {
            FlatValue::I32(v) => Ok(*v),
            other => Err(Trap::FlatTypeMismatch {
                expected: FlatType::I32,
                got: other.flat_type(),
            }),
        }
    }

    pub fn as_i64(&self) -> Result<u64, Trap> {
        match self {
            FlatValue::I64(v) => Ok(*v),
            other => Err(Trap::FlatTypeMismatch {
                expected: FlatType::I64,
                got: other.flat_type(),
            }),
        }
    }

    pub fn as_f32(&self) -> Result<f32, Trap> {
        match self {
            FlatValue::F32(v) => Ok(*v),
            other => Err(Trap::FlatTypeMismatch {
                expected: FlatType::F32,
                got: other.flat_type(),
            }),
        }
    }

    pub fn as_f64(&self) -> Result<f64, Trap> {
        match self {
            FlatValue::F64(v) => Ok(*v),
            other => Err(Trap::FlatTypeMismatch {
                expected: FlatType::F64,
                got: other.flat_type(),
            }),
        }
    }

    /// Coerce a case value into the joined register class of its slot.
    pub fn widen(self, joined: FlatType) -> Result<FlatValue, Trap> {
        match (self, joined) {
            (v, j) if v.flat_type() == j => Ok(v),
            (FlatValue::F32(f), FlatType::I32) => Ok(FlatValue::I32(f.to_bits())),
            (FlatValue::I32(i), FlatType::I64) => Ok(FlatValue::I64(u64::from(i))),
            (FlatValue::F32(f), FlatType::I64) => Ok(FlatValue::I64(u64::from(f.to_bits()))),
            (FlatValue::F64(f), FlatType::I64) => Ok(FlatValue::I64(f.to_bits())),
            (v, j) => Err(Trap::FlatTypeMismatch {
                expected: j,
                got: v.flat_type(),
            }),
        }
    }

    /// Coerce a joined slot value back into the register class a case expects.
    pub fn narrow(self, case: FlatType) -> Result<FlatValue, Trap> {
        match (self, case) {
            (v, c) if v.flat_type() == c => Ok(v),
            (FlatValue::I32(i), FlatType::F32) => Ok(FlatValue::F32(f32::from_bits(i))),
            (FlatValue::I64(i), FlatType::I32) => Ok(FlatValue::I32(narrow_u64(i, case)?)),
            (FlatValue::I64(i), FlatType::F32) => {
                Ok(FlatValue::F32(f32::from_bits(narrow_u64(i, case)?)))
            }
            (FlatValue::I64(i), FlatType::F64) => Ok(FlatValue::F64(f64::from_bits(i))),
            (v, c) => Err(Trap::FlatTypeMismatch {
                expected: c,
                got: v.flat_type(),
            }),
        }
    }
}

fn narrow_u64(value: u64, target: FlatType) -> Result<u32, Trap> {
    u32::try_from(value).map_err(|_| Trap::FlatValueTooLarge { value, target })
}

/// Widen lowered case values to the joined slot types, padding the unused
/// trailing slots with zeros.
pub fn widen_values(values: &[FlatValue], joined: &[FlatType]) -> Result<Vec<FlatValue>, Trap> {
    if values.len() > joined.len() {
        return Err(Trap::convention(format!(
            "case produced {} flat values, but the variant only has {} slots",
            values.len(),
            joined.len()
        )));
    }
    joined
        .iter()
        .enumerate()
        .map(|(i, ty)| match values.get(i) {
            Some(v) => v.widen(*ty),
            None => Ok(ty.zero()),
        })
        .collect()
}

/// Narrow joined slot values to the flat types of the active case, dropping
/// the padding slots.
pub fn narrow_values(values: &[FlatValue], case: &[FlatType]) -> Result<Vec<FlatValue>, Trap> {
    case.iter()
        .enumerate()
        .map(|(i, ty)| {
            values
                .get(i)
                .ok_or(Trap::MissingFlatValue)
                .and_then(|v| v.narrow(*ty))
        })
        .collect()
}

/// Pull the next value from a flat value iterator.
#[inline]
pub(crate) fn next_value(values: &mut dyn Iterator<Item = FlatValue>) -> Result<FlatValue, Trap> {
    values.next().ok_or(Trap::MissingFlatValue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_rules() {
        assert_eq!(FlatType::I32.join(FlatType::I32), FlatType::I32);
        assert_eq!(FlatType::I32.join(FlatType::F32), FlatType::I32);
        assert_eq!(FlatType::F32.join(FlatType::I32), FlatType::I32);
        assert_eq!(FlatType::F32.join(FlatType::F64), FlatType::I64);
        assert_eq!(FlatType::I32.join(FlatType::I64), FlatType::I64);
        assert_eq!(FlatType::F64.join(FlatType::F64), FlatType::F64);
    }

    #[test]
    fn test_join_slots() {
        let a = [FlatType::I32, FlatType::F32];
        let b = [FlatType::F64];
        assert_eq!(join_flat_types(&a, &b), vec![FlatType::I64, FlatType::F32]);
        assert_eq!(join_flat_types(&b, &a), vec![FlatType::I64, FlatType::F32]);
    }

    #[test]
    fn test_widen_narrow() {
        let v = FlatValue::F32(1.5);
        let wide = v.widen(FlatType::I64).unwrap();
        assert_eq!(wide, FlatValue::I64(u64::from(1.5f32.to_bits())));
        assert_eq!(wide.narrow(FlatType::F32).unwrap(), v);

        let too_big = FlatValue::I64(u64::from(u32::MAX) + 1);
        assert!(too_big.narrow(FlatType::I32).is_err());
    }

    #[test]
    fn test_widen_pads_with_zeros() {
        let joined = [FlatType::I64, FlatType::F32];
        let widened = widen_values(&[FlatValue::I32(7)], &joined).unwrap();
        assert_eq!(widened, vec![FlatValue::I64(7), FlatValue::F32(0.0)]);
        let narrowed = narrow_values(&widened, &[FlatType::I32]).unwrap();
        assert_eq!(narrowed, vec![FlatValue::I32(7)]);
    }
}
