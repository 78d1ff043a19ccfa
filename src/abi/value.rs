//! Host-side values moved across the boundary by the type descriptors.

use crate::resource::ResourceRef;

/// A structured host value.
///
/// Integer descriptors accept any integer variant whose value fits their
/// bounds; lifting always produces the variant matching the descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    S8(i8),
    S16(i16),
    S32(i32),
    S64(i64),
    F32(f32),
    F64(f64),
    Char(char),
    String(String),
    List(Vec<Value>),
    TypedArray(TypedArray),
    Record(Vec<(String, Value)>),
    Tuple(Vec<Value>),
    /// Flags of a type with at most 32 flags; bit `i` is flag `i`.
    Flags(u32),
    /// Flags of a type with more than 32 flags; word 0 holds flags 0..32.
    WideFlags(Vec<u32>),
    Variant {
        case: String,
        payload: Option<Box<Value>>,
    },
    Enum(String),
    Option(Option<Box<Value>>),
    Result(Result<Option<Box<Value>>, Option<Box<Value>>>),
    /// A raw resource handle.
    Handle(u32),
    Resource(ResourceRef),
}

impl Value {
    pub fn some(value: Value) -> Self {
        Value::Option(Some(Box::new(value)))
    }

    pub fn none() -> Self {
        Value::Option(None)
    }

    pub fn ok(value: Option<Value>) -> Self {
        Value::Result(Ok(value.map(Box::new)))
    }

    pub fn err(value: Option<Value>) -> Self {
        Value::Result(Err(value.map(Box::new)))
    }

    pub fn variant(case: impl Into<String>, payload: Option<Value>) -> Self {
        Value::Variant {
            case: case.into(),
            payload: payload.map(Box::new),
        }
    }

    pub fn record<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Short name of the value's shape, used in trap messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::S8(_) => "s8",
            Value::S16(_) => "s16",
            Value::S32(_) => "s32",
            Value::S64(_) => "s64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Char(_) => "char",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::TypedArray(_) => "typed-array",
            Value::Record(_) => "record",
            Value::Tuple(_) => "tuple",
            Value::Flags(_) | Value::WideFlags(_) => "flags",
            Value::Variant { .. } => "variant",
            Value::Enum(_) => "enum",
            Value::Option(_) => "option",
            Value::Result(_) => "result",
            Value::Handle(_) => "handle",
            Value::Resource(_) => "resource",
        }
    }

    /// The value of any integer variant, widened.
    pub fn as_integer(&self) -> Option<i128> {
        match self {
            Value::U8(v) => Some(i128::from(*v)),
            Value::U16(v) => Some(i128::from(*v)),
            Value::U32(v) => Some(i128::from(*v)),
            Value::U64(v) => Some(i128::from(*v)),
            Value::S8(v) => Some(i128::from(*v)),
            Value::S16(v) => Some(i128::from(*v)),
            Value::S32(v) => Some(i128::from(*v)),
            Value::S64(v) => Some(i128::from(*v)),
            Value::Handle(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    /// The value of either float variant, widened.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(f64::from(*v)),
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::S64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// Element kind of a typed numeric array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericKind {
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
}

impl NumericKind {
    /// Element size in bytes, which is also its alignment.
    pub fn size(self) -> u32 {
        match self {
            NumericKind::U8 | NumericKind::S8 => 1,
            NumericKind::U16 | NumericKind::S16 => 2,
            NumericKind::U32 | NumericKind::S32 | NumericKind::F32 => 4,
            NumericKind::U64 | NumericKind::S64 | NumericKind::F64 => 8,
        }
    }
}

/// A homogeneous numeric array moved as one block of bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedArray {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    S8(Vec<i8>),
    S16(Vec<i16>),
    S32(Vec<i32>),
    S64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! le_bytes {
    ($items:expr) => {
        $items.iter().flat_map(|v| v.to_le_bytes()).collect()
    };
}

macro_rules! from_le_chunks {
    ($bytes:expr, $ty:ty, $n:expr) => {
        $bytes
            .chunks_exact($n)
            .map(|chunk| {
                let mut buf = [0u8; $n];
                buf.copy_from_slice(chunk);
                <$ty>::from_le_bytes(buf)
            })
            .collect()
    };
}

impl TypedArray {
    pub fn kind(&self) -> NumericKind {
        match self {
            TypedArray::U8(_) => NumericKind::U8,
            TypedArray::U16(_) => NumericKind::U16,
            TypedArray::U32(_) => NumericKind::U32,
            TypedArray::U64(_) => NumericKind::U64,
            TypedArray::S8(_) => NumericKind::S8,
            TypedArray::S16(_) => NumericKind::S16,
            TypedArray::S32(_) => NumericKind::S32,
            TypedArray::S64(_) => NumericKind::S64,
            TypedArray::F32(_) => NumericKind::F32,
            TypedArray::F64(_) => NumericKind::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TypedArray::U8(v) => v.len(),
            TypedArray::U16(v) => v.len(),
            TypedArray::U32(v) => v.len(),
            TypedArray::U64(v) => v.len(),
            TypedArray::S8(v) => v.len(),
            TypedArray::S16(v) => v.len(),
            TypedArray::S32(v) => v.len(),
            TypedArray::S64(v) => v.len(),
            TypedArray::F32(v) => v.len(),
            TypedArray::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The little-endian byte image of the elements.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TypedArray::U8(v) => v.clone(),
            TypedArray::U16(v) => le_bytes!(v),
            TypedArray::U32(v) => le_bytes!(v),
            TypedArray::U64(v) => le_bytes!(v),
            TypedArray::S8(v) => le_bytes!(v),
            TypedArray::S16(v) => le_bytes!(v),
            TypedArray::S32(v) => le_bytes!(v),
            TypedArray::S64(v) => le_bytes!(v),
            TypedArray::F32(v) => le_bytes!(v),
            TypedArray::F64(v) => le_bytes!(v),
        }
    }

    /// Rebuild an array from its little-endian byte image. Trailing bytes
    /// that do not form a whole element are ignored.
    pub fn from_le_bytes(kind: NumericKind, bytes: &[u8]) -> Self {
        match kind {
            NumericKind::U8 => TypedArray::U8(bytes.to_vec()),
            NumericKind::U16 => TypedArray::U16(from_le_chunks!(bytes, u16, 2)),
            NumericKind::U32 => TypedArray::U32(from_le_chunks!(bytes, u32, 4)),
            NumericKind::U64 => TypedArray::U64(from_le_chunks!(bytes, u64, 8)),
            NumericKind::S8 => TypedArray::S8(from_le_chunks!(bytes, i8, 1)),
            NumericKind::S16 => TypedArray::S16(from_le_chunks!(bytes, i16, 2)),
            NumericKind::S32 => TypedArray::S32(from_le_chunks!(bytes, i32, 4)),
            NumericKind::S64 => TypedArray::S64(from_le_chunks!(bytes, i64, 8)),
            NumericKind::F32 => TypedArray::F32(from_le_chunks!(bytes, f32, 4)),
            NumericKind::F64 => TypedArray::F64(from_le_chunks!(bytes, f64, 8)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_array_bytes() {
        let arr = TypedArray::S16(vec![-1, 2, 300]);
        let bytes = arr.to_le_bytes();
        assert_eq!(bytes.len(), 6);
        assert_eq!(TypedArray::from_le_bytes(NumericKind::S16, &bytes), arr);
    }

    #[test]
    fn test_as_integer_widens() {
        assert_eq!(Value::S8(-3).as_integer(), Some(-3));
        assert_eq!(Value::U64(u64::MAX).as_integer(), Some(i128::from(u64::MAX)));
        assert_eq!(Value::Bool(true).as_integer(), None);
    }
}
