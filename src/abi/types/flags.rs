//! Flags: a set of named booleans packed into bits.
//!
//! Up to 8 flags use one byte, up to 16 two bytes, up to 32 one word. Larger
//! sets use `ceil(n / 32)` words with flags `0..32` in the first word.

use crate::abi::flat::next_value;
use crate::abi::{FlatType, FlatValue, Memory, MemoryRange, MemoryView, ReadonlyMemoryRange, Trap, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagsType {
    names: Vec<String>,
    flat_types: Vec<FlatType>,
}

impl FlagsType {
    pub fn new(names: Vec<String>) -> Self {
        let words = Self::word_count(names.len());
        Self {
            names,
            flat_types: vec![FlatType::I32; words],
        }
    }

    fn word_count(count: usize) -> usize {
        count.div_ceil(32)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Bit index of a flag.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn size(&self) -> u32 {
        match self.names.len() {
            0 => 0,
            1..=8 => 1,
            9..=16 => 2,
            n => 4 * Self::word_count(n) as u32,
        }
    }

    pub fn alignment(&self) -> u32 {
        match self.names.len() {
            0..=8 => 1,
            9..=16 => 2,
            _ => 4,
        }
    }

    pub fn flat_types(&self) -> &[FlatType] {
        &self.flat_types
    }

    fn is_wide(&self) -> bool {
        self.names.len() > 32
    }

    /// Mask of the valid bits in word `index`.
    fn word_mask(&self, index: usize) -> u32 {
        let remaining = self.names.len().saturating_sub(index * 32);
        if remaining >= 32 {
            u32::MAX
        } else {
            (1u32 << remaining) - 1
        }
    }

    /// Split a flags value into words, rejecting bits past the last flag.
    fn words(&self, value: &Value) -> Result<Vec<u32>, Trap> {
        let words = match (value, self.is_wide()) {
            (Value::Flags(bits), false) => vec![*bits],
            (Value::WideFlags(words), true) if words.len() == self.flat_types.len() => words.clone(),
            (other, _) => return Err(Trap::mismatch(format!("flags of {}", self.names.len()), other)),
        };
        if self.names.is_empty() {
            return match words.first() {
                Some(0) | None => Ok(Vec::new()),
                Some(bits) => Err(Trap::out_of_range("flags", bits)),
            };
        }
        for (i, word) in words.iter().enumerate() {
            if word & !self.word_mask(i) != 0 {
                return Err(Trap::out_of_range("flags", word));
            }
        }
        Ok(words)
    }

    fn from_words(&self, words: Vec<u32>) -> Value {
        if self.is_wide() {
            Value::WideFlags(words)
        } else {
            Value::Flags(words.first().copied().unwrap_or(0))
        }
    }

    pub fn load(&self, mem: &ReadonlyMemoryRange, offset: u32) -> Result<Value, Trap> {
        let words = match self.names.len() {
            0 => Vec::new(),
            1..=8 => vec![u32::from(mem.get_u8(offset)?)],
            9..=16 => vec![u32::from(mem.get_u16(offset)?)],
            _ => (0..self.flat_types.len() as u32)
                .map(|i| mem.get_u32(offset + i * 4))
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(self.from_words(words))
    }

    pub fn store(&self, mem: &MemoryRange, offset: u32, value: &Value) -> Result<(), Trap> {
        let words = self.words(value)?;
        match self.names.len() {
            0 => Ok(()),
            1..=8 => mem.set_u8(offset, words.first().copied().unwrap_or(0) as u8),
            9..=16 => mem.set_u16(offset, words.first().copied().unwrap_or(0) as u16),
            _ => {
                for (i, word) in words.iter().enumerate() {
                    mem.set_u32(offset + i as u32 * 4, *word)?;
                }
                Ok(())
            }
        }
    }

    pub fn lift_flat(&self, values: &mut dyn Iterator<Item = FlatValue>) -> Result<Value, Trap> {
        let words = (0..self.flat_types.len())
            .map(|_| next_value(values).and_then(|v| v.as_i32()))
            .collect::<Result<Vec<_>, _>>()?;
        for (i, word) in words.iter().enumerate() {
            if word & !self.word_mask(i) != 0 {
                return Err(Trap::out_of_range("flags", word));
            }
        }
        Ok(self.from_words(words))
    }

    pub fn lower_flat(&self, out: &mut Vec<FlatValue>, value: &Value) -> Result<(), Trap> {
        out.extend(self.words(value)?.into_iter().map(FlatValue::I32));
        Ok(())
    }

    pub fn copy(
        &self,
        dest: &MemoryRange,
        dest_offset: u32,
        src: &ReadonlyMemoryRange,
        src_offset: u32,
    ) -> Result<(), Trap> {
        dest.assert_alignment(dest_offset, self.alignment())?;
        src.assert_alignment(src_offset, self.alignment())?;
        src.copy_bytes(src_offset, self.size(), dest, dest_offset)
    }

    pub fn copy_flat(&self, out: &mut Vec<FlatValue>, values: &mut dyn Iterator<Item = FlatValue>) -> Result<(), Trap> {
        for _ in 0..self.flat_types.len() {
            out.push(FlatValue::I32(next_value(values)?.as_i32()?));
        }
        Ok(())
    }

    pub fn alloc(&self, memory: &Memory) -> Result<MemoryRange, Trap> {
        memory.alloc(self.alignment(), self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(n: usize) -> FlagsType {
        FlagsType::new((0..n).map(|i| format!("f{}", i)).collect())
    }

    #[test]
    fn test_flags_layout() {
        assert_eq!((flags(0).size(), flags(0).alignment(), flags(0).flat_types().len()), (0, 1, 0));
        assert_eq!((flags(8).size(), flags(8).alignment()), (1, 1));
        assert_eq!((flags(9).size(), flags(9).alignment()), (2, 2));
        assert_eq!((flags(17).size(), flags(17).alignment()), (4, 4));
        assert_eq!((flags(33).size(), flags(33).flat_types().len()), (8, 2));
    }

    #[test]
    fn test_extra_bits_rejected() {
        let ty = flags(3);
        let mut out = Vec::new();
        assert!(ty.lower_flat(&mut out, &Value::Flags(0b1000)).is_err());
        ty.lower_flat(&mut out, &Value::Flags(0b101)).unwrap();
        assert_eq!(out, vec![FlatValue::I32(0b101)]);
    }

    #[test]
    fn test_wide_flags_flat() {
        let ty = flags(40);
        let value = Value::WideFlags(vec![u32::MAX, 0xff]);
        let mut out = Vec::new();
        ty.lower_flat(&mut out, &value).unwrap();
        assert_eq!(ty.lift_flat(&mut out.into_iter()).unwrap(), value);
        assert!(ty.lower_flat(&mut Vec::new(), &Value::WideFlags(vec![0, 0x100])).is_err());
    }
}
