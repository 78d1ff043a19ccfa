//! The string descriptor.
//!
//! A string is a `{ptr, code_units}` pair. The byte length and alignment of
//! the data depend on the context encoding.

use crate::abi::flat::next_value;
use crate::abi::{FlatType, FlatValue, Memory, MemoryRange, MemoryView, ReadonlyMemoryRange, Trap, Value};
use crate::context::{Encoding, WasmContext};

const DATA: u32 = 0;
const CODE_UNITS: u32 = 4;

pub const SIZE: u32 = 8;
pub const ALIGNMENT: u32 = 4;
pub const FLAT_TYPES: [FlatType; 2] = [FlatType::I32, FlatType::I32];

/// Alignment and byte length of `code_units` units in `encoding`.
fn data_layout(encoding: Encoding, code_units: u32) -> Result<(u32, u32), Trap> {
    match encoding {
        Encoding::Utf8 => Ok((1, code_units)),
        Encoding::Utf16 => code_units
            .checked_mul(2)
            .map(|len| (2, len))
            .ok_or_else(|| Trap::out_of_range("string", code_units)),
        Encoding::Latin1Utf16 => Err(Trap::UnsupportedEncoding(encoding.name().to_string())),
    }
}

fn load_from(memory: &Memory, ptr: u32, code_units: u32, cx: &WasmContext) -> Result<String, Trap> {
    let (alignment, byte_len) = data_layout(cx.options().encoding, code_units)?;
    let reader = memory.readonly(ptr, byte_len)?;
    reader.assert_alignment(0, alignment)?;
    let bytes = reader.get_bytes(0, byte_len)?;
    let platform = cx.platform();
    match cx.options().encoding {
        Encoding::Utf16 => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| {
                    let mut unit = [0u8; 2];
                    unit.copy_from_slice(pair);
                    u16::from_le_bytes(unit)
                })
                .collect();
            platform.decode_utf16(&units)
        }
        _ => platform.decode_utf8(bytes),
    }
}

/// Write the string data into freshly allocated memory and return
/// `(ptr, code_units)`.
fn store_into(memory: &Memory, text: &str, cx: &WasmContext) -> Result<(u32, u32), Trap> {
    let encoding = cx.options().encoding;
    let platform = cx.platform();
    let (bytes, code_units) = match encoding {
        Encoding::Utf8 => {
            let bytes = platform.encode_utf8(text);
            let len = bytes.len() as u32;
            (bytes, len)
        }
        Encoding::Utf16 => {
            let units = platform.encode_utf16(text);
            let len = units.len() as u32;
            (units.iter().flat_map(|u| u.to_le_bytes()).collect(), len)
        }
        Encoding::Latin1Utf16 => {
            return Err(Trap::UnsupportedEncoding(encoding.name().to_string()));
        }
    };
    let (alignment, byte_len) = data_layout(encoding, code_units)?;
    let writer = memory.alloc(alignment, byte_len)?;
    writer.set_bytes(0, &bytes)?;
    Ok((writer.ptr(), code_units))
}

/// Relocate string data into `dest` without decoding it.
fn relocate(dest: &Memory, src: &Memory, ptr: u32, code_units: u32, cx: &WasmContext) -> Result<u32, Trap> {
    let (alignment, byte_len) = data_layout(cx.options().encoding, code_units)?;
    let reader = src.readonly(ptr, byte_len)?;
    let writer = dest.alloc(alignment, byte_len)?;
    reader.copy_bytes(0, byte_len, &writer, 0)?;
    Ok(writer.ptr())
}

fn text(value: &Value) -> Result<&str, Trap> {
    value.as_str().ok_or_else(|| Trap::mismatch("string", value))
}

pub fn load(mem: &ReadonlyMemoryRange, offset: u32, cx: &WasmContext) -> Result<Value, Trap> {
    let ptr = mem.get_u32(offset + DATA)?;
    let code_units = mem.get_u32(offset + CODE_UNITS)?;
    load_from(mem.memory(), ptr, code_units, cx).map(Value::String)
}

pub fn store(mem: &MemoryRange, offset: u32, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
    let (ptr, code_units) = store_into(mem.memory(), text(value)?, cx)?;
    mem.set_u32(offset + DATA, ptr)?;
    mem.set_u32(offset + CODE_UNITS, code_units)
}

pub fn lift_flat(
    memory: &Memory,
    values: &mut dyn Iterator<Item = FlatValue>,
    cx: &WasmContext,
) -> Result<Value, Trap> {
    let ptr = next_value(values)?.as_i32()?;
    let code_units = next_value(values)?.as_i32()?;
    load_from(memory, ptr, code_units, cx).map(Value::String)
}

pub fn lower_flat(out: &mut Vec<FlatValue>, memory: &Memory, value: &Value, cx: &WasmContext) -> Result<(), Trap> {
    let (ptr, code_units) = store_into(memory, text(value)?, cx)?;
    out.push(FlatValue::I32(ptr));
    out.push(FlatValue::I32(code_units));
    Ok(())
}

pub fn copy(
    dest: &MemoryRange,
    dest_offset: u32,
    src: &ReadonlyMemoryRange,
    src_offset: u32,
    cx: &WasmContext,
) -> Result<(), Trap> {
    dest.assert_alignment(dest_offset, ALIGNMENT)?;
    src.assert_alignment(src_offset, ALIGNMENT)?;
    let ptr = src.get_u32(src_offset + DATA)?;
    let code_units = src.get_u32(src_offset + CODE_UNITS)?;
    let new_ptr = relocate(dest.memory(), src.memory(), ptr, code_units, cx)?;
    dest.set_u32(dest_offset + DATA, new_ptr)?;
    dest.set_u32(dest_offset + CODE_UNITS, code_units)
}

pub fn copy_flat(
    out: &mut Vec<FlatValue>,
    dest: &Memory,
    values: &mut dyn Iterator<Item = FlatValue>,
    src: &Memory,
    cx: &WasmContext,
) -> Result<(), Trap> {
    let ptr = next_value(values)?.as_i32()?;
    let code_units = next_value(values)?.as_i32()?;
    let new_ptr = relocate(dest, src, ptr, code_units, cx)?;
    out.push(FlatValue::I32(new_ptr));
    out.push(FlatValue::I32(code_units));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::BumpMemory;
    use crate::context::Options;
    use crate::platform::Platform;
    use std::sync::Arc;

    fn cx(encoding: Encoding) -> WasmContext {
        WasmContext::new(Options { encoding }, Arc::new(Platform::default()))
    }

    #[test]
    fn test_utf16_round_trip() {
        let cx = cx(Encoding::Utf16);
        let memory = Memory::new(BumpMemory::new()).unwrap();
        let mut out = Vec::new();
        lower_flat(&mut out, &memory, &Value::from("ñandú"), &cx).unwrap();
        assert_eq!(out.get(1), Some(&FlatValue::I32(5)));
        let lifted = lift_flat(&memory, &mut out.into_iter(), &cx).unwrap();
        assert_eq!(lifted, Value::from("ñandú"));
    }

    #[test]
    fn test_latin1_traps() {
        let cx = cx(Encoding::Latin1Utf16);
        let memory = Memory::new(BumpMemory::new()).unwrap();
        let mut out = Vec::new();
        let err = lower_flat(&mut out, &memory, &Value::from("x"), &cx).unwrap_err();
        assert!(matches!(err, Trap::UnsupportedEncoding(_)));
    }

    #[test]
    fn test_copy_flat_relocates_bytes() {
        let cx = cx(Encoding::Utf8);
        let src = Memory::new(BumpMemory::new()).unwrap();
        let dest = Memory::new(BumpMemory::new()).unwrap();
        let mut flat = Vec::new();
        lower_flat(&mut flat, &src, &Value::from("relay"), &cx).unwrap();
        let mut copied = Vec::new();
        copy_flat(&mut copied, &dest, &mut flat.into_iter(), &src, &cx).unwrap();
        let lifted = lift_flat(&dest, &mut copied.into_iter(), &cx).unwrap();
        assert_eq!(lifted, Value::from("relay"));
    }
}
