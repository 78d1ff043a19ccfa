//! Byte-level layout checks against the canonical ABI.

use std::sync::Arc;

use wit_bridge::abi::{BumpMemory, FlatType, FlatValue, Memory, MemoryView, Trap, TypeDesc, Value};
use wit_bridge::{Encoding, Options, Platform, WasmContext};

fn context(encoding: Encoding) -> anyhow::Result<WasmContext> {
    let memory = Memory::new(BumpMemory::new())?;
    Ok(WasmContext::with_memory(Options { encoding }, Arc::new(Platform::default()), memory))
}

#[test]
fn test_record_bytes() -> anyhow::Result<()> {
    let cx = context(Encoding::Utf8)?;
    let memory = cx.memory()?;
    let ty = TypeDesc::record([("a", TypeDesc::U16), ("b", TypeDesc::BOOL)]);
    assert_eq!(ty.size(), 4);
    assert_eq!(ty.alignment(), 2);

    let range = memory.alloc(4, ty.size())?;
    assert_eq!(range.ptr() % 4, 0);
    let value = Value::record([("a", Value::U16(300)), ("b", Value::Bool(true))]);
    ty.store(&range, 0, &value, &cx)?;

    let bytes = memory.readonly(range.ptr(), 3)?.get_bytes(0, 3)?;
    assert_eq!(bytes, vec![0x2c, 0x01, 0x01]);
    assert_eq!(ty.load_at(&memory, range.ptr(), &cx)?, value);
    Ok(())
}

#[test]
fn test_string_pointer_pair() -> anyhow::Result<()> {
    let cx = context(Encoding::Utf8)?;
    let memory = cx.memory()?;
    let mut flat = Vec::new();
    TypeDesc::String.lower_flat(&mut flat, &memory, &Value::from("café"), &cx)?;
    assert_eq!(flat.len(), 2);
    let ptr = flat.first().map(FlatValue::as_i32).transpose()?.unwrap_or_default();
    assert_eq!(flat.get(1), Some(&FlatValue::I32(5)));
    assert_eq!(memory.readonly(ptr, 5)?.get_bytes(0, 5)?, "café".as_bytes());

    let lifted = TypeDesc::String.lift_flat(&memory, &mut flat.into_iter(), &cx)?;
    assert_eq!(lifted.as_str(), Some("café"));
    Ok(())
}

#[test]
fn test_utf16_length_counts_code_units() -> anyhow::Result<()> {
    let cx = context(Encoding::Utf16)?;
    let memory = cx.memory()?;
    let mut flat = Vec::new();
    TypeDesc::String.lower_flat(&mut flat, &memory, &Value::from("café"), &cx)?;
    assert_eq!(flat.get(1), Some(&FlatValue::I32(4)));
    Ok(())
}

#[test]
fn test_variant_payload_alignment() -> anyhow::Result<()> {
    let ty = TypeDesc::variant([("small", Some(TypeDesc::U8)), ("large", Some(TypeDesc::U64)), ("empty", None)])?;
    assert_eq!(ty.alignment(), 8);
    assert_eq!(ty.size(), 16);
    assert_eq!(ty.flat_types(), &[FlatType::I32, FlatType::I64]);

    let cx = context(Encoding::Utf8)?;
    let memory = cx.memory()?;
    let value = Value::variant("large", Some(Value::U64(u64::MAX)));
    let range = ty.alloc(&memory)?;
    ty.store(&range, 0, &value, &cx)?;
    let stored = range.as_readonly();
    assert_eq!(stored.get_u8(0)?, 1);
    assert_eq!(stored.get_u64(8)?, u64::MAX);
    assert_eq!(ty.load(&stored, 0, &cx)?, value);
    Ok(())
}

#[test]
fn test_flags_words() -> anyhow::Result<()> {
    let names: Vec<String> = (0..40).map(|i| format!("f{}", i)).collect();
    let ty = TypeDesc::flags(names);
    assert_eq!(ty.size(), 8);
    assert_eq!(ty.flat_types(), &[FlatType::I32, FlatType::I32]);

    let cx = context(Encoding::Utf8)?;
    let memory = cx.memory()?;
    let mut flat = Vec::new();
    ty.lower_flat(&mut flat, &memory, &Value::WideFlags(vec![1, 1 << 7]), &cx)?;
    assert_eq!(flat, vec![FlatValue::I32(1), FlatValue::I32(1 << 7)]);
    Ok(())
}

#[test]
fn test_strict_bool() -> anyhow::Result<()> {
    let cx = context(Encoding::Utf8)?;
    let memory = cx.memory()?;
    let err = TypeDesc::BOOL
        .lift_flat(&memory, &mut vec![FlatValue::I32(2)].into_iter(), &cx)
        .unwrap_err();
    assert!(matches!(err, Trap::InvalidBool(2)));
    Ok(())
}

#[test]
fn test_enum_index_out_of_range() -> anyhow::Result<()> {
    let cx = context(Encoding::Utf8)?;
    let memory = cx.memory()?;
    let ty = TypeDesc::enumeration(["red", "green", "blue"])?;
    assert_eq!(ty.size(), 1);
    let lifted = ty.lift_flat(&memory, &mut vec![FlatValue::I32(2)].into_iter(), &cx)?;
    assert_eq!(lifted, Value::Enum("blue".to_string()));
    assert!(ty.lift_flat(&memory, &mut vec![FlatValue::I32(3)].into_iter(), &cx).is_err());
    Ok(())
}

#[test]
fn test_list_of_records_is_copied_deeply() -> anyhow::Result<()> {
    let cx = context(Encoding::Utf8)?;
    let src = cx.memory()?;
    let dest = Memory::new(BumpMemory::new())?;
    let ty = TypeDesc::list(TypeDesc::record([("name", TypeDesc::String), ("age", TypeDesc::U8)]));
    let value = Value::List(vec![
        Value::record([("name", Value::from("ada")), ("age", Value::U8(36))]),
        Value::record([("name", Value::from("alan")), ("age", Value::U8(41))]),
    ]);

    let mut flat = Vec::new();
    ty.lower_flat(&mut flat, &src, &value, &cx)?;
    let mut copied = Vec::new();
    ty.copy_flat(&mut copied, &dest, &mut flat.into_iter(), &src, &cx)?;
    assert_eq!(ty.lift_flat(&dest, &mut copied.into_iter(), &cx)?, value);
    Ok(())
}
