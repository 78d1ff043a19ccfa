//! Type descriptors built from WIT source.
#![cfg(feature = "wit")]

use std::sync::Arc;

use wit_bridge::abi::{BumpMemory, FlatType, Memory, TypeDesc, TypeKind, Value};
use wit_bridge::bind::InterfaceDesc;
use wit_bridge::wit::{TypeBuilder, WitTypeError, find_type_by_name, load_wit_type_from_string};
use wit_bridge::{Error, Options, Platform, WasmContext};

const INVENTORY: &str = r#"
    package shop:inventory;

    interface items {
        enum measure { piece, kilo, litre }
        flags labels { fragile, cold, bulky }
        record item {
            name: string,
            quantity: u32,
            unit: measure,
            tags: labels,
            price: option<f64>,
        }
        variant lookup { found(item), missing(string), pending }
        type stock = list<item>;
        type position = tuple<f32, f32, f32>;
        type fetch = result<item, string>;
    }
"#;

const SHELVES: &str = r#"
    package shop:inventory;

    interface items {
        resource shelf;
        record placement { rack: borrow<shelf>, slot: u16 }
        record moved { rack: own<shelf>, origin: u16 }
    }
"#;

const STREAMING: &str = r#"
    package shop:inventory;

    interface items {
        type later = future<u32>;
        type feed = stream<u8>;
    }
"#;

fn load(name: &str) -> anyhow::Result<TypeDesc> {
    let (_, _, desc) = load_wit_type_from_string(INVENTORY, Some(name))?;
    Ok(desc)
}

#[test]
fn test_record_with_nested_types() -> anyhow::Result<()> {
    let item = load("item")?;
    assert_eq!(item.kind(), TypeKind::Record);
    // string(8) u32(4) enum(1) flags(1) pad option<f64>(16)
    assert_eq!(item.alignment(), 8);
    assert_eq!(item.size(), 32);
    assert_eq!(
        item.flat_types(),
        &[FlatType::I32, FlatType::I32, FlatType::I32, FlatType::I32, FlatType::I32, FlatType::I32, FlatType::F64]
    );

    let cx = WasmContext::with_memory(Options::default(), Arc::new(Platform::default()), Memory::new(BumpMemory::new())?);
    let memory = cx.memory()?;
    let value = Value::record([
        ("name", Value::from("milk")),
        ("quantity", Value::U32(2)),
        ("unit", Value::Enum("litre".to_string())),
        ("tags", Value::Flags(0b010)),
        ("price", Value::some(Value::F64(1.25))),
    ]);
    let range = item.alloc(&memory)?;
    item.store(&range, 0, &value, &cx)?;
    assert_eq!(item.load(&range.as_readonly(), 0, &cx)?, value);
    Ok(())
}

#[test]
fn test_variant_and_result_layouts() -> anyhow::Result<()> {
    let lookup = load("lookup")?;
    assert_eq!(lookup.kind(), TypeKind::Variant);
    assert_eq!(lookup.size(), 40);

    let fetch = load("fetch")?;
    assert_eq!(fetch.kind(), TypeKind::Result);
    assert_eq!(fetch.flat_types().len(), 1 + load("item")?.flat_types().len());
    Ok(())
}

#[test]
fn test_aliases_resolve_to_their_target() -> anyhow::Result<()> {
    let stock = load("stock")?;
    assert_eq!(stock.kind(), TypeKind::List);
    assert_eq!(stock.size(), 8);

    let position = load("position")?;
    assert_eq!(position.kind(), TypeKind::Tuple);
    assert_eq!(position.size(), 12);
    assert_eq!(position.flat_types(), &[FlatType::F32, FlatType::F32, FlatType::F32]);
    Ok(())
}

#[test]
fn test_handles_share_the_resource_of_their_interface() -> anyhow::Result<()> {
    let (resolve, placement_id, placement) = load_wit_type_from_string(SHELVES, Some("placement"))?;
    assert_eq!(placement.flat_types(), &[FlatType::I32, FlatType::I32]);

    let mut builder = TypeBuilder::new(&resolve);
    let shelf = find_type_by_name(&resolve, "shelf").ok_or_else(|| anyhow::anyhow!("no shelf"))?;
    let resource = builder.resource_type(shelf)?;
    assert_eq!(resource.id(), InterfaceDesc::new("shop:inventory", "items").resource_id("shelf"));

    let TypeDesc::Record(placement) = builder.build_id(placement_id)? else {
        anyhow::bail!("placement is not a record");
    };
    let moved_id = find_type_by_name(&resolve, "moved").ok_or_else(|| anyhow::anyhow!("no moved"))?;
    let TypeDesc::Record(moved) = builder.build_id(moved_id)? else {
        anyhow::bail!("moved is not a record");
    };
    let borrowed = placement.fields().first().map(|field| field.ty.kind());
    let owned = moved.fields().first().map(|field| field.ty.kind());
    assert_eq!(borrowed, Some(TypeKind::Borrow));
    assert_eq!(owned, Some(TypeKind::Own));
    Ok(())
}

#[test]
fn test_async_types_are_rejected() {
    for name in ["later", "feed"] {
        let err = load_wit_type_from_string(STREAMING, Some(name)).err();
        assert!(
            matches!(err, Some(Error::WitType(WitTypeError::Unsupported(_)))),
            "{} should be unsupported, got {:?}",
            name,
            err
        );
    }
}

#[test]
fn test_invalid_wit_is_reported() {
    let err = load_wit_type_from_string("package broken;\ninterface {", None).err();
    assert!(err.is_some());
}
