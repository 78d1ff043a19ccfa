//! Whole calls through the bindings: spilled parameters, results returned
//! through memory, declared errors and modules bound against a service.

use std::sync::Arc;

use wit_bridge::abi::{BumpMemory, FlatValue, LinearMemory, Memory, MemoryView, RawMemory, TypeDesc, Value};
use wit_bridge::bind::{InterfaceDesc, InterfaceService, Service, ServiceFunction, WorldDesc, bind_module, imports};
use wit_bridge::callable::WasmFunction;
use wit_bridge::module::{Exports, Imports};
use wit_bridge::{Callable, Error, Options, Platform, WasmContext};

const FS: &str = "test:calls/fs";

fn context() -> anyhow::Result<Arc<WasmContext>> {
    let memory = Memory::new(BumpMemory::new())?;
    Ok(Arc::new(WasmContext::with_memory(Options::default(), Arc::new(Platform::default()), memory)))
}

fn sum_params() -> Vec<(String, TypeDesc)> {
    (0..17).map(|i| (format!("p{}", i), TypeDesc::U32)).collect()
}

fn world() -> WorldDesc {
    let mut fs = InterfaceDesc::new("test:calls", "fs");
    fs.add_function(Callable::function(
        "open",
        vec![("path".to_string(), TypeDesc::String)],
        Some(TypeDesc::result_with_error_class(Some(TypeDesc::U32), Some(TypeDesc::String), "fs-error")),
    ));
    WorldDesc::new("calls")
        .import_function(Callable::function("sum", sum_params(), Some(TypeDesc::U32)))
        .import_function(Callable::function(
            "describe",
            vec![("id".to_string(), TypeDesc::U32)],
            Some(TypeDesc::String),
        ))
        .import_interface(fs)
}

fn service() -> Service {
    let sum = ServiceFunction::sync(|params: Vec<Value>| -> Result<Option<Value>, Error> {
        let mut total = 0u32;
        for param in params {
            match param {
                Value::U32(n) => total += n,
                other => return Err(Error::service(format!("not a u32: {:?}", other))),
            }
        }
        Ok(Some(Value::U32(total)))
    });
    let describe = ServiceFunction::sync(|params: Vec<Value>| -> Result<Option<Value>, Error> {
        match params.as_slice() {
            [Value::U32(id)] => Ok(Some(Value::String(format!("item {}", id)))),
            _ => Err(Error::service("describe takes an id")),
        }
    });
    let open = ServiceFunction::sync(|params: Vec<Value>| -> Result<Option<Value>, Error> {
        match params.first().and_then(Value::as_str) {
            Some("/missing") => Err(Error::declared("fs-error", Some(Value::from("no such file")))),
            Some("/crash") => Err(Error::service("disk on fire")),
            Some(_) => Ok(Some(Value::U32(3))),
            None => Err(Error::service("open takes a path")),
        }
    });
    Service::new()
        .with_root_function("sum", sum)
        .with_root_function("describe", describe)
        .with_interface(FS, InterfaceService::new().with_function("open", open))
}

#[test]
fn test_seventeen_params_are_spilled_and_summed() -> anyhow::Result<()> {
    let cx = context()?;
    let bound = imports::looped(&world(), &service(), &cx)?;
    let params: Vec<Value> = (1..=17).map(Value::U32).collect();
    assert_eq!(bound.root().call("sum", &params)?, Some(Value::U32(153)));
    Ok(())
}

#[test]
fn test_import_writes_string_through_out_pointer() -> anyhow::Result<()> {
    let cx = context()?;
    let memory = cx.memory()?;
    let imports = imports::create(&world(), &service(), &cx)?;
    let describe = imports
        .get("$root")
        .and_then(|root| root.get("describe"))
        .ok_or_else(|| anyhow::anyhow!("missing describe"))?;

    let out = memory.alloc(4, 8)?;
    assert_eq!(describe(&[FlatValue::I32(7), FlatValue::I32(out.ptr())])?, None);

    let stored = TypeDesc::String.load_at(&memory, out.ptr(), &cx)?;
    assert_eq!(stored.as_str(), Some("item 7"));
    Ok(())
}

#[test]
fn test_string_result_returned_by_pointer() -> anyhow::Result<()> {
    let cx = context()?;
    let bound = imports::looped(&world(), &service(), &cx)?;
    let described = bound.root().call("describe", &[Value::U32(42)])?;
    assert_eq!(described, Some(Value::from("item 42")));
    Ok(())
}

#[test]
fn test_declared_errors_cross_as_result_cases() -> anyhow::Result<()> {
    let cx = context()?;
    let bound = imports::looped(&world(), &service(), &cx)?;
    let fs = bound.interface(FS).ok_or_else(|| anyhow::anyhow!("missing interface"))?;

    assert_eq!(fs.call("open", &[Value::from("/etc/hosts")])?, Some(Value::U32(3)));

    let err = fs.call("open", &[Value::from("/missing")]).err().ok_or_else(|| anyhow::anyhow!("open succeeded"))?;
    let declared = err.as_declared("fs-error").ok_or_else(|| anyhow::anyhow!("not declared: {}", err))?;
    assert_eq!(declared.value, Some(Value::from("no such file")));

    let err = fs.call("open", &[Value::from("/crash")]).err().ok_or_else(|| anyhow::anyhow!("open succeeded"))?;
    assert!(!err.is_declared());
    Ok(())
}

/// A module exporting `count-chars(s: string) -> u32` and allocating from
/// its own memory.
fn counting_module(imports: &Imports) -> Result<Exports, Error> {
    assert!(imports.is_empty());
    let allocator = Arc::new(BumpMemory::new());
    let buffer: LinearMemory = allocator.buffer().clone();
    let realloc: WasmFunction = Arc::new(move |args: &[FlatValue]| -> Result<Option<FlatValue>, Error> {
        match args {
            [FlatValue::I32(old_ptr), FlatValue::I32(old_size), FlatValue::I32(align), FlatValue::I32(new_size)] => {
                Ok(Some(FlatValue::I32(allocator.realloc(*old_ptr, *old_size, *align, *new_size)?)))
            }
            _ => Err(Error::service("bad realloc arguments")),
        }
    });
    let memory = buffer.clone();
    let count: WasmFunction = Arc::new(move |args: &[FlatValue]| -> Result<Option<FlatValue>, Error> {
        let [FlatValue::I32(ptr), FlatValue::I32(len)] = args else {
            return Err(Error::service("count-chars takes a string"));
        };
        let mut bytes = vec![0u8; *len as usize];
        memory.read(*ptr, &mut bytes)?;
        let text = String::from_utf8(bytes).map_err(|e| Error::service(e.to_string()))?;
        Ok(Some(FlatValue::I32(text.chars().count() as u32)))
    });
    Ok(Exports::new()
        .with_memory("memory", buffer)
        .with_function("cabi_realloc", realloc)
        .with_function("count-chars", count))
}

#[test]
fn test_bound_module_reads_arguments_from_its_memory() -> anyhow::Result<()> {
    let world = WorldDesc::new("counter").export_function(Callable::function(
        "count-chars",
        vec![("s".to_string(), TypeDesc::String)],
        Some(TypeDesc::U32),
    ));
    let cx = Arc::new(WasmContext::new(Options::default(), Arc::new(Platform::default())));
    assert!(cx.memory().is_err());

    let bound = bind_module(&world, &Service::new(), &counting_module, &cx)?;
    assert!(cx.memory().is_ok());
    assert_eq!(bound.root().call("count-chars", &[Value::from("naïve")])?, Some(Value::U32(5)));
    Ok(())
}
