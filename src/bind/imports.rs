//! Module imports backed by a host service.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{InterfaceDesc, InterfaceService, ROOT, ResourceDesc, Service, WorldDesc, exports, missing};
use crate::abi::{FlatValue, Trap};
use crate::callable::kinds::handle_param;
use crate::callable::{Callable, CallableKind, WasmFunction};
use crate::context::WasmContext;
use crate::error::Error;
use crate::logging::debug;
use crate::module::{Exports, Imports};
use crate::resource::ResourceManager;

fn service_import(callable: &Arc<Callable>, service: &InterfaceService, cx: &Arc<WasmContext>) -> Result<WasmFunction, Error> {
    let func = service
        .function(callable.wit_name())
        .ok_or_else(|| missing("function", callable.wit_name()))?
        .as_sync(callable.wit_name())?;
    let callable = callable.clone();
    let cx = cx.clone();
    Ok(Arc::new(move |params: &[FlatValue]| {
        let memory = cx.memory()?;
        callable.call_service(&func, params, &memory, &cx)
    }))
}

fn resource_import(
    callable: &Arc<Callable>,
    resource: &ResourceDesc,
    service: &InterfaceService,
    manager: &Arc<ResourceManager>,
    cx: &Arc<WasmContext>,
) -> Result<WasmFunction, Error> {
    let resource_service = service.resource(resource.wit_name());
    let target = callable.clone();
    let manager = manager.clone();
    let cx = cx.clone();
    let import: WasmFunction = match callable.kind() {
        CallableKind::Constructor => {
            let ctor = resource_service
                .and_then(|r| r.constructor())
                .ok_or_else(|| missing("constructor for", resource.wit_name()))?
                .clone();
            Arc::new(move |params: &[FlatValue]| {
                let memory = cx.memory()?;
                target.call_constructor(&ctor, &manager, params, &memory, &cx)
            })
        }
        CallableKind::StaticMethod => {
            let func = resource_service
                .and_then(|r| r.static_method(callable.member_name()))
                .ok_or_else(|| missing("static method", callable.wit_name()))?
                .as_sync(callable.wit_name())?;
            Arc::new(move |params: &[FlatValue]| {
                let memory = cx.memory()?;
                target.call_service(&func, params, &memory, &cx)
            })
        }
        CallableKind::Method => Arc::new(move |params: &[FlatValue]| {
            let memory = cx.memory()?;
            target.call_method(&manager, params, &memory, &cx)
        }),
        CallableKind::Destructor => Arc::new(move |params: &[FlatValue]| target.call_destructor(&manager, params)),
        CallableKind::Function => return Err(Trap::convention(format!("'{}' is not a resource member", callable.wit_name())).into()),
    };
    Ok(import)
}

fn interface_imports(interface: &InterfaceDesc, service: &InterfaceService, cx: &Arc<WasmContext>) -> Result<BTreeMap<String, WasmFunction>, Error> {
    let mut functions = BTreeMap::new();
    for callable in interface.functions() {
        functions.insert(callable.wit_name().to_string(), service_import(callable, service, cx)?);
    }
    for resource in interface.resources() {
        let manager = cx.resources().get_or_create(resource.id());
        for callable in resource.callables() {
            functions.insert(
                callable.wit_name().to_string(),
                resource_import(callable, resource, service, &manager, cx)?,
            );
        }
    }
    Ok(functions)
}

/// `[resource-new]`, `[resource-rep]` and `[resource-drop]` for the
/// resources a module exports, under `[export]pkg:ns/iface`.
pub(crate) fn export_intrinsics(interface: &InterfaceDesc, cx: &WasmContext) -> BTreeMap<String, WasmFunction> {
    let mut functions: BTreeMap<String, WasmFunction> = BTreeMap::new();
    for resource in interface.resources() {
        let manager = cx.resources().get_or_create(resource.id());
        let name = resource.wit_name();

        let new_manager = manager.clone();
        functions.insert(
            format!("[resource-new]{}", name),
            Arc::new(move |params: &[FlatValue]| -> Result<Option<FlatValue>, Error> {
                let (rep, _) = handle_param(params)?;
                Ok(Some(FlatValue::I32(new_manager.new_handle(rep)?)))
            }),
        );
        let rep_manager = manager.clone();
        functions.insert(
            format!("[resource-rep]{}", name),
            Arc::new(move |params: &[FlatValue]| -> Result<Option<FlatValue>, Error> {
                let (handle, _) = handle_param(params)?;
                Ok(Some(FlatValue::I32(rep_manager.get_representation(handle)?)))
            }),
        );
        functions.insert(
            format!("[resource-drop]{}", name),
            Arc::new(move |params: &[FlatValue]| -> Result<Option<FlatValue>, Error> {
                let (handle, _) = handle_param(params)?;
                manager.drop_handle(handle)?;
                Ok(None)
            }),
        );
    }
    functions
}

/// Build the imports of `world` from `service`.
///
/// Every imported function, constructor, method, static method and
/// destructor becomes a flat function calling into the service. Exported
/// resources additionally get their handle intrinsics.
pub fn create(world: &WorldDesc, service: &Service, cx: &Arc<WasmContext>) -> Result<Imports, Error> {
    let mut imports = Imports::new();
    if !world.import_functions().is_empty() {
        let mut root = BTreeMap::new();
        for callable in world.import_functions() {
            root.insert(callable.wit_name().to_string(), service_import(callable, service.root(), cx)?);
        }
        imports.insert(ROOT.to_string(), root);
    }
    for interface in world.imports() {
        let qualifier = interface.qualifier();
        let iface_service = service
            .interface(&qualifier)
            .ok_or_else(|| missing("interface", &qualifier))?;
        debug!(interface = %qualifier, "creating imports");
        imports.insert(qualifier, interface_imports(interface, iface_service, cx)?);
    }
    for interface in world.exports() {
        let intrinsics = export_intrinsics(interface, cx);
        if !intrinsics.is_empty() {
            imports.insert(format!("[export]{}", interface.qualifier()), intrinsics);
        }
    }
    Ok(imports)
}

/// Turn the imports of one interface into exports of the swapped world.
///
/// A constructed handle is given a loop identity so the proxy bound on the
/// other side has a representation of its own; methods and destructors map
/// that representation back to the original handle.
fn loop_exports(interface: &InterfaceDesc, functions: &BTreeMap<String, WasmFunction>, cx: &WasmContext, exports: &mut Exports) -> Result<(), Error> {
    let qualifier = interface.qualifier();
    for callable in interface.functions() {
        if let Some(func) = functions.get(callable.wit_name()) {
            exports.insert_function(format!("{}#{}", qualifier, callable.wit_name()), func.clone());
        }
    }
    for resource in interface.resources() {
        let manager = cx.resources().ensure(resource.id())?;
        for callable in resource.callables() {
            let Some(func) = functions.get(callable.wit_name()).cloned() else {
                continue;
            };
            let manager = manager.clone();
            let name = match callable.kind() {
                CallableKind::Destructor => resource.dtor_name(),
                _ => callable.wit_name().to_string(),
            };
            let looped: WasmFunction = match callable.kind() {
                CallableKind::Constructor => Arc::new(move |params: &[FlatValue]| -> Result<Option<FlatValue>, Error> {
                    let handle = func(params)?.ok_or(Trap::MissingFlatValue)?.as_i32()?;
                    Ok(Some(FlatValue::I32(manager.register_loop(handle)?)))
                }),
                CallableKind::Method => Arc::new(move |params: &[FlatValue]| {
                    let (rep, rest) = handle_param(params)?;
                    let mut flat = vec![FlatValue::I32(manager.get_loop(rep)?)];
                    flat.extend_from_slice(rest);
                    func(&flat)
                }),
                CallableKind::Destructor => Arc::new(move |params: &[FlatValue]| {
                    let (rep, _) = handle_param(params)?;
                    func(&[FlatValue::I32(manager.get_loop(rep)?)])
                }),
                CallableKind::StaticMethod | CallableKind::Function => func,
            };
            exports.insert_function(format!("{}#{}", qualifier, name), looped);
        }
    }
    Ok(())
}

/// Serve `world`'s imports with `service` and bind them as if a module had
/// exported them. Every call goes through the full lower and lift path.
/// `cx` must already have a memory.
pub fn looped(world: &WorldDesc, service: &Service, cx: &Arc<WasmContext>) -> Result<exports::BoundWorld, Error> {
    let imports = create(world, service, cx)?;
    let mut as_exports = Exports::new();
    if let Some(root) = imports.get(ROOT) {
        for (name, func) in root {
            as_exports.insert_function(name.clone(), func.clone());
        }
    }
    for interface in world.imports() {
        if let Some(functions) = imports.get(&interface.qualifier()) {
            loop_exports(interface, functions, cx, &mut as_exports)?;
        }
    }
    exports::bind(&world.swapped(), &as_exports, cx)
}
