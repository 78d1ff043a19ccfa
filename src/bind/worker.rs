//! Worker-side wiring: imports relayed to main, exports served for main.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use super::{InterfaceDesc, ROOT, WorldDesc};
use crate::abi::{FlatType, FlatValue, Memory};
use crate::bridge::{ProtocolError, WorkerConnection, WorkerHandler};
use crate::callable::remote::qualified_name;
use crate::callable::{Callable, CallableKind, WasmFunction};
use crate::context::{InitError, Options, WasmContext};
use crate::error::Error;
use crate::logging::info;
use crate::module::{Exports, Imports, Module, ModuleMemory};

fn upgrade(connection: &Weak<WorkerConnection>) -> Result<Arc<WorkerConnection>, Error> {
    connection.upgrade().ok_or_else(|| ProtocolError::ChannelClosed.into())
}

fn relay(callable: &Arc<Callable>, qualifier: &str, connection: &Arc<WorkerConnection>, cx: &Arc<WasmContext>) -> WasmFunction {
    let callable = callable.clone();
    let qualifier = qualifier.to_string();
    let connection = Arc::downgrade(connection);
    let cx = cx.clone();
    Arc::new(move |params: &[FlatValue]| {
        let connection = upgrade(&connection)?;
        callable.call_main(&connection, &qualifier, params, &cx)
    })
}

fn relay_intrinsic(name: String, returns: bool, connection: &Arc<WorkerConnection>) -> WasmFunction {
    let connection = Arc::downgrade(connection);
    Arc::new(move |params: &[FlatValue]| -> Result<Option<FlatValue>, Error> {
        let connection = upgrade(&connection)?;
        connection.prepare_call();
        let result_type = returns.then_some(FlatType::I32);
        Ok(connection.call_main(&name, params.to_vec(), result_type)?)
    })
}

/// Imports for a module running in the worker. Every call is relayed to the
/// handler main registered under `pkg:ns/iface#name`. Exported resource
/// intrinsics are relayed under `[export]pkg:ns/iface#[resource-new]r` and
/// friends, since main owns their handle tables.
pub fn create_imports(connection: &Arc<WorkerConnection>, world: &WorldDesc, cx: &Arc<WasmContext>) -> Imports {
    let mut imports = Imports::new();
    if !world.import_functions().is_empty() {
        let root = world
            .import_functions()
            .iter()
            .map(|callable| (callable.wit_name().to_string(), relay(callable, "", connection, cx)))
            .collect();
        imports.insert(ROOT.to_string(), root);
    }
    for interface in world.imports() {
        let qualifier = interface.qualifier();
        let mut functions = BTreeMap::new();
        for callable in interface.functions() {
            functions.insert(callable.wit_name().to_string(), relay(callable, &qualifier, connection, cx));
        }
        for resource in interface.resources() {
            for callable in resource.callables() {
                functions.insert(callable.wit_name().to_string(), relay(callable, &qualifier, connection, cx));
            }
        }
        imports.insert(qualifier, functions);
    }
    for interface in world.exports() {
        let module = format!("[export]{}", interface.qualifier());
        let mut functions = BTreeMap::new();
        for resource in interface.resources() {
            for (intrinsic, returns) in [("resource-new", true), ("resource-rep", true), ("resource-drop", false)] {
                let name = format!("[{}]{}", intrinsic, resource.wit_name());
                let relayed = relay_intrinsic(format!("{}#{}", module, name), returns, connection);
                functions.insert(name, relayed);
            }
        }
        if !functions.is_empty() {
            imports.insert(module, functions);
        }
    }
    imports
}

fn serve(callable: &Arc<Callable>, func: WasmFunction, cx: &Arc<WasmContext>) -> WorkerHandler {
    let callable = callable.clone();
    let cx = cx.clone();
    if callable.kind() == CallableKind::Method {
        return Arc::new(move |transfer: &Memory, params: &[FlatValue]| callable.call_wasm_method_from_worker(transfer, &func, params, &cx));
    }
    Arc::new(move |transfer: &Memory, params: &[FlatValue]| callable.call_wasm_from_worker(transfer, &func, params, &cx))
}

fn bind_interface_exports(connection: &WorkerConnection, interface: &InterfaceDesc, exports: &Exports, cx: &Arc<WasmContext>) -> Result<(), Error> {
    let qualifier = interface.qualifier();
    for callable in interface.functions() {
        let name = qualified_name(&qualifier, callable.wit_name());
        connection.on(name.clone(), serve(callable, exports.function(&name)?, cx));
    }
    for resource in interface.resources() {
        for callable in resource.callables() {
            let (name, callable) = match callable.kind() {
                CallableKind::Destructor => {
                    let dtor = Arc::new(Callable::destructor(resource.dtor_name()));
                    (qualified_name(&qualifier, &resource.dtor_name()), dtor)
                }
                _ => (qualified_name(&qualifier, callable.wit_name()), callable.clone()),
            };
            let Ok(func) = exports.function(&name) else {
                if callable.kind() == CallableKind::Destructor {
                    continue;
                }
                return Err(InitError::MissingExport(name).into());
            };
            connection.on(name, serve(&callable, func, cx));
        }
    }
    Ok(())
}

/// Register handlers so main can call the module's exports.
pub fn bind_exports(connection: &WorkerConnection, world: &WorldDesc, exports: &Exports, cx: &Arc<WasmContext>) -> Result<(), Error> {
    for callable in world.export_functions() {
        let func = exports.function(callable.wit_name())?;
        connection.on(callable.wit_name(), serve(callable, func, cx));
    }
    for interface in world.exports() {
        bind_interface_exports(connection, interface, exports, cx)?;
    }
    Ok(())
}

/// Instantiate `module` when main initializes the worker: build the relayed
/// imports, attach the module memory to a context using main's options and
/// serve the exports.
pub fn initialize(connection: &Arc<WorkerConnection>, module: Arc<dyn Module>, world: WorldDesc) {
    let weak: Weak<WorkerConnection> = Arc::downgrade(connection);
    connection.on_initialize(Arc::new(move |options: Options| -> Result<(), Error> {
        let connection = upgrade(&weak)?;
        info!(world = world.name(), encoding = options.encoding.name(), "instantiating module in worker");
        let cx = Arc::new(WasmContext::new(options, connection.platform().clone()));
        let imports = create_imports(&connection, &world, &cx);
        let instance = module.instantiate(&imports)?;
        cx.initialize(ModuleMemory::from_exports(&instance)?.into_memory()?)?;
        bind_exports(&connection, &world, &instance, &cx)
    }));
}
