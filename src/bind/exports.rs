//! Host-side access to a module's exports.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use super::{InterfaceDesc, ResourceDesc, WorldDesc};
use crate::abi::{FlatValue, Value};
use crate::callable::{Callable, CallableKind, WasmFunction};
use crate::context::{InitError, WasmContext};
use crate::error::Error;
use crate::logging::debug;
use crate::module::Exports;
use crate::resource::{Resource, ResourceManager, ResourceRef};

/// An exported function bound to its module.
#[derive(Clone)]
pub struct BoundFunction {
    callable: Arc<Callable>,
    func: WasmFunction,
    cx: Arc<WasmContext>,
}

impl fmt::Debug for BoundFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundFunction").field("name", &self.callable.wit_name()).finish()
    }
}

impl BoundFunction {
    pub fn callable(&self) -> &Arc<Callable> {
        &self.callable
    }

    pub fn call(&self, params: &[Value]) -> Result<Option<Value>, Error> {
        self.callable.call_wasm(&self.func, params, &self.cx)
    }
}

type Methods = BTreeMap<String, (Arc<Callable>, WasmFunction)>;

/// Host proxy for a representation living in the module.
struct ExportedObject {
    resource: String,
    rep: u32,
    methods: Arc<Methods>,
    cx: Weak<WasmContext>,
}

impl Resource for ExportedObject {
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Option<Value>, Error> {
        let (callable, func) = self.methods.get(method).ok_or_else(|| crate::abi::Trap::MethodNotFound {
            method: method.to_string(),
            resource: self.resource.clone(),
        })?;
        let cx = self.cx.upgrade().ok_or(InitError::MemoryNotInitialized)?;
        callable.call_wasm_method(func, self.rep, &params, &cx)
    }
}

/// An exported resource: constructs proxies and calls static methods.
/// Methods are called on the [`ResourceRef`]s it hands out.
pub struct BoundResource {
    desc: ResourceDesc,
    manager: Arc<ResourceManager>,
    constructor: Option<(Arc<Callable>, WasmFunction)>,
    statics: Methods,
    cx: Arc<WasmContext>,
}

impl fmt::Debug for BoundResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundResource")
            .field("resource", &self.desc.id())
            .field("statics", &self.statics.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BoundResource {
    pub fn manager(&self) -> &Arc<ResourceManager> {
        &self.manager
    }

    /// Run the module's constructor and return the proxy for the new handle.
    pub fn construct(&self, params: &[Value]) -> Result<ResourceRef, Error> {
        let (callable, func) = self
            .constructor
            .as_ref()
            .ok_or_else(|| Error::service(format!("resource '{}' has no constructor", self.desc.wit_name())))?;
        let handle = callable.call_wasm_constructor(func, params, &self.cx)?;
        debug!(resource = self.desc.id(), handle, "constructed exported resource");
        Ok(self.manager.get_resource(handle)?)
    }

    pub fn call_static(&self, name: &str, params: &[Value]) -> Result<Option<Value>, Error> {
        let (callable, func) = self
            .statics
            .get(name)
            .ok_or_else(|| Error::service(format!("resource '{}' has no static method '{}'", self.desc.wit_name(), name)))?;
        callable.call_wasm(func, params, &self.cx)
    }

    /// Release a proxy handed out by this resource, running the module's
    /// destructor.
    pub fn release(&self, resource: ResourceRef) -> Result<(), Error> {
        let released = self.manager.release(resource.handle());
        drop(resource);
        released
    }
}

/// The functions and resources of one interface or of the world root.
#[derive(Debug, Default)]
pub struct BoundInterface {
    functions: BTreeMap<String, BoundFunction>,
    resources: BTreeMap<String, BoundResource>,
}

impl BoundInterface {
    pub fn function(&self, name: &str) -> Option<&BoundFunction> {
        self.functions.get(name)
    }

    pub fn resource(&self, name: &str) -> Option<&BoundResource> {
        self.resources.get(name)
    }

    /// Call the function `name`.
    pub fn call(&self, name: &str, params: &[Value]) -> Result<Option<Value>, Error> {
        self.function(name)
            .ok_or_else(|| Error::service(format!("no exported function '{}'", name)))?
            .call(params)
    }
}

/// Everything a world exports, bound to one module instance.
#[derive(Debug, Default)]
pub struct BoundWorld {
    root: BoundInterface,
    interfaces: BTreeMap<String, BoundInterface>,
}

impl BoundWorld {
    pub fn root(&self) -> &BoundInterface {
        &self.root
    }

    /// The interface `pkg:ns/iface`.
    pub fn interface(&self, qualifier: &str) -> Option<&BoundInterface> {
        self.interfaces.get(qualifier)
    }
}

fn lookup(exports: &Exports, name: &str) -> Result<WasmFunction, Error> {
    Ok(exports.function(name)?)
}

fn bind_resource(resource: &ResourceDesc, qualifier: &str, exports: &Exports, cx: &Arc<WasmContext>) -> Result<BoundResource, Error> {
    let manager = cx.resources().get_or_create(resource.id());
    let mut methods = Methods::new();
    let mut statics = Methods::new();
    let mut constructor = None;
    for callable in resource.callables() {
        let export_name = format!("{}#{}", qualifier, callable.wit_name());
        match callable.kind() {
            CallableKind::Constructor => constructor = Some((callable.clone(), lookup(exports, &export_name)?)),
            CallableKind::Method => {
                methods.insert(callable.member_name().to_string(), (callable.clone(), lookup(exports, &export_name)?));
            }
            CallableKind::StaticMethod => {
                statics.insert(callable.member_name().to_string(), (callable.clone(), lookup(exports, &export_name)?));
            }
            CallableKind::Destructor | CallableKind::Function => {}
        }
    }

    let methods = Arc::new(methods);
    let weak_cx = Arc::downgrade(cx);
    let name = resource.wit_name().to_string();
    let ctor = Arc::new(move |_handle: u32, rep: u32| -> Arc<dyn Resource> {
        Arc::new(ExportedObject {
            resource: name.clone(),
            rep,
            methods: methods.clone(),
            cx: weak_cx.clone(),
        })
    });
    let dtor_export = exports.function(&format!("{}#{}", qualifier, resource.dtor_name())).ok();
    let dtor = Arc::new(move |rep: u32| -> Result<(), Error> {
        match &dtor_export {
            Some(func) => func(&[FlatValue::I32(rep)]).map(|_| ()),
            None => Ok(()),
        }
    });
    manager.set_proxy_info(ctor, dtor);

    Ok(BoundResource {
        desc: resource.clone(),
        manager,
        constructor,
        statics,
        cx: cx.clone(),
    })
}

fn bind_interface(interface: &InterfaceDesc, exports: &Exports, cx: &Arc<WasmContext>) -> Result<BoundInterface, Error> {
    let qualifier = interface.qualifier();
    let mut bound = BoundInterface::default();
    for callable in interface.functions() {
        let func = lookup(exports, &format!("{}#{}", qualifier, callable.wit_name()))?;
        bound.functions.insert(
            callable.wit_name().to_string(),
            BoundFunction {
                callable: callable.clone(),
                func,
                cx: cx.clone(),
            },
        );
    }
    for resource in interface.resources() {
        bound
            .resources
            .insert(resource.wit_name().to_string(), bind_resource(resource, &qualifier, exports, cx)?);
    }
    Ok(bound)
}

/// Bind `world`'s exports to the instance `exports`.
///
/// Root functions are exported under their own names, interface members as
/// `pkg:ns/iface#name`. Each exported resource's manager learns how to
/// build proxies and how to destroy a representation through `[dtor]r`.
pub fn bind(world: &WorldDesc, exports: &Exports, cx: &Arc<WasmContext>) -> Result<BoundWorld, Error> {
    let mut bound = BoundWorld::default();
    for callable in world.export_functions() {
        let func = lookup(exports, callable.wit_name())?;
        bound.root.functions.insert(
            callable.wit_name().to_string(),
            BoundFunction {
                callable: callable.clone(),
                func,
                cx: cx.clone(),
            },
        );
    }
    for interface in world.exports() {
        bound.interfaces.insert(interface.qualifier(), bind_interface(interface, exports, cx)?);
    }
    Ok(bound)
}
