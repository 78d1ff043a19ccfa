//! Wiring a world's functions and resources to a module and a host service.
//!
//! # Module Organization
//!
//! - [`imports`]: host implementations turned into module imports
//! - [`exports`]: module exports turned into host-callable functions and
//!   resource classes
//! - [`worker`] / [`main`]: the same wiring across a bridge connection
//!
//! Names follow the component conventions: an interface `pkg:ns/iface`
//! provides its functions under the import module `pkg:ns/iface`, exports
//! are named `pkg:ns/iface#name`, and resource members are named
//! `[constructor]r`, `[method]r.name`, `[static]r.name` and
//! `[resource-drop]r`.

pub mod exports;
pub mod imports;
#[cfg(feature = "bridge")]
pub mod main;
#[cfg(feature = "bridge")]
pub mod worker;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::abi::TypeDesc;
use crate::abi::types::ResourceType;
use crate::callable::kinds::ConstructorFn;
use crate::callable::{AsyncHostFunction, Callable, HostFunction};
use crate::context::WasmContext;
use crate::error::Error;
use crate::logging::info;
use crate::module::{Module, ModuleMemory};

pub use exports::{BoundFunction, BoundInterface, BoundResource, BoundWorld};
#[cfg(feature = "bridge")]
pub use main::{AsyncBoundFunction, AsyncBoundInterface, AsyncBoundResource, AsyncBoundWorld};

/// Import module name of root-level functions.
pub const ROOT: &str = "$root";

/// A resource type and its members.
#[derive(Debug, Clone)]
pub struct ResourceDesc {
    ty: Arc<ResourceType>,
    callables: BTreeMap<String, Arc<Callable>>,
}

impl ResourceDesc {
    pub fn new(ty: Arc<ResourceType>) -> Self {
        Self {
            ty,
            callables: BTreeMap::new(),
        }
    }

    pub fn wit_name(&self) -> &str {
        self.ty.wit_name()
    }

    pub fn id(&self) -> &str {
        self.ty.id()
    }

    pub fn resource_type(&self) -> &Arc<ResourceType> {
        &self.ty
    }

    /// `own<r>` of this resource.
    pub fn own(&self) -> TypeDesc {
        TypeDesc::Own(self.ty.clone())
    }

    pub fn borrow(&self) -> TypeDesc {
        TypeDesc::Borrow(self.ty.clone())
    }

    fn add(&mut self, callable: Callable) -> &mut Self {
        self.callables.insert(callable.wit_name().to_string(), Arc::new(callable));
        self
    }

    pub fn add_constructor(&mut self, params: Vec<(String, TypeDesc)>) -> &mut Self {
        let callable = Callable::constructor(format!("[constructor]{}", self.wit_name()), params, self.own());
        self.add(callable)
    }

    pub fn add_static_method(&mut self, name: &str, params: Vec<(String, TypeDesc)>, return_type: Option<TypeDesc>) -> &mut Self {
        let callable = Callable::static_method(format!("[static]{}.{}", self.wit_name(), name), params, return_type);
        self.add(callable)
    }

    pub fn add_method(&mut self, name: &str, params: Vec<(String, TypeDesc)>, return_type: Option<TypeDesc>) -> &mut Self {
        let callable = Callable::method(format!("[method]{}.{}", self.wit_name(), name), params, return_type);
        self.add(callable)
    }

    pub fn add_destructor(&mut self) -> &mut Self {
        let callable = Callable::destructor(format!("[resource-drop]{}", self.wit_name()));
        self.add(callable)
    }

    /// The member registered under its full wit name, e.g. `[method]r.name`.
    pub fn get_callable(&self, wit_name: &str) -> Option<&Arc<Callable>> {
        self.callables.get(wit_name)
    }

    pub fn callables(&self) -> impl Iterator<Item = &Arc<Callable>> {
        self.callables.values()
    }

    /// Export name of the function destroying a representation.
    pub fn dtor_name(&self) -> String {
        format!("[dtor]{}", self.wit_name())
    }
}

/// An interface: free functions plus resources.
#[derive(Debug, Clone)]
pub struct InterfaceDesc {
    package: String,
    name: String,
    functions: BTreeMap<String, Arc<Callable>>,
    resources: BTreeMap<String, ResourceDesc>,
}

impl InterfaceDesc {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
            functions: BTreeMap::new(),
            resources: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `pkg:ns/iface`
    pub fn qualifier(&self) -> String {
        format!("{}/{}", self.package, self.name)
    }

    /// Id of a resource declared here, `pkg:ns/iface/r`.
    pub fn resource_id(&self, resource: &str) -> String {
        format!("{}/{}", self.qualifier(), resource)
    }

    /// Declare a resource. Returns its descriptor for adding members.
    pub fn add_resource(&mut self, wit_name: &str) -> &mut ResourceDesc {
        let id = self.resource_id(wit_name);
        self.resources
            .entry(wit_name.to_string())
            .or_insert_with(|| ResourceDesc::new(Arc::new(ResourceType::new(wit_name, id))))
    }

    pub fn add_function(&mut self, callable: Callable) -> &mut Self {
        self.functions.insert(callable.wit_name().to_string(), Arc::new(callable));
        self
    }

    pub fn resource(&self, wit_name: &str) -> Option<&ResourceDesc> {
        self.resources.get(wit_name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &Arc<Callable>> {
        self.functions.values()
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceDesc> {
        self.resources.values()
    }
}

/// What a component imports and exports.
#[derive(Debug, Clone, Default)]
pub struct WorldDesc {
    name: String,
    imports: Vec<InterfaceDesc>,
    exports: Vec<InterfaceDesc>,
    import_functions: Vec<Arc<Callable>>,
    export_functions: Vec<Arc<Callable>>,
}

impl WorldDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn import_interface(mut self, interface: InterfaceDesc) -> Self {
        self.imports.push(interface);
        self
    }

    pub fn export_interface(mut self, interface: InterfaceDesc) -> Self {
        self.exports.push(interface);
        self
    }

    pub fn import_function(mut self, callable: Callable) -> Self {
        self.import_functions.push(Arc::new(callable));
        self
    }

    pub fn export_function(mut self, callable: Callable) -> Self {
        self.export_functions.push(Arc::new(callable));
        self
    }

    pub fn imports(&self) -> &[InterfaceDesc] {
        &self.imports
    }

    pub fn exports(&self) -> &[InterfaceDesc] {
        &self.exports
    }

    pub fn import_functions(&self) -> &[Arc<Callable>] {
        &self.import_functions
    }

    pub fn export_functions(&self) -> &[Arc<Callable>] {
        &self.export_functions
    }

    /// The same world seen from the other side.
    pub fn swapped(&self) -> Self {
        Self {
            name: self.name.clone(),
            imports: self.exports.clone(),
            exports: self.imports.clone(),
            import_functions: self.export_functions.clone(),
            export_functions: self.import_functions.clone(),
        }
    }
}

/// A host implementation of a function.
#[derive(Clone)]
pub enum ServiceFunction {
    Sync(HostFunction),
    Async(AsyncHostFunction),
}

impl ServiceFunction {
    pub fn sync<F>(func: F) -> Self
    where
        F: Fn(Vec<crate::abi::Value>) -> Result<Option<crate::abi::Value>, Error> + Send + Sync + 'static,
    {
        ServiceFunction::Sync(Arc::new(func))
    }

    pub fn asynchronous<F>(func: F) -> Self
    where
        F: Fn(Vec<crate::abi::Value>) -> futures::future::BoxFuture<'static, Result<Option<crate::abi::Value>, Error>>
            + Send
            + Sync
            + 'static,
    {
        ServiceFunction::Async(Arc::new(func))
    }

    /// The synchronous implementation. Modules sharing the host's thread
    /// can't await.
    pub(crate) fn as_sync(&self, name: &str) -> Result<HostFunction, Error> {
        match self {
            ServiceFunction::Sync(func) => Ok(func.clone()),
            ServiceFunction::Async(_) => Err(Error::service(format!("'{}' is asynchronous and can't be imported synchronously", name))),
        }
    }
}

/// Host side of a resource: its constructor and static methods. Methods
/// are dispatched to the constructed objects.
#[derive(Clone, Default)]
pub struct ResourceService {
    constructor: Option<ConstructorFn>,
    statics: HashMap<String, ServiceFunction>,
}

impl ResourceService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_constructor(mut self, constructor: ConstructorFn) -> Self {
        self.constructor = Some(constructor);
        self
    }

    pub fn with_static(mut self, name: impl Into<String>, func: ServiceFunction) -> Self {
        self.statics.insert(name.into(), func);
        self
    }

    pub fn constructor(&self) -> Option<&ConstructorFn> {
        self.constructor.as_ref()
    }

    pub fn static_method(&self, name: &str) -> Option<&ServiceFunction> {
        self.statics.get(name)
    }
}

/// Host implementation of one interface, keyed by wit names.
#[derive(Clone, Default)]
pub struct InterfaceService {
    functions: HashMap<String, ServiceFunction>,
    resources: HashMap<String, ResourceService>,
}

impl InterfaceService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(mut self, name: impl Into<String>, func: ServiceFunction) -> Self {
        self.functions.insert(name.into(), func);
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, resource: ResourceService) -> Self {
        self.resources.insert(name.into(), resource);
        self
    }

    pub fn function(&self, name: &str) -> Option<&ServiceFunction> {
        self.functions.get(name)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceService> {
        self.resources.get(name)
    }
}

/// Host implementation of a world's imports.
#[derive(Clone, Default)]
pub struct Service {
    root: InterfaceService,
    interfaces: HashMap<String, InterfaceService>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root_function(mut self, name: impl Into<String>, func: ServiceFunction) -> Self {
        self.root = self.root.with_function(name, func);
        self
    }

    /// Implementation of the interface `pkg:ns/iface`.
    pub fn with_interface(mut self, qualifier: impl Into<String>, service: InterfaceService) -> Self {
        self.interfaces.insert(qualifier.into(), service);
        self
    }

    pub fn root(&self) -> &InterfaceService {
        &self.root
    }

    pub fn interface(&self, qualifier: &str) -> Option<&InterfaceService> {
        self.interfaces.get(qualifier)
    }
}

fn missing(what: &str, name: &str) -> Error {
    Error::service(format!("service provides no {} '{}'", what, name))
}

/// Instantiate `module` in the host's thread: build its imports from
/// `service`, attach its memory to `cx` and bind its exports.
pub fn bind_module(world: &WorldDesc, service: &Service, module: &dyn Module, cx: &Arc<WasmContext>) -> Result<BoundWorld, Error> {
    let imports = imports::create(world, service, cx)?;
    let instance = module.instantiate(&imports)?;
    let memory = ModuleMemory::from_exports(&instance)?.into_memory()?;
    cx.initialize(memory)?;
    info!(world = world.name(), "module bound");
    exports::bind(world, &instance, cx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_members_are_named_by_kind() {
        let mut iface = InterfaceDesc::new("test:pkg", "files");
        iface
            .add_resource("file")
            .add_constructor(vec![("path".to_string(), TypeDesc::String)])
            .add_method("size", Vec::new(), Some(TypeDesc::U64))
            .add_static_method("open", Vec::new(), None)
            .add_destructor();

        let file = iface.resource("file").unwrap();
        assert_eq!(file.id(), "test:pkg/files/file");
        assert!(file.get_callable("[constructor]file").is_some());
        assert!(file.get_callable("[method]file.size").is_some());
        assert!(file.get_callable("[static]file.open").is_some());
        assert!(file.get_callable("[resource-drop]file").is_some());
        assert!(file.get_callable("size").is_none());
        assert_eq!(file.dtor_name(), "[dtor]file");
    }

    #[test]
    fn test_swapped_world() {
        let world = WorldDesc::new("w")
            .import_interface(InterfaceDesc::new("a:b", "in"))
            .export_function(Callable::function("run", Vec::new(), None));
        let swapped = world.swapped();
        assert_eq!(swapped.exports()[0].qualifier(), "a:b/in");
        assert_eq!(swapped.import_functions()[0].wit_name(), "run");
        assert!(swapped.imports().is_empty());
    }
}
