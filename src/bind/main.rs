//! Main-side wiring: a host service answering a worker's imports, and async
//! access to the exports of the module running in the worker.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::FutureExt;

use super::{InterfaceDesc, InterfaceService, ResourceDesc, Service, ServiceFunction, WorldDesc, imports, missing};
use crate::abi::{FlatValue, Memory, Trap, Value};
use crate::bridge::{MainConnection, MainHandler};
use crate::callable::remote::qualified_name;
use crate::callable::{Callable, CallableKind, WasmFunction};
use crate::context::WasmContext;
use crate::error::Error;
use crate::logging::{debug, error, info};
use crate::resource::{Resource, ResourceManager, ResourceRef};

fn service_handler(callable: &Arc<Callable>, func: &ServiceFunction, cx: &Arc<WasmContext>) -> MainHandler {
    let callable = callable.clone();
    let cx = cx.clone();
    match func {
        ServiceFunction::Sync(func) => {
            let func = func.clone();
            MainHandler::sync(move |memory: &Memory, params: &[FlatValue]| callable.call_service(&func, params, memory, &cx))
        }
        ServiceFunction::Async(func) => {
            let func = func.clone();
            MainHandler::asynchronous(move |memory: Memory, params: Vec<FlatValue>| {
                let callable = callable.clone();
                let func = func.clone();
                let cx = cx.clone();
                async move { callable.call_service_async(&func, &params, &memory, &cx).await }.boxed()
            })
        }
    }
}

fn resource_handler(
    callable: &Arc<Callable>,
    resource: &ResourceDesc,
    service: &InterfaceService,
    manager: &Arc<ResourceManager>,
    cx: &Arc<WasmContext>,
) -> Result<MainHandler, Error> {
    let resource_service = service.resource(resource.wit_name());
    let target = callable.clone();
    let manager = manager.clone();
    let cx = cx.clone();
    let handler = match callable.kind() {
        CallableKind::Constructor => {
            let ctor = resource_service
                .and_then(|r| r.constructor())
                .ok_or_else(|| missing("constructor for", resource.wit_name()))?
                .clone();
            MainHandler::sync(move |memory: &Memory, params: &[FlatValue]| target.call_constructor(&ctor, &manager, params, memory, &cx))
        }
        CallableKind::StaticMethod => {
            let func = resource_service
                .and_then(|r| r.static_method(callable.member_name()))
                .ok_or_else(|| missing("static method", callable.wit_name()))?;
            service_handler(callable, func, &cx)
        }
        CallableKind::Method => {
            MainHandler::sync(move |memory: &Memory, params: &[FlatValue]| target.call_method(&manager, params, memory, &cx))
        }
        CallableKind::Destructor => MainHandler::sync(move |_: &Memory, params: &[FlatValue]| target.call_destructor(&manager, params)),
        CallableKind::Function => return Err(Trap::convention(format!("'{}' is not a resource member", callable.wit_name())).into()),
    };
    Ok(handler)
}

fn bind_interface_service(connection: &MainConnection, interface: &InterfaceDesc, service: &InterfaceService, cx: &Arc<WasmContext>) -> Result<(), Error> {
    let qualifier = interface.qualifier();
    for callable in interface.functions() {
        let func = service
            .function(callable.wit_name())
            .ok_or_else(|| missing("function", callable.wit_name()))?;
        connection.on(qualified_name(&qualifier, callable.wit_name()), service_handler(callable, func, cx));
    }
    for resource in interface.resources() {
        let manager = cx.resources().get_or_create(resource.id());
        for callable in resource.callables() {
            let handler = resource_handler(callable, resource, service, &manager, cx)?;
            connection.on(qualified_name(&qualifier, callable.wit_name()), handler);
        }
    }
    Ok(())
}

fn intrinsic_handler(func: WasmFunction) -> MainHandler {
    MainHandler::sync(move |_: &Memory, params: &[FlatValue]| func(params))
}

/// Answer the worker's imports with `service`.
///
/// Handlers are registered under `pkg:ns/iface#name` (root functions under
/// their own name). The handle tables of resources the worker exports live
/// in `cx` and are reached through `[export]pkg:ns/iface#[resource-new]r`
/// and friends.
pub fn bind_service(connection: &MainConnection, world: &WorldDesc, service: &Service, cx: &Arc<WasmContext>) -> Result<(), Error> {
    for callable in world.import_functions() {
        let func = service
            .root()
            .function(callable.wit_name())
            .ok_or_else(|| missing("function", callable.wit_name()))?;
        connection.on(callable.wit_name(), service_handler(callable, func, cx));
    }
    for interface in world.imports() {
        let qualifier = interface.qualifier();
        let iface_service = service
            .interface(&qualifier)
            .ok_or_else(|| missing("interface", &qualifier))?;
        debug!(interface = %qualifier, "binding service for worker");
        bind_interface_service(connection, interface, iface_service, cx)?;
    }
    for interface in world.exports() {
        let module = format!("[export]{}", interface.qualifier());
        for (name, func) in imports::export_intrinsics(interface, cx) {
            connection.on(qualified_name(&module, &name), intrinsic_handler(func));
        }
    }
    Ok(())
}

/// An export of the worker's module, callable from main.
#[derive(Clone)]
pub struct AsyncBoundFunction {
    callable: Arc<Callable>,
    qualifier: String,
    connection: MainConnection,
    cx: Arc<WasmContext>,
}

impl fmt::Debug for AsyncBoundFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBoundFunction")
            .field("name", &qualified_name(&self.qualifier, self.callable.wit_name()))
            .finish()
    }
}

impl AsyncBoundFunction {
    pub fn callable(&self) -> &Arc<Callable> {
        &self.callable
    }

    pub async fn call(&self, params: &[Value]) -> Result<Option<Value>, Error> {
        self.callable.call_worker(&self.connection, &self.qualifier, params, &self.cx).await
    }
}

/// Main's proxy for a representation living in the worker. Its methods
/// are awaited through [`AsyncBoundResource::call_method`].
struct WorkerObject {
    resource: String,
}

impl Resource for WorkerObject {
    fn call(&self, method: &str, _params: Vec<Value>) -> Result<Option<Value>, Error> {
        Err(Error::service(format!(
            "method '{}' of worker resource '{}' must be awaited through its bound resource",
            method, self.resource
        )))
    }
}

/// A resource exported by the worker's module.
pub struct AsyncBoundResource {
    desc: ResourceDesc,
    qualifier: String,
    manager: Arc<ResourceManager>,
    connection: MainConnection,
    cx: Arc<WasmContext>,
}

impl fmt::Debug for AsyncBoundResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBoundResource").field("resource", &self.desc.id()).finish()
    }
}

impl AsyncBoundResource {
    pub fn manager(&self) -> &Arc<ResourceManager> {
        &self.manager
    }

    fn member(&self, wit_name: &str) -> Result<&Arc<Callable>, Error> {
        self.desc
            .get_callable(wit_name)
            .ok_or_else(|| Error::service(format!("resource '{}' has no member '{}'", self.desc.wit_name(), wit_name)))
    }

    /// Run the worker's constructor and return the proxy for the new handle.
    pub async fn construct(&self, params: &[Value]) -> Result<ResourceRef, Error> {
        let callable = self.member(&format!("[constructor]{}", self.desc.wit_name()))?;
        let handle = callable
            .call_wasm_constructor_async(&self.connection, &self.qualifier, params, &self.cx)
            .await?;
        debug!(resource = self.desc.id(), handle, "constructed worker resource");
        Ok(self.manager.get_resource(handle)?)
    }

    pub async fn call_method(&self, resource: &ResourceRef, name: &str, params: &[Value]) -> Result<Option<Value>, Error> {
        let callable = self.member(&format!("[method]{}.{}", self.desc.wit_name(), name))?;
        let rep = resource.rep().ok_or(Trap::UnknownHandle(resource.handle()))?;
        callable
            .call_worker_method(&self.connection, &self.qualifier, rep, params, &self.cx)
            .await
    }

    pub async fn call_static(&self, name: &str, params: &[Value]) -> Result<Option<Value>, Error> {
        let callable = self.member(&format!("[static]{}.{}", self.desc.wit_name(), name))?;
        callable.call_worker(&self.connection, &self.qualifier, params, &self.cx).await
    }

    /// Release a proxy. The worker's destructor runs in the background.
    pub fn release(&self, resource: ResourceRef) -> Result<(), Error> {
        let released = self.manager.release(resource.handle());
        drop(resource);
        released
    }
}

/// The worker exports of one interface or of the world root.
#[derive(Debug, Default)]
pub struct AsyncBoundInterface {
    functions: BTreeMap<String, AsyncBoundFunction>,
    resources: BTreeMap<String, AsyncBoundResource>,
}

impl AsyncBoundInterface {
    pub fn function(&self, name: &str) -> Option<&AsyncBoundFunction> {
        self.functions.get(name)
    }

    pub fn resource(&self, name: &str) -> Option<&AsyncBoundResource> {
        self.resources.get(name)
    }

    pub async fn call(&self, name: &str, params: &[Value]) -> Result<Option<Value>, Error> {
        self.function(name)
            .ok_or_else(|| Error::service(format!("no exported function '{}'", name)))?
            .call(params)
            .await
    }
}

/// Everything the worker's module exports, callable from main.
#[derive(Debug, Default)]
pub struct AsyncBoundWorld {
    root: AsyncBoundInterface,
    interfaces: BTreeMap<String, AsyncBoundInterface>,
}

impl AsyncBoundWorld {
    pub fn root(&self) -> &AsyncBoundInterface {
        &self.root
    }

    pub fn interface(&self, qualifier: &str) -> Option<&AsyncBoundInterface> {
        self.interfaces.get(qualifier)
    }
}

fn bind_worker_resource(connection: &MainConnection, resource: &ResourceDesc, qualifier: &str, cx: &Arc<WasmContext>) -> AsyncBoundResource {
    let manager = cx.resources().get_or_create(resource.id());
    let name = resource.wit_name().to_string();
    let ctor = Arc::new(move |_handle: u32, _rep: u32| -> Arc<dyn Resource> { Arc::new(WorkerObject { resource: name.clone() }) });

    let dtor_callable = Arc::new(Callable::destructor(resource.dtor_name()));
    let dtor_connection = connection.clone();
    let dtor_qualifier = qualifier.to_string();
    let dtor_cx = cx.clone();
    let dtor = Arc::new(move |rep: u32| -> Result<(), Error> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| Error::service(err.to_string()))?;
        let callable = dtor_callable.clone();
        let connection = dtor_connection.clone();
        let qualifier = dtor_qualifier.clone();
        let cx = dtor_cx.clone();
        runtime.spawn(async move {
            if let Err(err) = callable.call_worker(&connection, &qualifier, &[Value::U32(rep)], &cx).await {
                error!(rep, error = %err, "worker resource destructor failed");
            }
        });
        Ok(())
    });
    manager.set_proxy_info(ctor, dtor);

    AsyncBoundResource {
        desc: resource.clone(),
        qualifier: qualifier.to_string(),
        manager,
        connection: connection.clone(),
        cx: cx.clone(),
    }
}

fn bind_worker_function(connection: &MainConnection, callable: &Arc<Callable>, qualifier: &str, cx: &Arc<WasmContext>) -> AsyncBoundFunction {
    AsyncBoundFunction {
        callable: callable.clone(),
        qualifier: qualifier.to_string(),
        connection: connection.clone(),
        cx: cx.clone(),
    }
}

/// Bind the exports of the module running behind `connection`.
///
/// A worker that exports a resource without a `[dtor]` export still gets
/// its destructor call; the worker answers it with a handler-not-found
/// error, which is logged.
pub fn bind_worker_exports(connection: &MainConnection, world: &WorldDesc, cx: &Arc<WasmContext>) -> AsyncBoundWorld {
    let mut bound = AsyncBoundWorld::default();
    for callable in world.export_functions() {
        bound
            .root
            .functions
            .insert(callable.wit_name().to_string(), bind_worker_function(connection, callable, "", cx));
    }
    for interface in world.exports() {
        let qualifier = interface.qualifier();
        let mut iface = AsyncBoundInterface::default();
        for callable in interface.functions() {
            iface
                .functions
                .insert(callable.wit_name().to_string(), bind_worker_function(connection, callable, &qualifier, cx));
        }
        for resource in interface.resources() {
            iface
                .resources
                .insert(resource.wit_name().to_string(), bind_worker_resource(connection, resource, &qualifier, cx));
        }
        bound.interfaces.insert(qualifier, iface);
    }
    bound
}

/// Serve the worker's imports with `service` and bind its exports.
///
/// [`MainConnection::listen`] must be running, and
/// [`MainConnection::initialize_worker`] must have completed, before any
/// export is called.
pub fn bind(connection: &MainConnection, world: &WorldDesc, service: &Service, cx: &Arc<WasmContext>) -> Result<AsyncBoundWorld, Error> {
    bind_service(connection, world, service, cx)?;
    info!(world = world.name(), "worker world bound");
    Ok(bind_worker_exports(connection, world, cx))
}
