//! Call flows per callable kind, for a host and a module sharing one thread.
//!
//! The `call_service*` family runs when a module calls an import: flat
//! arguments are lifted, the host implementation runs, and its result is
//! lowered again. The `call_wasm*` family runs when the host calls an
//! export.

use std::sync::Arc;

use super::{AsyncHostFunction, Callable, CallableKind, HostFunction, WasmFunction};
use crate::abi::{FlatValue, Memory, Trap, Value};
use crate::context::WasmContext;
use crate::error::Error;
use crate::logging::{debug, error};
use crate::resource::{Resource, ResourceManager};

/// Host implementation of a resource constructor.
pub type ConstructorFn = Arc<dyn Fn(Vec<Value>) -> Result<Arc<dyn Resource>, Error> + Send + Sync>;

pub(crate) fn handle_param(params: &[FlatValue]) -> Result<(u32, &[FlatValue]), Trap> {
    match params.split_first() {
        Some((first, rest)) => Ok((first.as_i32()?, rest)),
        None => Err(Trap::convention("missing resource handle")),
    }
}

impl Callable {
    /// The member name without its `[kind]resource.` prefix.
    pub fn member_name(&self) -> &str {
        let name = match self.wit_name().split_once(']') {
            Some((_, rest)) => rest,
            None => self.wit_name(),
        };
        name.rsplit_once('.').map_or(name, |(_, member)| member)
    }

    fn expect_kind(&self, kinds: &[CallableKind]) -> Result<(), Trap> {
        if kinds.contains(&self.kind()) {
            return Ok(());
        }
        Err(Trap::convention(format!("'{}' is a {:?}", self.wit_name(), self.kind())))
    }

    fn finish_service_call(
        &self,
        result: Result<Option<Value>, Error>,
        memory: &Memory,
        cx: &WasmContext,
        out: Option<u32>,
    ) -> Result<Option<FlatValue>, Error> {
        match result {
            Ok(value) => Ok(self.lower_return_value(value, memory, cx, out)?),
            Err(err) => self.handle_error(err, memory, cx, out),
        }
    }

    /// Serve a module's call to an imported function or static method.
    pub fn call_service(
        &self,
        service: &HostFunction,
        params: &[FlatValue],
        memory: &Memory,
        cx: &WasmContext,
    ) -> Result<Option<FlatValue>, Error> {
        self.expect_kind(&[CallableKind::Function, CallableKind::StaticMethod])?;
        let (values, out) = self.get_param_values_for_host_call(params, memory, cx)?;
        debug!(name = %self.wit_name(), params = values.len(), "calling service");
        self.finish_service_call(service(values), memory, cx, out)
    }

    /// Like [`Callable::call_service`], awaiting an asynchronous implementation.
    pub async fn call_service_async(
        &self,
        service: &AsyncHostFunction,
        params: &[FlatValue],
        memory: &Memory,
        cx: &WasmContext,
    ) -> Result<Option<FlatValue>, Error> {
        self.expect_kind(&[CallableKind::Function, CallableKind::StaticMethod])?;
        let (values, out) = self.get_param_values_for_host_call(params, memory, cx)?;
        debug!(name = %self.wit_name(), params = values.len(), "calling async service");
        let result = service(values).await;
        self.finish_service_call(result, memory, cx, out)
    }

    /// Construct a host object for the module and return its new handle.
    pub fn call_constructor(
        &self,
        constructor: &ConstructorFn,
        manager: &ResourceManager,
        params: &[FlatValue],
        memory: &Memory,
        cx: &WasmContext,
    ) -> Result<Option<FlatValue>, Error> {
        self.expect_kind(&[CallableKind::Constructor])?;
        if self.return_type().map(|ty| ty.flat_types().len()) != Some(1) {
            return Err(Trap::convention(format!("constructor '{}' must return one handle", self.wit_name())).into());
        }
        let values = self.lift_param_values(params, memory, cx)?;
        let object = constructor(values)?;
        let handle = manager.register_resource(object, None)?;
        debug!(name = %self.wit_name(), handle, "resource constructed");
        Ok(Some(FlatValue::I32(handle)))
    }

    /// Run the drop hook of the resource behind the handle, then remove it.
    /// The handle is removed even when the hook fails.
    pub fn call_destructor(&self, manager: &ResourceManager, params: &[FlatValue]) -> Result<Option<FlatValue>, Error> {
        self.expect_kind(&[CallableKind::Destructor])?;
        let (handle, _) = handle_param(params)?;
        let resource = manager.get_resource(handle)?;
        let hook = resource.object().on_drop();
        drop(resource);
        manager.remove_resource(handle)?;
        if let Err(err) = &hook {
            error!(handle, error = %err, "resource drop hook failed");
        }
        hook.map(|()| None)
    }

    /// Serve a method call on a host object. The first flat value is the
    /// receiver's handle.
    pub fn call_method(
        &self,
        manager: &ResourceManager,
        params: &[FlatValue],
        memory: &Memory,
        cx: &WasmContext,
    ) -> Result<Option<FlatValue>, Error> {
        self.expect_kind(&[CallableKind::Method])?;
        let (handle, rest) = handle_param(params)?;
        let (values, out) = self.get_param_values_for_host_call(rest, memory, cx)?;
        let resource = manager.get_resource(handle)?;
        debug!(name = %self.wit_name(), handle, "calling resource method");
        let result = resource.object().call(self.member_name(), values);
        self.finish_service_call(result, memory, cx, out)
    }

    /// Call an exported function with host values.
    pub fn call_wasm(&self, func: &WasmFunction, params: &[Value], cx: &WasmContext) -> Result<Option<Value>, Error> {
        let memory = cx.memory()?;
        let flat = self.lower_param_values(params, &memory, cx)?;
        let result = func(&flat)?;
        self.lift_return_value(result, &memory, cx)
    }

    /// Call an exported method on the representation `rep`.
    pub fn call_wasm_method(&self, func: &WasmFunction, rep: u32, params: &[Value], cx: &WasmContext) -> Result<Option<Value>, Error> {
        let memory = cx.memory()?;
        let mut flat = vec![FlatValue::I32(rep)];
        flat.extend(self.lower_param_values(params, &memory, cx)?);
        let result = func(&flat)?;
        self.lift_return_value(result, &memory, cx)
    }

    /// Call an exported constructor and return the handle it produced.
    pub fn call_wasm_constructor(&self, func: &WasmFunction, params: &[Value], cx: &WasmContext) -> Result<u32, Error> {
        let memory = cx.memory()?;
        let flat = self.lower_param_values(params, &memory, cx)?;
        match func(&flat)? {
            Some(value) => Ok(value.as_i32()?),
            None => Err(Trap::MissingFlatValue.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::abi::{BumpMemory, TypeDesc};
    use crate::abi::types::ResourceType;

    struct Counter {
        value: Mutex<u32>,
        dropped: Arc<Mutex<bool>>,
        fail_drop: bool,
    }

    impl Resource for Counter {
        fn call(&self, method: &str, params: Vec<Value>) -> Result<Option<Value>, Error> {
            match (method, params.as_slice()) {
                ("add", [Value::U32(n)]) => {
                    let mut value = self.value.lock().unwrap();
                    *value += n;
                    Ok(Some(Value::U32(*value)))
                }
                _ => Err(Error::service(format!("unknown method {}", method))),
            }
        }

        fn on_drop(&self) -> Result<(), Error> {
            *self.dropped.lock().unwrap() = true;
            if self.fail_drop {
                return Err(Error::service("drop failed"));
            }
            Ok(())
        }
    }

    fn setup() -> (WasmContext, Memory) {
        let memory = Memory::new(BumpMemory::new()).unwrap();
        let cx = WasmContext::with_memory(Default::default(), Default::default(), memory.clone());
        (cx, memory)
    }

    fn counter_type() -> TypeDesc {
        TypeDesc::Own(Arc::new(ResourceType::new("counter", "test:pkg/api/counter")))
    }

    #[test]
    fn test_member_name() {
        assert_eq!(Callable::method("[method]counter.add", Vec::new(), None).member_name(), "add");
        assert_eq!(Callable::static_method("[static]counter.zero", Vec::new(), None).member_name(), "zero");
        assert_eq!(Callable::function("plain", Vec::new(), None).member_name(), "plain");
    }

    #[test]
    fn test_service_call_with_string_result() {
        let (cx, memory) = setup();
        let callable = Callable::function("greet", vec![("name".to_string(), TypeDesc::String)], Some(TypeDesc::String));
        let service: HostFunction = Arc::new(|params: Vec<Value>| -> Result<Option<Value>, Error> {
            let name = params[0].as_str().unwrap_or_default().to_string();
            Ok(Some(Value::from(format!("hello {}", name))))
        });

        let mut flat = callable.lower_param_values(&[Value::from("bob")], &memory, &cx).unwrap();
        let out = memory.alloc(4, 8).unwrap();
        flat.push(FlatValue::I32(crate::abi::MemoryView::ptr(&out)));
        assert_eq!(callable.call_service(&service, &flat, &memory, &cx).unwrap(), None);
        assert_eq!(TypeDesc::String.load(&out.as_readonly(), 0, &cx).unwrap(), Value::from("hello bob"));
    }

    #[test]
    fn test_constructor_method_destructor() {
        let (cx, memory) = setup();
        let manager = ResourceManager::new();
        let dropped = Arc::new(Mutex::new(false));
        let flag = dropped.clone();
        let ctor: ConstructorFn = Arc::new(move |params: Vec<Value>| -> Result<Arc<dyn Resource>, Error> {
            let start = match params.first() {
                Some(Value::U32(n)) => *n,
                _ => 0,
            };
            Ok(Arc::new(Counter {
                value: Mutex::new(start),
                dropped: flag.clone(),
                fail_drop: true,
            }) as Arc<dyn Resource>)
        });

        let constructor = Callable::constructor("[constructor]counter", vec![("start".to_string(), TypeDesc::U32)], counter_type());
        let handle = constructor
            .call_constructor(&ctor, &manager, &[FlatValue::I32(5)], &memory, &cx)
            .unwrap()
            .unwrap()
            .as_i32()
            .unwrap();

        let add = Callable::method("[method]counter.add", vec![("n".to_string(), TypeDesc::U32)], Some(TypeDesc::U32));
        let result = add
            .call_method(&manager, &[FlatValue::I32(handle), FlatValue::I32(2)], &memory, &cx)
            .unwrap();
        assert_eq!(result, Some(FlatValue::I32(7)));

        let dtor = Callable::destructor("[resource-drop]counter");
        assert!(dtor.call_destructor(&manager, &[FlatValue::I32(handle)]).is_err());
        assert!(*dropped.lock().unwrap());
        assert!(!manager.has_resource(handle));
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let (cx, memory) = setup();
        let callable = Callable::method("[method]counter.add", Vec::new(), None);
        let service: HostFunction = Arc::new(|_: Vec<Value>| -> Result<Option<Value>, Error> { Ok(None) });
        let err = callable.call_service(&service, &[], &memory, &cx).unwrap_err();
        assert!(err.is_abi());
    }
}
