//! Call dispatch across the module boundary.
//!
//! A [`Callable`] describes one function, constructor, method, static method
//! or destructor. It packs host values into the flat arguments a module
//! expects and unpacks results, following the flattening rules:
//!
//! - parameters whose flat form exceeds [`MAX_FLAT_PARAMS`] are stored in
//!   memory and passed as one pointer
//! - results whose flat form exceeds [`MAX_FLAT_RESULTS`] travel through
//!   memory: an imported function receives a trailing out-pointer, an
//!   exported function returns a pointer to memory it allocated
//!
//! [`kinds`] holds the call flows for a module and a host in the same
//! thread, `remote` the flows through a bridge connection.

pub mod kinds;
#[cfg(feature = "bridge")]
pub mod remote;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::abi::{
    FlatType, FlatValue, MAX_FLAT_PARAMS, MAX_FLAT_RESULTS, Memory, MemoryRange, MemoryView, Trap, TypeDesc, Value,
};
use crate::context::WasmContext;
use crate::error::{Error, ResultError};
use crate::logging::trace;

/// A function exported by a module, taking and returning flat values.
pub type WasmFunction = Arc<dyn Fn(&[FlatValue]) -> Result<Option<FlatValue>, Error> + Send + Sync>;

/// A host implementation of a function or static method.
pub type HostFunction = Arc<dyn Fn(Vec<Value>) -> Result<Option<Value>, Error> + Send + Sync>;

/// An asynchronous host implementation.
pub type AsyncHostFunction = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Option<Value>, Error>> + Send + Sync>;

/// What a callable stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableKind {
    Function,
    Constructor,
    Destructor,
    StaticMethod,
    Method,
}

/// A named parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: TypeDesc,
}

/// Out-pointer storage of an imported call relayed into another memory.
#[derive(Debug, Clone)]
pub struct ResultStorage {
    /// Where the callee writes the result, in the relay memory.
    pub transfer: MemoryRange,
    /// Where the original caller expects it.
    pub original: MemoryRange,
}

/// Flat parameters copied into another memory.
#[derive(Debug, Clone, Default)]
pub struct ParamTransfer {
    pub params: Vec<FlatValue>,
    pub storage: Option<ResultStorage>,
}

/// One function signature and its calling convention.
#[derive(Debug, Clone)]
pub struct Callable {
    wit_name: String,
    kind: CallableKind,
    params: Vec<Param>,
    param_type: Option<TypeDesc>,
    single_param: bool,
    return_type: Option<TypeDesc>,
}

fn pointer(value: Option<&FlatValue>) -> Result<u32, Trap> {
    match value {
        Some(FlatValue::I32(ptr)) => Ok(*ptr),
        Some(other) => Err(Trap::convention(format!("expected a pointer, got {:?}", other))),
        None => Err(Trap::convention("missing pointer")),
    }
}

impl Callable {
    pub fn new(kind: CallableKind, wit_name: impl Into<String>, params: Vec<(String, TypeDesc)>, return_type: Option<TypeDesc>) -> Self {
        let params: Vec<Param> = params.into_iter().map(|(name, ty)| Param { name, ty }).collect();
        let (param_type, single_param) = match params.as_slice() {
            [] => (None, false),
            [param] => (Some(param.ty.clone()), true),
            many => (Some(TypeDesc::tuple(many.iter().map(|p| p.ty.clone()).collect())), false),
        };
        Self {
            wit_name: wit_name.into(),
            kind,
            params,
            param_type,
            single_param,
            return_type,
        }
    }

    pub fn function(wit_name: impl Into<String>, params: Vec<(String, TypeDesc)>, return_type: Option<TypeDesc>) -> Self {
        Self::new(CallableKind::Function, wit_name, params, return_type)
    }

    /// `[constructor]resource`. The result is the new handle.
    pub fn constructor(wit_name: impl Into<String>, params: Vec<(String, TypeDesc)>, resource: TypeDesc) -> Self {
        Self::new(CallableKind::Constructor, wit_name, params, Some(resource))
    }

    /// `[method]resource.name`. `params` excludes the receiver.
    pub fn method(wit_name: impl Into<String>, params: Vec<(String, TypeDesc)>, return_type: Option<TypeDesc>) -> Self {
        Self::new(CallableKind::Method, wit_name, params, return_type)
    }

    pub fn static_method(wit_name: impl Into<String>, params: Vec<(String, TypeDesc)>, return_type: Option<TypeDesc>) -> Self {
        Self::new(CallableKind::StaticMethod, wit_name, params, return_type)
    }

    /// `[resource-drop]resource`, taking the handle.
    pub fn destructor(wit_name: impl Into<String>) -> Self {
        Self::new(CallableKind::Destructor, wit_name, vec![("self".to_string(), TypeDesc::U32)], None)
    }

    pub fn wit_name(&self) -> &str {
        &self.wit_name
    }

    pub fn kind(&self) -> CallableKind {
        self.kind
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn return_type(&self) -> Option<&TypeDesc> {
        self.return_type.as_ref()
    }

    /// Flat types of all parameters, before spilling.
    pub fn param_flat_types(&self) -> &[FlatType] {
        self.param_type.as_ref().map(TypeDesc::flat_types).unwrap_or_default()
    }

    fn param_flat_count(&self) -> usize {
        self.param_flat_types().len()
    }

    fn return_flat_count(&self) -> usize {
        self.return_type.as_ref().map_or(0, |ty| ty.flat_types().len())
    }

    /// Parameters are passed through memory.
    pub fn spills_params(&self) -> bool {
        self.param_flat_count() > MAX_FLAT_PARAMS
    }

    /// The result is passed through memory.
    pub fn returns_via_memory(&self) -> bool {
        self.return_flat_count() > MAX_FLAT_RESULTS
    }

    /// The single flat result type, when the result travels in a register.
    pub fn flat_result_type(&self) -> Option<FlatType> {
        match self.return_type.as_ref().map(TypeDesc::flat_types) {
            Some([ty]) => Some(*ty),
            Some(types) if types.len() > MAX_FLAT_RESULTS => Some(FlatType::I32),
            _ => None,
        }
    }

    pub fn lift_param_values(&self, params: &[FlatValue], memory: &Memory, cx: &WasmContext) -> Result<Vec<Value>, Trap> {
        let Some(param_type) = &self.param_type else {
            return Ok(Vec::new());
        };
        let lifted = if self.spills_params() {
            let ptr = pointer(params.first())?;
            param_type.load(&memory.readonly(ptr, param_type.size())?, 0, cx)?
        } else {
            param_type.lift_flat(memory, &mut params.iter().copied(), cx)?
        };
        match lifted {
            value if self.single_param => Ok(vec![value]),
            Value::Tuple(values) => Ok(values),
            other => Err(Trap::mismatch("parameter tuple", other)),
        }
    }

    pub fn lower_param_values(&self, values: &[Value], memory: &Memory, cx: &WasmContext) -> Result<Vec<FlatValue>, Trap> {
        let Some(param_type) = &self.param_type else {
            return Ok(Vec::new());
        };
        if values.len() != self.params.len() {
            return Err(Trap::convention(format!(
                "expected {} parameters, but got {}",
                self.params.len(),
                values.len()
            )));
        }
        let tuple;
        let to_lower = match values {
            [value] if self.single_param => value,
            _ => {
                tuple = Value::Tuple(values.to_vec());
                &tuple
            }
        };
        if self.spills_params() {
            let writer = param_type.alloc(memory)?;
            param_type.store(&writer, 0, to_lower, cx)?;
            trace!(name = %self.wit_name, ptr = writer.ptr(), "parameters spilled to memory");
            Ok(vec![FlatValue::I32(writer.ptr())])
        } else {
            let mut out = Vec::with_capacity(self.param_flat_count());
            param_type.lower_flat(&mut out, memory, to_lower, cx)?;
            Ok(out)
        }
    }

    /// The trailing out-pointer of an imported call, if the caller passed one.
    fn out_pointer(&self, params: &[FlatValue]) -> Result<Option<u32>, Trap> {
        if !self.returns_via_memory() {
            return Ok(None);
        }
        let param_count = if self.spills_params() { 1 } else { self.param_flat_count() };
        if params.len() == param_count + 1 {
            return pointer(params.last()).map(Some);
        }
        Ok(None)
    }

    /// Copy flat parameters living in `src` into `dest`, relocating any data
    /// they point at. An out-pointer is replaced by fresh storage in `dest`.
    pub fn copy_param_values(&self, params: &[FlatValue], dest: &Memory, src: &Memory, cx: &WasmContext) -> Result<ParamTransfer, Trap> {
        let out = self.out_pointer(params)?;
        let mut result = Vec::new();
        match &self.param_type {
            None => {
                let expected = usize::from(out.is_some());
                if params.len() != expected {
                    return Err(Trap::convention(format!("expected no parameters, but got {}", params.len())));
                }
            }
            Some(param_type) if self.spills_params() => {
                let ptr = pointer(params.first())?;
                let reader = src.readonly(ptr, param_type.size())?;
                let writer = param_type.alloc(dest)?;
                param_type.copy(&writer, 0, &reader, 0, cx)?;
                result.push(FlatValue::I32(writer.ptr()));
            }
            Some(param_type) => {
                let count = self.param_flat_count();
                param_type.copy_flat(&mut result, dest, &mut params.iter().take(count).copied(), src, cx)?;
            }
        }
        let storage = match (out, &self.return_type) {
            (Some(out), Some(return_type)) => {
                let transfer = return_type.alloc(dest)?;
                result.push(FlatValue::I32(transfer.ptr()));
                Some(ResultStorage {
                    transfer,
                    original: src.pre_allocated(out, return_type.size())?,
                })
            }
            _ => None,
        };
        Ok(ParamTransfer { params: result, storage })
    }

    /// Lower a host result. With an out-pointer the value is written there
    /// and nothing is returned.
    pub fn lower_return_value(&self, value: Option<Value>, memory: &Memory, cx: &WasmContext, out: Option<u32>) -> Result<Option<FlatValue>, Trap> {
        let Some(return_type) = &self.return_type else {
            return Ok(None);
        };
        let value = match (return_type, value) {
            (TypeDesc::Result(_), Some(value @ Value::Result(_))) => value,
            (TypeDesc::Result(_), payload) => Value::ok(payload),
            (_, Some(value)) => value,
            (_, None) => return Err(Trap::convention(format!("'{}' returned no value", self.wit_name))),
        };
        if !self.returns_via_memory() {
            let mut result = Vec::with_capacity(1);
            return_type.lower_flat(&mut result, memory, &value, cx)?;
            if result.len() != return_type.flat_types().len() {
                return Err(Trap::convention(format!(
                    "expected flat result of length {}, but got {}",
                    return_type.flat_types().len(),
                    result.len()
                )));
            }
            return Ok(result.into_iter().next());
        }
        let writer = match out {
            Some(ptr) => memory.pre_allocated(ptr, return_type.size())?,
            None => return_type.alloc(memory)?,
        };
        return_type.store(&writer, 0, &value, cx)?;
        Ok(if out.is_some() { None } else { Some(FlatValue::I32(writer.ptr())) })
    }

    /// Translate a service error into the error case of the declared result,
    /// or hand it back unchanged.
    pub fn handle_error(&self, error: Error, memory: &Memory, cx: &WasmContext, out: Option<u32>) -> Result<Option<FlatValue>, Error> {
        let class = match &self.return_type {
            Some(TypeDesc::Result(result)) => result.error_class(),
            _ => None,
        };
        match (class, error) {
            (Some(class), Error::Declared(declared)) if declared.class == class => {
                let value = Value::err(declared.value);
                Ok(self.lower_return_value(Some(value), memory, cx, out)?)
            }
            (_, error) => Err(error),
        }
    }

    /// Move a relayed result back into the memory of the original caller.
    pub fn copy_return_value(
        &self,
        storage: Option<&ResultStorage>,
        dest: &Memory,
        src: &Memory,
        value: Option<FlatValue>,
        cx: &WasmContext,
    ) -> Result<Option<FlatValue>, Trap> {
        let return_type = self.return_type.as_ref();
        match (storage, value) {
            (Some(_), Some(value)) => Err(Trap::convention(format!(
                "can't use both result storage and result value {:?}",
                value
            ))),
            (Some(storage), None) => {
                let return_type = return_type.ok_or_else(|| Trap::convention("result storage without a return type"))?;
                return_type.copy(&storage.original, 0, &storage.transfer.as_readonly(), 0, cx)?;
                Ok(None)
            }
            (None, Some(value)) => {
                let return_type = return_type.ok_or_else(|| Trap::convention(format!("expected no return value, but got {:?}", value)))?;
                if !self.returns_via_memory() {
                    return Ok(Some(value));
                }
                let ptr = pointer(Some(&value))?;
                let writer = return_type.alloc(dest)?;
                return_type.copy(&writer, 0, &src.readonly(ptr, return_type.size())?, 0, cx)?;
                Ok(Some(FlatValue::I32(writer.ptr())))
            }
            (None, None) => Ok(None),
        }
    }

    /// Lift a module result. The error case of a `result` is raised as its
    /// declared error class.
    pub fn lift_return_value(&self, value: Option<FlatValue>, memory: &Memory, cx: &WasmContext) -> Result<Option<Value>, Error> {
        let Some(return_type) = &self.return_type else {
            return Ok(None);
        };
        let result = if self.returns_via_memory() {
            let ptr = pointer(value.as_ref())?;
            return_type.load(&memory.readonly(ptr, return_type.size())?, 0, cx)?
        } else {
            let value = value.ok_or(Trap::MissingFlatValue)?;
            return_type.lift_flat(memory, &mut std::iter::once(value), cx)?
        };
        match (return_type, result) {
            (TypeDesc::Result(_), Value::Result(Ok(payload))) => Ok(payload.map(|v| *v)),
            (TypeDesc::Result(ty), Value::Result(Err(payload))) => match ty.error_class() {
                Some(class) => Err(ResultError::new(class, payload.map(|v| *v)).into()),
                None => Err(Trap::MissingErrorClass.into()),
            },
            (_, value) => Ok(Some(value)),
        }
    }

    /// Split the flat arguments of an imported call into lifted parameters
    /// and the caller's out-pointer.
    pub fn get_param_values_for_host_call(&self, params: &[FlatValue], memory: &Memory, cx: &WasmContext) -> Result<(Vec<Value>, Option<u32>), Trap> {
        let out = self.out_pointer(params)?;
        Ok((self.lift_param_values(params, memory, cx)?, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::BumpMemory;

    fn numbered(count: usize, ty: TypeDesc) -> Vec<(String, TypeDesc)> {
        (0..count).map(|i| (format!("p{}", i), ty.clone())).collect()
    }

    #[test]
    fn test_seventeen_params_spill() {
        let cx = WasmContext::default();
        let memory = Memory::new(BumpMemory::new()).unwrap();
        let callable = Callable::function("wide", numbered(17, TypeDesc::U32), None);
        assert!(callable.spills_params());

        let values: Vec<Value> = (0..17u32).map(Value::U32).collect();
        let flat = callable.lower_param_values(&values, &memory, &cx).unwrap();
        assert_eq!(flat.len(), 1);
        assert_eq!(callable.lift_param_values(&flat, &memory, &cx).unwrap(), values);
    }

    #[test]
    fn test_sixteen_params_stay_flat() {
        let callable = Callable::function("narrow", numbered(16, TypeDesc::U32), None);
        assert!(!callable.spills_params());
    }

    #[test]
    fn test_out_pointer_detected() {
        let cx = WasmContext::default();
        let memory = Memory::new(BumpMemory::new()).unwrap();
        let callable = Callable::function("name", vec![("id".to_string(), TypeDesc::U32)], Some(TypeDesc::String));
        let out = memory.alloc(4, 8).unwrap();
        let (values, ptr) = callable
            .get_param_values_for_host_call(&[FlatValue::I32(3), FlatValue::I32(out.ptr())], &memory, &cx)
            .unwrap();
        assert_eq!(values, vec![Value::U32(3)]);
        assert_eq!(ptr, Some(out.ptr()));

        let lowered = callable.lower_return_value(Some(Value::from("x")), &memory, &cx, ptr).unwrap();
        assert_eq!(lowered, None);
        assert_eq!(TypeDesc::String.load(&out.as_readonly(), 0, &cx).unwrap(), Value::from("x"));
    }

    #[test]
    fn test_declared_error_becomes_result_case() {
        let cx = WasmContext::default();
        let memory = Memory::new(BumpMemory::new()).unwrap();
        let ret = TypeDesc::result_with_error_class(Some(TypeDesc::U32), Some(TypeDesc::U32), "FsError");
        let callable = Callable::function("open", Vec::new(), Some(ret));

        let flat = callable
            .handle_error(Error::declared("FsError", Some(Value::U32(2))), &memory, &cx, None)
            .unwrap();
        let lifted = callable.lift_return_value(flat, &memory, &cx).unwrap_err();
        assert!(lifted.as_declared("FsError").is_some());

        let other = callable.handle_error(Error::service("disk on fire"), &memory, &cx, None);
        assert!(matches!(other, Err(Error::Service(_))));
    }

    #[test]
    fn test_error_result_without_class_traps() {
        let cx = WasmContext::default();
        let memory = Memory::new(BumpMemory::new()).unwrap();
        let callable = Callable::function("f", Vec::new(), Some(TypeDesc::result(None, None)));
        let err = callable.lift_return_value(Some(FlatValue::I32(1)), &memory, &cx).unwrap_err();
        assert!(matches!(err, Error::Abi(Trap::MissingErrorClass)));
    }
}
