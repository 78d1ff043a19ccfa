//! Call flows across a bridge connection.
//!
//! On the worker, an import call is copied from the module memory into the
//! worker's connection buffer and relayed to main; an export call from main
//! is copied the other way before the module runs. On main, calls into the
//! worker are lowered straight into main's connection buffer.

use super::kinds::handle_param;
use super::{Callable, ParamTransfer, WasmFunction};
use crate::abi::{FlatValue, Memory, Trap, Value};
use crate::bridge::{MainConnection, WorkerConnection};
use crate::context::WasmContext;
use crate::error::Error;
use crate::logging::trace;

/// `qualifier#witName`, the name a call is registered under.
pub fn qualified_name(qualifier: &str, wit_name: &str) -> String {
    if qualifier.is_empty() {
        return wit_name.to_string();
    }
    format!("{}#{}", qualifier, wit_name)
}

impl Callable {
    /// Relay a module's import call to main and copy the answer back into
    /// the module memory.
    pub fn call_main(
        &self,
        connection: &WorkerConnection,
        qualifier: &str,
        params: &[FlatValue],
        cx: &WasmContext,
    ) -> Result<Option<FlatValue>, Error> {
        let wasm = cx.memory()?;
        connection.prepare_call();
        let transfer = connection.memory().memory();
        let ParamTransfer { params, storage } = self.copy_param_values(params, transfer, &wasm, cx)?;
        let result_type = if self.returns_via_memory() { None } else { self.flat_result_type() };
        let name = qualified_name(qualifier, self.wit_name());
        trace!(name = %name, next = connection.memory().next(), "parameters copied for main");
        let result = connection.call_main(&name, params, result_type)?;
        Ok(self.copy_return_value(storage.as_ref(), &wasm, transfer, result, cx)?)
    }

    /// Run an export for main. `transfer` holds the arguments and receives
    /// any result stored in memory.
    pub fn call_wasm_from_worker(
        &self,
        transfer: &Memory,
        func: &WasmFunction,
        params: &[FlatValue],
        cx: &WasmContext,
    ) -> Result<Option<FlatValue>, Error> {
        let wasm = cx.memory()?;
        let ParamTransfer { params, storage } = self.copy_param_values(params, &wasm, transfer, cx)?;
        let result = func(&params)?;
        Ok(self.copy_return_value(storage.as_ref(), transfer, &wasm, result, cx)?)
    }

    /// Like [`Callable::call_wasm_from_worker`] for a method. The first flat
    /// value is the receiver's representation and is passed through as is.
    pub fn call_wasm_method_from_worker(
        &self,
        transfer: &Memory,
        func: &WasmFunction,
        params: &[FlatValue],
        cx: &WasmContext,
    ) -> Result<Option<FlatValue>, Error> {
        let wasm = cx.memory()?;
        let (rep, rest) = handle_param(params)?;
        let ParamTransfer { params, storage } = self.copy_param_values(rest, &wasm, transfer, cx)?;
        let mut flat = Vec::with_capacity(params.len() + 1);
        flat.push(FlatValue::I32(rep));
        flat.extend(params);
        let result = func(&flat)?;
        Ok(self.copy_return_value(storage.as_ref(), transfer, &wasm, result, cx)?)
    }

    async fn relay_to_worker(
        &self,
        connection: &MainConnection,
        qualifier: &str,
        receiver: Option<u32>,
        params: &[Value],
        cx: &WasmContext,
    ) -> Result<Option<FlatValue>, Error> {
        connection.prepare_call();
        let memory = connection.memory().memory();
        let mut flat = Vec::with_capacity(params.len() + 1);
        if let Some(rep) = receiver {
            flat.push(FlatValue::I32(rep));
        }
        flat.extend(self.lower_param_values(params, memory, cx)?);
        let name = qualified_name(qualifier, self.wit_name());
        Ok(connection.call_worker(&name, flat).await?)
    }

    /// Call an export living in the worker.
    pub async fn call_worker(
        &self,
        connection: &MainConnection,
        qualifier: &str,
        params: &[Value],
        cx: &WasmContext,
    ) -> Result<Option<Value>, Error> {
        connection
            .lock(async {
                let result = self.relay_to_worker(connection, qualifier, None, params, cx).await?;
                self.lift_return_value(result, connection.memory().memory(), cx)
            })
            .await?
    }

    /// Call an exported method on the representation `rep` in the worker.
    pub async fn call_worker_method(
        &self,
        connection: &MainConnection,
        qualifier: &str,
        rep: u32,
        params: &[Value],
        cx: &WasmContext,
    ) -> Result<Option<Value>, Error> {
        connection
            .lock(async {
                let result = self.relay_to_worker(connection, qualifier, Some(rep), params, cx).await?;
                self.lift_return_value(result, connection.memory().memory(), cx)
            })
            .await?
    }

    /// Call an exported constructor in the worker and return its handle.
    pub async fn call_wasm_constructor_async(
        &self,
        connection: &MainConnection,
        qualifier: &str,
        params: &[Value],
        cx: &WasmContext,
    ) -> Result<u32, Error> {
        connection
            .lock(async {
                match self.relay_to_worker(connection, qualifier, None, params, cx).await? {
                    Some(value) => Ok(value.as_i32()?),
                    None => Err(Trap::MissingFlatValue.into()),
                }
            })
            .await?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::abi::{BumpMemory, TypeDesc};
    use crate::bridge::{ConnectionMemory, connect};
    use crate::platform::Platform;

    fn wasm_context() -> WasmContext {
        let memory = Memory::new(BumpMemory::new()).unwrap();
        WasmContext::with_memory(Default::default(), Default::default(), memory)
    }

    #[test]
    fn test_qualified_name() {
        assert_eq!(qualified_name("pkg:a/b", "f"), "pkg:a/b#f");
        assert_eq!(qualified_name("", "f"), "f");
    }

    #[test]
    fn test_export_result_is_copied_into_transfer_memory() {
        let cx = wasm_context();
        let transfer = ConnectionMemory::new(1024).unwrap();
        let callable = Callable::function("echo", vec![("s".to_string(), TypeDesc::String)], Some(TypeDesc::String));

        let args = callable.lower_param_values(&[Value::from("ping")], transfer.memory(), &cx).unwrap();
        let wasm = cx.memory().unwrap();
        let inner = callable.clone();
        let echo: WasmFunction = Arc::new(move |params: &[FlatValue]| -> Result<Option<FlatValue>, Error> {
            let wasm_cx = WasmContext::with_memory(Default::default(), Default::default(), wasm.clone());
            let values = inner.lift_param_values(params, &wasm, &wasm_cx)?;
            Ok(inner.lower_return_value(values.into_iter().next(), &wasm, &wasm_cx, None)?)
        });

        let result = callable.call_wasm_from_worker(transfer.memory(), &echo, &args, &cx).unwrap();
        let lifted = callable.lift_return_value(result, transfer.memory(), &cx).unwrap();
        assert_eq!(lifted, Some(Value::from("ping")));
    }

    #[test]
    fn test_call_main_times_out() {
        let cx = wasm_context();
        let (_main, worker) = connect(256, Arc::new(Platform::default())).unwrap();
        let worker = worker.with_timeout(std::time::Duration::from_millis(10));
        let callable = Callable::function("ping", Vec::new(), None);
        let err = callable.call_main(&worker, "pkg:a/b", &[], &cx).unwrap_err();
        assert!(err.is_protocol());
    }
}
