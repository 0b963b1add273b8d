use crate::host::{link_entry_points, link_error, wrapped_failure, BridgeState, HostContext};
use crate::trap::map_trap;
use handoff_core::boundary::checked_range;
use handoff_core::error::{E_ALREADY_INITIALIZED, E_MISSING_EXPORT, E_NOT_INITIALIZED};
use handoff_core::{
    bridge_error, Binding, Boundary, BridgeConfig, BridgeError, Codec, Handle, HandleTable,
    HostValue,
};
use tracing::{debug, trace, warn};
use wasmtime::{
    Engine, FuncType, Instance, IntoFunc, Linker, Memory, Module, Store, Val, ValType, WasmParams,
    WasmResults,
};

struct Bound {
    instance: Instance,
    memory: Memory,
}

/// Owns one module instance and the handle table it shares with the host.
///
/// Construction links the protocol entry points; host functions are added with
/// [`Bridge::expose`] and [`Bridge::wrap`]; [`Bridge::initialize`] then binds
/// the module exactly once.
pub struct Bridge<T> {
    engine: Engine,
    linker: Linker<BridgeState<T>>,
    store: Store<BridgeState<T>>,
    config: BridgeConfig,
    bound: Option<Bound>,
}

impl<T: 'static> Bridge<T> {
    pub fn new(config: BridgeConfig, data: T) -> Result<Self, BridgeError> {
        Self::with_engine(Engine::default(), config, data)
    }

    pub fn with_engine(engine: Engine, config: BridgeConfig, data: T) -> Result<Self, BridgeError> {
        config.validate()?;
        let mut linker = Linker::new(&engine);
        link_entry_points(&mut linker, &config)?;
        let store = Store::new(&engine, BridgeState::new(&config, data));
        debug!(import_module = %config.import_module, "bridge created");
        Ok(Self {
            engine,
            linker,
            store,
            config,
            bound: None,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn data(&self) -> &T {
        &self.store.data().data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.store.data_mut().data
    }

    pub fn is_initialized(&self) -> bool {
        self.bound.is_some()
    }

    pub fn live_handles(&self) -> usize {
        self.store.data().handles.len()
    }

    /// Registers a host function with plain numeric arguments and results.
    pub fn expose<Params, Args>(
        &mut self,
        name: &str,
        func: impl IntoFunc<BridgeState<T>, Params, Args>,
    ) -> Result<&mut Self, BridgeError> {
        self.ensure_unbound(name)?;
        self.linker
            .func_wrap(&self.config.import_module, name, func)
            .map_err(|err| link_error(name, err))?;
        debug!(import = name, "exposed host function");
        Ok(self)
    }

    /// Registers a host function whose result is stored in the handle table;
    /// the module receives the handle as a single `i32`.
    pub fn wrap<F>(
        &mut self,
        name: &str,
        params: &[ValType],
        func: F,
    ) -> Result<&mut Self, BridgeError>
    where
        F: Fn(&mut HostContext<'_, T>, &[Val]) -> Result<HostValue, BridgeError>
            + Send
            + Sync
            + 'static,
    {
        self.ensure_unbound(name)?;
        let ty = FuncType::new(&self.engine, params.iter().cloned(), [ValType::I32]);
        let import = name.to_string();
        self.linker
            .func_new(
                &self.config.import_module,
                name,
                ty,
                move |caller, args, results| {
                    let mut context = HostContext::new(caller);
                    let value = func(&mut context, args).map_err(|err| wrapped_failure(&import, err))?;
                    let handle = context.store(value);
                    trace!(import = %import, %handle, "stored wrapped result");
                    results[0] = Val::I32(handle.as_u32() as i32);
                    Ok(())
                },
            )
            .map_err(|err| link_error(name, err))?;
        debug!(import = name, "wrapped host function");
        Ok(self)
    }

    pub fn bind<C: Codec>(&self, codec: C) -> Binding<C> {
        Binding::new(codec)
    }

    /// Compiles and links the module image (binary or text format), then
    /// captures its memory. A bridge is bound at most once.
    pub fn initialize(&mut self, image: impl AsRef<[u8]>) -> Result<(), BridgeError> {
        if self.bound.is_some() {
            return Err(bridge_error(
                E_ALREADY_INITIALIZED,
                "bridge is already bound to a module",
            ));
        }
        let module = Module::new(&self.engine, image.as_ref())
            .map_err(|err| map_trap(err, "WASM compile error"))?;
        let instance = self
            .linker
            .instantiate(&mut self.store, &module)
            .map_err(|err| map_trap(err, "WASM instantiation error"))?;
        let memory = instance
            .get_memory(&mut self.store, &self.config.memory_export)
            .ok_or_else(|| {
                bridge_error(
                    E_MISSING_EXPORT,
                    format!("module does not export memory '{}'", self.config.memory_export),
                )
            })?;
        debug!(
            memory_bytes = memory.data_size(&self.store),
            "module bound"
        );
        self.bound = Some(Bound { instance, memory });
        Ok(())
    }

    pub fn call<Params, Results>(
        &mut self,
        name: &str,
        params: Params,
    ) -> Result<Results, BridgeError>
    where
        Params: WasmParams,
        Results: WasmResults,
    {
        let instance = self.bound()?.instance;
        let func = instance
            .get_typed_func::<Params, Results>(&mut self.store, name)
            .map_err(|err| {
                bridge_error(E_MISSING_EXPORT, format!("export '{name}' unavailable: {err}"))
            })?;
        trace!(export = name, "calling module");
        func.call(&mut self.store, params)
            .map_err(|err| map_trap(err, "WASM runtime error"))
    }

    /// Lends `value` to the module for the duration of one call. The module is
    /// expected to consume the handle; if the call fails the slot is reclaimed.
    pub fn call_with_value<Results: WasmResults>(
        &mut self,
        name: &str,
        value: HostValue,
    ) -> Result<Results, BridgeError> {
        self.ready()?;
        let handle = self.store(value);
        let result = self.call::<u32, Results>(name, handle.as_u32());
        if result.is_err() && self.handles().contains(handle) {
            warn!(export = name, %handle, "reclaiming handle after failed call");
            self.store.data_mut().handles.pop(handle)?;
        }
        result
    }

    /// Calls an export that returns a handle and takes the value under it.
    pub fn call_returning_value<Params: WasmParams>(
        &mut self,
        name: &str,
        params: Params,
    ) -> Result<HostValue, BridgeError> {
        let handle = self.call::<Params, u32>(name, params)?;
        self.take(Handle::from_u32(handle))
    }

    pub fn take(&mut self, handle: Handle) -> Result<HostValue, BridgeError> {
        self.handles_mut().pop(handle)
    }

    fn bound(&self) -> Result<&Bound, BridgeError> {
        self.bound.as_ref().ok_or_else(|| {
            bridge_error(E_NOT_INITIALIZED, "bridge is not bound to a module yet")
        })
    }

    fn ensure_unbound(&self, name: &str) -> Result<(), BridgeError> {
        if self.bound.is_some() {
            return Err(bridge_error(
                E_ALREADY_INITIALIZED,
                format!("cannot register '{name}' after the module is bound"),
            ));
        }
        Ok(())
    }
}

impl<T: 'static> Boundary for Bridge<T> {
    fn handles(&self) -> &HandleTable<HostValue> {
        &self.store.data().handles
    }

    fn handles_mut(&mut self) -> &mut HandleTable<HostValue> {
        &mut self.store.data_mut().handles
    }

    fn ready(&self) -> Result<(), BridgeError> {
        self.bound().map(drop)
    }

    fn memory(&self) -> Result<&[u8], BridgeError> {
        let memory = self.bound()?.memory;
        Ok(memory.data(&self.store))
    }

    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), BridgeError> {
        let memory = self.bound()?.memory;
        let data = memory.data_mut(&mut self.store);
        let range = checked_range(ptr, bytes.len() as u32, data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Caller;
    use handoff_core::error::{E_CODEC, E_HANDLE_NOT_FOUND, E_MODULE, E_NOT_BYTES, E_OUT_OF_BOUNDS};
    use handoff_core::{JsonCodec, Utf8Codec};

    const DEMO: &str = include_str!("../../../demos/bridge_demo.wat");

    type Log = Vec<String>;

    fn unbound_demo() -> Bridge<Log> {
        let mut bridge = Bridge::new(BridgeConfig::default(), Vec::new()).unwrap();
        bridge
            .expose(
                "consoleLog",
                |caller: Caller<'_, BridgeState<Log>>, ptr: u32, len: u32| -> anyhow::Result<()> {
                    let mut context = HostContext::new(caller);
                    let text = Binding::new(Utf8Codec).read_and_deserialize(&context, ptr, len)?;
                    context.data_mut().push(text);
                    Ok(())
                },
            )
            .unwrap()
            .wrap("sampleDat", &[], |_, _| Ok(HostValue::from([43u8, 55, 67])))
            .unwrap();
        bridge
    }

    fn demo() -> Bridge<Log> {
        let mut bridge = unbound_demo();
        bridge.initialize(DEMO).unwrap();
        bridge
    }

    #[test]
    fn main_logs_text_and_sample_bytes() {
        let mut bridge = demo();
        bridge.call::<(), ()>("main", ()).unwrap();
        assert_eq!(bridge.data(), &vec!["hello".to_string(), "+7C".to_string()]);
        assert_eq!(bridge.live_handles(), 0);
    }

    #[test]
    fn sample_handle_is_pulled_through_length_and_copy() {
        let mut bridge = demo();
        let h0 = bridge.call::<(), u32>("fetch_sample", ()).unwrap();
        assert_eq!(bridge.call::<u32, u32>("length", h0).unwrap(), 3);

        let addr = bridge.call::<u32, u32>("alloc", 3).unwrap();
        bridge.call::<(u32, u32), ()>("copy", (h0, addr)).unwrap();
        assert_eq!(bridge.read(addr, 3).unwrap(), &[43, 55, 67]);

        let h0 = Handle::from_u32(h0);
        assert_eq!(bridge.handles().peek(h0).unwrap_err().code, E_HANDLE_NOT_FOUND);
        assert_eq!(bridge.take(h0).unwrap_err().code, E_HANDLE_NOT_FOUND);
        let err = bridge.call::<u32, u32>("length", h0.as_u32()).unwrap_err();
        assert_eq!(err.code, E_HANDLE_NOT_FOUND);
    }

    #[test]
    fn release_frees_the_slot_without_copying() {
        let mut bridge = demo();
        let handle = bridge.call::<(), u32>("fetch_sample", ()).unwrap();
        assert_eq!(bridge.live_handles(), 1);
        bridge.call::<u32, ()>("release", handle).unwrap();
        assert_eq!(bridge.live_handles(), 0);
        let err = bridge.call::<u32, ()>("release", handle).unwrap_err();
        assert_eq!(err.code, E_HANDLE_NOT_FOUND);
    }

    #[test]
    fn unconsumed_handles_stay_live() {
        let mut bridge = demo();
        let a = bridge.call::<(), u32>("fetch_sample", ()).unwrap();
        let b = bridge.call::<(), u32>("fetch_sample", ()).unwrap();
        assert_ne!(a, b);
        assert_eq!(bridge.live_handles(), 2);
    }

    #[test]
    fn double_copy_traps_with_handle_not_found() {
        let mut bridge = demo();
        let handle = bridge.call::<(), u32>("fetch_sample", ()).unwrap();
        let err = bridge.call::<u32, ()>("copy_twice", handle).unwrap_err();
        assert_eq!(err.code, E_HANDLE_NOT_FOUND);
        assert_eq!(bridge.read(2048, 3).unwrap(), &[43, 55, 67]);
    }

    #[test]
    fn copy_out_of_bounds_is_reported() {
        let mut bridge = demo();
        let handle = bridge.call::<(), u32>("fetch_sample", ()).unwrap();
        let err = bridge
            .call::<(u32, u32), ()>("copy", (handle, 65_535))
            .unwrap_err();
        assert_eq!(err.code, E_OUT_OF_BOUNDS);
    }

    #[test]
    fn module_text_is_read_through_the_codec() {
        let mut bridge = demo();
        let utf8 = bridge.bind(Utf8Codec);
        assert_eq!(utf8.read_and_deserialize(&bridge, 16, 5).unwrap(), "hello");

        bridge.write(16, &[0xc3, 0x28]).unwrap();
        let err = utf8.read_and_deserialize(&bridge, 16, 2).unwrap_err();
        assert_eq!(err.code, E_CODEC);
    }

    #[test]
    fn host_text_is_lent_to_the_module() {
        let mut bridge = demo();
        let utf8 = bridge.bind(Utf8Codec);
        let handle = utf8
            .serialize_and_store(&mut bridge, &"from the host".to_string())
            .unwrap();
        let len = bridge.call::<u32, u32>("log_handle", handle.as_u32()).unwrap();
        assert_eq!(len, 13);
        assert_eq!(bridge.data().last().map(String::as_str), Some("from the host"));
        assert_eq!(bridge.live_handles(), 0);
    }

    #[test]
    fn call_with_value_passes_a_handle() {
        let mut bridge = demo();
        let len: u32 = bridge
            .call_with_value("log_handle", HostValue::from(b"ping".to_vec()))
            .unwrap();
        assert_eq!(len, 4);
        assert_eq!(bridge.data(), &vec!["ping".to_string()]);
        assert_eq!(bridge.live_handles(), 0);
    }

    #[test]
    fn call_with_value_reclaims_after_a_trap() {
        let mut bridge = demo();
        let err = bridge
            .call_with_value::<u32>("log_handle", HostValue::object(3u8))
            .unwrap_err();
        assert_eq!(err.code, E_NOT_BYTES);
        assert_eq!(bridge.live_handles(), 0);
    }

    #[test]
    fn echoed_handles_are_taken_by_the_host() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Job {
            id: u32,
            name: String,
        }

        let mut bridge = demo();
        let json = bridge.bind(JsonCodec::<Job>::new());
        let job = Job {
            id: 7,
            name: "resize".to_string(),
        };
        let handle = json.serialize_and_store(&mut bridge, &job).unwrap();
        let echoed = bridge.call::<u32, u32>("echo", handle.as_u32()).unwrap();
        assert_eq!(
            json.take_and_deserialize(&mut bridge, Handle::from_u32(echoed))
                .unwrap(),
            job
        );
        assert_eq!(bridge.live_handles(), 0);
    }

    #[test]
    fn call_returning_value_pops_the_handle() {
        let mut bridge = demo();
        let handle = bridge.store(HostValue::object(String::from("connection")));
        let value = bridge
            .call_returning_value("echo", handle.as_u32())
            .unwrap();
        assert_eq!(value.downcast::<String>().unwrap(), "connection");
        assert_eq!(bridge.live_handles(), 0);
    }

    #[test]
    fn reads_follow_memory_growth() {
        let mut bridge = demo();
        assert_eq!(bridge.read(65_536, 4).unwrap_err().code, E_OUT_OF_BOUNDS);
        let previous = bridge.call::<u32, i32>("grow", 1).unwrap();
        assert_eq!(previous, 1);
        assert_eq!(bridge.read(65_536, 4).unwrap(), &[0, 0, 0, 0]);
        assert_eq!(bridge.memory().unwrap().len(), 2 * 65_536);
    }

    #[test]
    fn wrapped_failures_surface_to_the_caller() {
        let mut bridge = Bridge::new(BridgeConfig::default(), Vec::<String>::new()).unwrap();
        bridge
            .expose("consoleLog", |_: u32, _: u32| {})
            .unwrap()
            .wrap("sampleDat", &[], |_, _| {
                Err(bridge_error(E_CODEC, "sample unavailable"))
            })
            .unwrap();
        bridge.initialize(DEMO).unwrap();
        let err = bridge.call::<(), u32>("fetch_sample", ()).unwrap_err();
        assert_eq!(err.code, E_CODEC);
        assert_eq!(err.message, "sample unavailable");
    }

    #[test]
    fn wrapped_functions_receive_arguments() {
        let module = r#"
            (module
              (import "env" "repeat" (func $repeat (param i32 i32) (result i32)))
              (memory (export "memory") 1)
              (func (export "run") (result i32)
                i32.const 120
                i32.const 4
                call $repeat))
        "#;
        let mut bridge = Bridge::new(BridgeConfig::default(), ()).unwrap();
        bridge
            .wrap("repeat", &[ValType::I32, ValType::I32], |_, args| {
                let (Some(byte), Some(count)) = (args[0].i32(), args[1].i32()) else {
                    return Err(bridge_error(E_MODULE, "expected i32 arguments"));
                };
                Ok(HostValue::from(vec![byte as u8; count as usize]))
            })
            .unwrap();
        bridge.initialize(module).unwrap();
        let value = bridge.call_returning_value("run", ()).unwrap();
        assert_eq!(value.into_bytes().unwrap(), b"xxxx".to_vec());
    }

    #[test]
    fn custom_import_names_are_honoured() {
        let module = r#"
            (module
              (import "host" "size_of" (func $len (param i32) (result i32)))
              (import "host" "take" (func $copy (param i32 i32)))
              (import "host" "drop" (func $release (param i32)))
              (memory (export "heap") 1)
              (func (export "size") (param i32) (result i32)
                local.get 0
                call $len))
        "#;
        let config = BridgeConfig::from_json_str(
            r#"{"import_module": "host", "memory_export": "heap",
                "length_import": "size_of", "copy_import": "take", "release_import": "drop"}"#,
        )
        .unwrap();
        let mut bridge = Bridge::new(config, ()).unwrap();
        bridge.initialize(module).unwrap();
        let handle = bridge.store(HostValue::from(vec![0u8; 9]));
        assert_eq!(bridge.call::<u32, u32>("size", handle.as_u32()).unwrap(), 9);
        assert_eq!(bridge.length(handle).unwrap(), 9);
    }

    #[test]
    fn second_initialize_is_refused() {
        let mut bridge = demo();
        let err = bridge.initialize(DEMO).unwrap_err();
        assert_eq!(err.code, E_ALREADY_INITIALIZED);
        assert!(bridge.is_initialized());
    }

    #[test]
    fn registration_after_binding_is_refused() {
        let mut bridge = demo();
        let err = bridge.expose("late", |_: u32| {}).err().unwrap();
        assert_eq!(err.code, E_ALREADY_INITIALIZED);
        let err = bridge
            .wrap("late_wrapped", &[], |_, _| Ok(HostValue::from(Vec::<u8>::new())))
            .err()
            .unwrap();
        assert_eq!(err.code, E_ALREADY_INITIALIZED);
    }

    #[test]
    fn operations_before_initialize_fail() {
        let mut bridge = unbound_demo();
        assert_eq!(bridge.call::<(), ()>("main", ()).unwrap_err().code, E_NOT_INITIALIZED);
        assert_eq!(bridge.read(0, 1).unwrap_err().code, E_NOT_INITIALIZED);
        assert_eq!(bridge.write(0, b"x").unwrap_err().code, E_NOT_INITIALIZED);
        let handle = bridge.store(HostValue::from(vec![1u8]));
        assert_eq!(bridge.length(handle).unwrap_err().code, E_NOT_INITIALIZED);
        assert_eq!(bridge.copy(handle, 0).unwrap_err().code, E_NOT_INITIALIZED);
        assert_eq!(bridge.release(handle).unwrap_err().code, E_NOT_INITIALIZED);
        assert_eq!(
            bridge
                .call_with_value::<u32>("log_handle", HostValue::from(Vec::<u8>::new()))
                .unwrap_err()
                .code,
            E_NOT_INITIALIZED
        );
        assert!(!bridge.is_initialized());
    }

    #[test]
    fn missing_imports_fail_to_link() {
        let mut bridge = Bridge::new(BridgeConfig::default(), ()).unwrap();
        let err = bridge.initialize(DEMO).unwrap_err();
        assert_eq!(err.code, E_MODULE);
        assert!(err.message.starts_with("WASM instantiation error"), "{}", err.message);
        assert!(!bridge.is_initialized());
    }

    #[test]
    fn missing_memory_export_is_reported() {
        let mut bridge = Bridge::new(BridgeConfig::default(), ()).unwrap();
        let err = bridge.initialize("(module)").unwrap_err();
        assert_eq!(err.code, E_MISSING_EXPORT);
        assert!(!bridge.is_initialized());
    }

    #[test]
    fn missing_function_export_is_reported() {
        let mut bridge = demo();
        let err = bridge.call::<(), ()>("absent", ()).unwrap_err();
        assert_eq!(err.code, E_MISSING_EXPORT);
    }
}
