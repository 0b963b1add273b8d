//! Import-side access to the bridge: store data, entry points and `HostContext`.

use handoff_core::boundary::checked_range;
use handoff_core::error::{E_MISSING_EXPORT, E_MODULE};
use handoff_core::{bridge_error, Boundary, BridgeConfig, BridgeError, Handle, HandleTable, HostValue};
use tracing::{trace, warn};
use wasmtime::{Caller, Extern, Linker, Memory};

/// Data kept in the wasmtime store: the handle table next to the host's own state.
pub struct BridgeState<T> {
    pub(crate) handles: HandleTable<HostValue>,
    pub(crate) memory_export: String,
    pub(crate) data: T,
}

impl<T> BridgeState<T> {
    pub(crate) fn new(config: &BridgeConfig, data: T) -> Self {
        Self {
            handles: HandleTable::new(),
            memory_export: config.memory_export.clone(),
            data,
        }
    }
}

/// What a host import sees of the bridge during a module-to-host call.
pub struct HostContext<'a, T: 'static> {
    caller: Caller<'a, BridgeState<T>>,
    memory: Option<Memory>,
}

impl<'a, T: 'static> HostContext<'a, T> {
    pub fn new(mut caller: Caller<'a, BridgeState<T>>) -> Self {
        let name = caller.data().memory_export.clone();
        let memory = match caller.get_export(&name) {
            Some(Extern::Memory(memory)) => Some(memory),
            _ => None,
        };
        Self { caller, memory }
    }

    pub fn data(&self) -> &T {
        &self.caller.data().data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.caller.data_mut().data
    }

    fn exported_memory(&self) -> Result<Memory, BridgeError> {
        let name = &self.caller.data().memory_export;
        self.memory.ok_or_else(|| {
            bridge_error(E_MISSING_EXPORT, format!("module does not export memory '{name}'"))
        })
    }
}

impl<T: 'static> Boundary for HostContext<'_, T> {
    fn handles(&self) -> &HandleTable<HostValue> {
        &self.caller.data().handles
    }

    fn handles_mut(&mut self) -> &mut HandleTable<HostValue> {
        &mut self.caller.data_mut().handles
    }

    fn memory(&self) -> Result<&[u8], BridgeError> {
        let memory = self.exported_memory()?;
        Ok(memory.data(&self.caller))
    }

    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), BridgeError> {
        let memory = self.exported_memory()?;
        let data = memory.data_mut(&mut self.caller);
        let range = checked_range(ptr, bytes.len() as u32, data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }
}

fn reject(step: &'static str, err: BridgeError) -> anyhow::Error {
    warn!(step, code = err.code, message = %err.message, "protocol violation");
    err.into()
}

/// Links `length`, `copy` and `release` under the configured import names.
pub(crate) fn link_entry_points<T: 'static>(
    linker: &mut Linker<BridgeState<T>>,
    config: &BridgeConfig,
) -> Result<(), BridgeError> {
    let module = config.import_module.as_str();
    linker
        .func_wrap(
            module,
            &config.length_import,
            |caller: Caller<'_, BridgeState<T>>, handle: u32| -> anyhow::Result<u32> {
                let context = HostContext::new(caller);
                let handle = Handle::from_u32(handle);
                let len = context.length(handle).map_err(|err| reject("length", err))?;
                trace!(%handle, len, "length");
                Ok(len)
            },
        )
        .map_err(|err| link_error(&config.length_import, err))?;
    linker
        .func_wrap(
            module,
            &config.copy_import,
            |caller: Caller<'_, BridgeState<T>>, handle: u32, dest: u32| -> anyhow::Result<()> {
                let mut context = HostContext::new(caller);
                let handle = Handle::from_u32(handle);
                context
                    .copy(handle, dest)
                    .map_err(|err| reject("copy", err))?;
                trace!(%handle, dest, "copy");
                Ok(())
            },
        )
        .map_err(|err| link_error(&config.copy_import, err))?;
    linker
        .func_wrap(
            module,
            &config.release_import,
            |caller: Caller<'_, BridgeState<T>>, handle: u32| -> anyhow::Result<()> {
                let mut context = HostContext::new(caller);
                let handle = Handle::from_u32(handle);
                context
                    .release(handle)
                    .map_err(|err| reject("release", err))?;
                trace!(%handle, "release");
                Ok(())
            },
        )
        .map_err(|err| link_error(&config.release_import, err))?;
    Ok(())
}

pub(crate) fn link_error(name: &str, err: anyhow::Error) -> BridgeError {
    bridge_error(E_MODULE, format!("failed to link import '{name}': {err}"))
}

pub(crate) fn wrapped_failure(name: &str, err: BridgeError) -> anyhow::Error {
    warn!(import = name, code = err.code, message = %err.message, "wrapped host function failed");
    err.into()
}
