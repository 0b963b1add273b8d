use handoff_core::error::E_MODULE;
use handoff_core::{bridge_error, BridgeError};

/// Recovers the `BridgeError` a host import trapped with, if any; everything
/// else becomes a module error.
pub(crate) fn map_trap(err: anyhow::Error, default_message: &str) -> BridgeError {
    if let Some(bridge) = err.downcast_ref::<BridgeError>() {
        return bridge.clone();
    }
    for cause in err.chain() {
        if let Some(bridge) = cause.downcast_ref::<BridgeError>() {
            return bridge.clone();
        }
    }
    if let Some(trap) = err.downcast_ref::<wasmtime::Trap>() {
        return bridge_error(E_MODULE, format!("{default_message}: {trap}"));
    }
    bridge_error(E_MODULE, format!("{default_message}: {err}"))
}
