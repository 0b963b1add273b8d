//! wasmtime bridge for the handoff calling convention.

mod bridge;
mod host;
mod trap;

pub use bridge::Bridge;
pub use host::{BridgeState, HostContext};

pub use handoff_core::{Binding, Boundary, BridgeConfig, BridgeError, Handle, HostValue};
pub use wasmtime::{Caller, Engine, Val, ValType};
