//! handoff core: handle table, codecs and the boundary protocol.

pub mod boundary;
pub mod codec;
mod config;
pub mod error;
pub mod handle;
mod value;

use serde::Serialize;

pub use boundary::{Binding, Boundary};
pub use codec::{Codec, JsonCodec, Utf8Codec};
pub use config::BridgeConfig;
pub use error::{bridge_error, BridgeError};
pub use handle::{Handle, HandleTable};
pub use value::HostValue;

pub const TOOL_NAME: &str = "handoff";
pub const VERSION: &str = "0.1";

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub tool: &'static str,
    pub version: &'static str,
    pub ok: bool,
    pub entry: String,
    pub stdout: Vec<String>,
    pub live_handles: usize,
    pub error: Option<BridgeError>,
}

impl RunReport {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            tool: TOOL_NAME,
            version: VERSION,
            ok: false,
            entry: entry.into(),
            stdout: Vec::new(),
            live_handles: 0,
            error: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
