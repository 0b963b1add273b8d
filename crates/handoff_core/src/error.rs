use serde::Serialize;
use thiserror::Error;

pub const E_HANDLE_NOT_FOUND: &str = "E0601";
pub const E_NOT_INITIALIZED: &str = "E0602";
pub const E_ALREADY_INITIALIZED: &str = "E0603";
pub const E_CODEC: &str = "E0604";
pub const E_OUT_OF_BOUNDS: &str = "E0605";
pub const E_MODULE: &str = "E0606";
pub const E_NOT_BYTES: &str = "E0607";
pub const E_MISSING_EXPORT: &str = "E0608";
pub const E_CONFIG: &str = "E0609";

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{code}: {message}")]
pub struct BridgeError {
    pub code: &'static str,
    pub message: String,
}

pub fn bridge_error(code: &'static str, message: impl Into<String>) -> BridgeError {
    BridgeError {
        code,
        message: message.into(),
    }
}

impl BridgeError {
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}
