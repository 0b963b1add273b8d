use crate::error::{bridge_error, BridgeError, E_NOT_BYTES};
use std::any::Any;
use std::fmt;

/// A host value held in the bridge's handle table.
///
/// Only `Bytes` can be pulled into module memory. An `Object` is opaque to the
/// module: it can hold the handle and pass it back, nothing more.
pub enum HostValue {
    Bytes(Vec<u8>),
    Object(Box<dyn Any + Send>),
}

impl HostValue {
    pub fn object<T: Any + Send>(value: T) -> Self {
        HostValue::Object(Box::new(value))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HostValue::Bytes(bytes) => Some(bytes),
            HostValue::Object(_) => None,
        }
    }

    pub fn byte_len(&self) -> Result<usize, BridgeError> {
        self.as_bytes().map(<[u8]>::len).ok_or_else(not_bytes)
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, BridgeError> {
        match self {
            HostValue::Bytes(bytes) => Ok(bytes),
            HostValue::Object(_) => Err(not_bytes()),
        }
    }

    pub fn downcast<T: Any>(self) -> Result<T, BridgeError> {
        match self {
            HostValue::Object(object) => object.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
                bridge_error(
                    E_NOT_BYTES,
                    format!("object is not a {}", std::any::type_name::<T>()),
                )
            }),
            HostValue::Bytes(_) => Err(bridge_error(
                E_NOT_BYTES,
                format!("expected object {}, found bytes", std::any::type_name::<T>()),
            )),
        }
    }
}

fn not_bytes() -> BridgeError {
    bridge_error(E_NOT_BYTES, "opaque host object has no byte representation")
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            HostValue::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(bytes: Vec<u8>) -> Self {
        HostValue::Bytes(bytes)
    }
}

impl From<&[u8]> for HostValue {
    fn from(bytes: &[u8]) -> Self {
        HostValue::Bytes(bytes.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for HostValue {
    fn from(bytes: [u8; N]) -> Self {
        HostValue::Bytes(bytes.to_vec())
    }
}
