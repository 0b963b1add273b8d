//! Serialize/deserialize pairs for values that cross the boundary as bytes.

use crate::error::{bridge_error, BridgeError, E_CODEC};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

pub trait Codec {
    type Value;

    fn serialize(&self, value: &Self::Value) -> Result<Vec<u8>, BridgeError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Value, BridgeError>;
}

/// UTF-8 text. Invalid input is an error, never replaced.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec for Utf8Codec {
    type Value = String;

    fn serialize(&self, value: &String) -> Result<Vec<u8>, BridgeError> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String, BridgeError> {
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|err| bridge_error(E_CODEC, format!("invalid UTF-8: {err}")))
    }
}

pub struct JsonCodec<T> {
    marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JsonCodec<{}>", std::any::type_name::<T>())
    }
}

impl<T: Serialize + DeserializeOwned> Codec for JsonCodec<T> {
    type Value = T;

    fn serialize(&self, value: &T) -> Result<Vec<u8>, BridgeError> {
        serde_json::to_vec(value)
            .map_err(|err| bridge_error(E_CODEC, format!("JSON encode error: {err}")))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, BridgeError> {
        serde_json::from_slice(bytes)
            .map_err(|err| bridge_error(E_CODEC, format!("JSON decode error: {err}")))
    }
}
