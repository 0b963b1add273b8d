//! The length/copy/release protocol, written against an abstract linear memory.

use crate::codec::Codec;
use crate::error::{bridge_error, BridgeError, E_NOT_BYTES, E_OUT_OF_BOUNDS};
use crate::handle::{Handle, HandleTable};
use crate::value::HostValue;

/// One side of a host/module boundary: a handle table plus borrowed access to
/// the module's memory.
///
/// Views returned by `read` borrow `self`, so they cannot outlive the call
/// that produced them or survive anything that may run module code.
pub trait Boundary {
    fn handles(&self) -> &HandleTable<HostValue>;

    fn handles_mut(&mut self) -> &mut HandleTable<HostValue>;

    fn memory(&self) -> Result<&[u8], BridgeError>;

    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), BridgeError>;

    /// Fails while the module side is not available yet.
    fn ready(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    fn read(&self, ptr: u32, len: u32) -> Result<&[u8], BridgeError> {
        self.ready()?;
        let data = self.memory()?;
        let range = checked_range(ptr, len, data.len())?;
        Ok(&data[range])
    }

    fn store(&mut self, value: HostValue) -> Handle {
        self.handles_mut().store(value)
    }

    /// Byte length of a live value. Does not consume the handle.
    fn length(&self, handle: Handle) -> Result<u32, BridgeError> {
        self.ready()?;
        let len = self.handles().peek(handle)?.byte_len()?;
        u32::try_from(len).map_err(|_| {
            bridge_error(
                E_OUT_OF_BOUNDS,
                format!("value under {handle} is {len} bytes, too large for the module"),
            )
        })
    }

    /// Consumes the handle and writes its bytes at `dest`.
    fn copy(&mut self, handle: Handle, dest: u32) -> Result<(), BridgeError> {
        self.ready()?;
        if self.handles().peek(handle)?.as_bytes().is_none() {
            return Err(bridge_error(
                E_NOT_BYTES,
                format!("value under {handle} is an opaque object and cannot be copied"),
            ));
        }
        let bytes = self.handles_mut().pop(handle)?.into_bytes()?;
        self.write(dest, &bytes)
    }

    fn release(&mut self, handle: Handle) -> Result<(), BridgeError> {
        self.ready()?;
        self.handles_mut().pop(handle).map(drop)
    }
}

pub fn checked_range(
    ptr: u32,
    len: u32,
    memory_len: usize,
) -> Result<std::ops::Range<usize>, BridgeError> {
    let start = ptr as usize;
    let end = start.checked_add(len as usize).filter(|end| *end <= memory_len);
    match end {
        Some(end) => Ok(start..end),
        None => Err(bridge_error(
            E_OUT_OF_BOUNDS,
            format!("range {ptr}+{len} is outside module memory of {memory_len} bytes"),
        )),
    }
}

/// Convenience operations derived from a codec.
#[derive(Debug, Clone, Default)]
pub struct Binding<C> {
    codec: C,
}

impl<C: Codec> Binding<C> {
    pub fn new(codec: C) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn serialize_and_store<B: Boundary + ?Sized>(
        &self,
        boundary: &mut B,
        value: &C::Value,
    ) -> Result<Handle, BridgeError> {
        let bytes = self.codec.serialize(value)?;
        Ok(boundary.store(HostValue::Bytes(bytes)))
    }

    pub fn read_and_deserialize<B: Boundary + ?Sized>(
        &self,
        boundary: &B,
        ptr: u32,
        len: u32,
    ) -> Result<C::Value, BridgeError> {
        self.codec.deserialize(boundary.read(ptr, len)?)
    }

    /// Pops a byte value handed back by the module and decodes it. The caller
    /// becomes the releaser of that handle.
    pub fn take_and_deserialize<B: Boundary + ?Sized>(
        &self,
        boundary: &mut B,
        handle: Handle,
    ) -> Result<C::Value, BridgeError> {
        let bytes = boundary.handles_mut().pop(handle)?.into_bytes()?;
        self.codec.deserialize(&bytes)
    }
}
