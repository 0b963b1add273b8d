//! Handle table for host values lent to a module.

use crate::error::{bridge_error, BridgeError, E_HANDLE_NOT_FOUND};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Handle(u32);

impl Handle {
    pub fn from_u32(value: u32) -> Self {
        Self(value)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Maps handles to owned values. A slot lives from `store` until the single
/// `pop` that removes it.
#[derive(Debug)]
pub struct HandleTable<V> {
    counter: u32,
    slots: HashMap<u32, V>,
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HandleTable<V> {
    pub fn new() -> Self {
        Self {
            counter: 0,
            slots: HashMap::new(),
        }
    }

    pub fn store(&mut self, value: V) -> Handle {
        let handle = self.next_free();
        self.slots.insert(handle, value);
        Handle(handle)
    }

    pub fn peek(&self, handle: Handle) -> Result<&V, BridgeError> {
        self.slots.get(&handle.0).ok_or_else(|| not_found(handle))
    }

    pub fn pop(&mut self, handle: Handle) -> Result<V, BridgeError> {
        self.slots.remove(&handle.0).ok_or_else(|| not_found(handle))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.slots.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    // Usually zero probes: the counter only lands on a live slot after wrapping.
    fn next_free(&mut self) -> u32 {
        while self.slots.contains_key(&self.counter) {
            self.counter = self.counter.wrapping_add(1);
        }
        let handle = self.counter;
        self.counter = self.counter.wrapping_add(1);
        handle
    }

    #[cfg(test)]
    fn with_counter(counter: u32) -> Self {
        Self {
            counter,
            slots: HashMap::new(),
        }
    }
}

fn not_found(handle: Handle) -> BridgeError {
    bridge_error(E_HANDLE_NOT_FOUND, format!("handle {handle} is not live"))
}
