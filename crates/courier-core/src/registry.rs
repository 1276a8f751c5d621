//! Callback handle registry.
//!
//! Callbacks cannot cross a channel, so on the way out each one is replaced
//! by a `{"--courier-handle": id}` placeholder and remembered here. On the way
//! in, placeholders are turned back into callbacks that forward their
//! invocations to the peer.

use crate::config::ProtocolConfig;
use crate::value::{Callback, CallbackId, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Opaque identifier standing in for a callback on the wire.
pub type Handle = u64;

/// Builds the local proxy for a handle received from the peer.
pub type Hydrator = Arc<dyn Fn(Handle) -> Callback + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    next_handle: Handle,
    handles_by_callback: HashMap<CallbackId, Handle>,
    callbacks_by_handle: HashMap<Handle, Callback>,
}

/// Bidirectional callback ↔ handle mapping, scoped to one connection.
pub struct HandleRegistry {
    state: Mutex<RegistryState>,
    hydrate: Hydrator,
}

impl HandleRegistry {
    /// Create a registry whose incoming handles are materialized by `hydrate`.
    pub fn new(hydrate: Hydrator) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            hydrate,
        }
    }

    /// Replace every callback in `value` with a handle placeholder.
    pub fn dehydrate(&self, value: &Value) -> serde_json::Value {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(|item| self.dehydrate(item)).collect())
            }
            Value::Record(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (key, field) in fields {
                    map.insert(key.clone(), self.dehydrate(field));
                }
                serde_json::Value::Object(map)
            }
            Value::Callback(callback) => handle_placeholder(self.lookup_or_register(callback)),
            Value::Opaque(raw) => raw.clone(),
        }
    }

    /// Dehydrate an argument list into a wire array.
    pub fn dehydrate_args(&self, args: &[Value]) -> serde_json::Value {
        serde_json::Value::Array(args.iter().map(|arg| self.dehydrate(arg)).collect())
    }

    /// Replace every handle placeholder in `payload` with a callable proxy.
    pub fn rehydrate(&self, payload: &serde_json::Value) -> Value {
        match payload {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(|item| self.rehydrate(item)).collect())
            }
            serde_json::Value::Object(map) => {
                if let Some(handle) = placeholder_handle(map) {
                    return Value::Callback((self.hydrate)(handle));
                }
                Value::Record(
                    map.iter()
                        .map(|(key, field)| (key.clone(), self.rehydrate(field)))
                        .collect(),
                )
            }
        }
    }

    /// Get the handle assigned to `callback`, if it has been dehydrated.
    pub fn lookup_handle(&self, callback: &Callback) -> Option<Handle> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.handles_by_callback.get(&callback.id()).copied()
    }

    /// Get the callback registered under `handle`.
    pub fn lookup_callback(&self, handle: Handle) -> Option<Callback> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.callbacks_by_handle.get(&handle).cloned()
    }

    /// Forget `callback`. Its handle is retired and never handed out again.
    pub fn release(&self, callback: &Callback) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = state.handles_by_callback.remove(&callback.id()) {
            state.callbacks_by_handle.remove(&handle);
            debug!("Released callback handle {}", handle);
        }
    }

    /// Drop every registered callback.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.handles_by_callback.clear();
        state.callbacks_by_handle.clear();
    }

    /// Number of callbacks currently registered.
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.callbacks_by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup_or_register(&self, callback: &Callback) -> Handle {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = state.handles_by_callback.get(&callback.id()) {
            return *handle;
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.handles_by_callback.insert(callback.id(), handle);
        state.callbacks_by_handle.insert(handle, callback.clone());
        handle
    }
}

fn handle_placeholder(handle: Handle) -> serde_json::Value {
    let mut map = serde_json::Map::with_capacity(1);
    map.insert(ProtocolConfig::HANDLE_KEY.to_string(), handle.into());
    serde_json::Value::Object(map)
}

fn placeholder_handle(map: &serde_json::Map<String, serde_json::Value>) -> Option<Handle> {
    map.get(ProtocolConfig::HANDLE_KEY).and_then(serde_json::Value::as_u64)
}
