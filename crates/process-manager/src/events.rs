//! Event router: per-process registry of named-event listeners.
//!
//! One handler per name; re-registration replaces. Each handler runs behind
//! its own dispatch lock, taken after the registration lock is released, so
//! dispatch for a given name is strictly sequential while handlers remain
//! free to call `on`/`emit`/`registered_names` on their own router.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

pub type EventHandler = Box<dyn FnMut(Value) + Send>;

#[derive(Default)]
pub struct EventRouter {
    handlers: Mutex<HashMap<String, Arc<Mutex<EventHandler>>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `name`, replacing any existing registration.
    /// A replaced handler that is mid-dispatch finishes its current call.
    pub fn on(&self, name: impl Into<String>, handler: impl FnMut(Value) + Send + 'static) {
        let mut handlers = self.lock();
        handlers.insert(name.into(), Arc::new(Mutex::new(Box::new(handler))));
    }

    /// Invoke the handler registered for `name`, if any. Unmatched names are
    /// dropped silently; returns whether a handler ran.
    pub fn emit(&self, name: &str, payload: Value) -> bool {
        let handler = self.lock().get(name).cloned();
        match handler {
            Some(handler) => {
                let mut handler = handler
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                handler(payload);
                true
            }
            None => {
                tracing::trace!(name, "no handler registered, dropping event");
                false
            }
        }
    }

    /// Registered channel names, for diagnostics.
    pub fn registered_names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<EventHandler>>>> {
        // A poisoned lock means a handler panicked; the registration table
        // itself is still consistent.
        self.handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
