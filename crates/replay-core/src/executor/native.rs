//! In-process handlers registered by name

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use super::{Action, HandlerResult, Sandbox};

/// A native contract handler. Receives its own copy of the state.
pub type NativeHandler = dyn Fn(Value, &Action, &Sandbox) -> HandlerResult + Send + Sync;

/// Name → handler table. Clones share the same table.
#[derive(Clone, Default)]
pub struct NativeRegistry {
    handlers: Arc<RwLock<BTreeMap<String, Arc<NativeHandler>>>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler a native source named `name` runs.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value, &Action, &Sandbox) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.write().insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<NativeHandler>> {
        self.handlers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::HandlerOutput;

    #[test]
    fn test_register_and_replace() {
        let registry = NativeRegistry::new();
        registry.register("a", |state, _, _| Ok(HandlerOutput::state(state)));
        registry.register("b", |state, _, _| Ok(HandlerOutput::state(state)));
        registry.register("a", |_, _, _| Ok(HandlerOutput::result(Value::Null)));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.get("c").is_none());
        assert!(registry.clone().get("a").is_some());
    }
}
