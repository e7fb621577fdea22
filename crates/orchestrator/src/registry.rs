//! Step registry: the process-wide name → handler table.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::step::StepHandler;

/// Keyed collection of step handlers, populated at process startup.
///
/// The registry is an explicit value passed to the worker at construction,
/// not a global: persisted jobs reference steps by name only, so every
/// worker that might process a job must hold a registry containing its
/// steps. Re-registering a name replaces the previous binding (last writer
/// wins). Cloning is cheap and shares the underlying table.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: Arc<RwLock<HashMap<String, Arc<dyn StepHandler>>>>,
}

impl StepRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `name`, replacing any previous binding.
    pub fn register<H>(&self, name: impl Into<String>, handler: H)
    where
        H: StepHandler + 'static,
    {
        self.steps
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(handler));
    }

    /// Returns the handler registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.steps
            .read()
            .unwrap()
            .get(name)
            .cloned()
    }

    /// Returns true if a handler is registered under `name`.
    pub fn has(&self, name: &str) -> bool {
        self.steps
            .read()
            .unwrap()
            .contains_key(name)
    }

    /// Returns all registered step names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .steps
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Removes the binding for `name`. Returns true if one existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.steps
            .write()
            .unwrap()
            .remove(name)
            .is_some()
    }

    /// Removes every binding. Intended for test isolation.
    pub fn clear(&self) {
        self.steps
            .write()
            .unwrap()
            .clear();
    }
}
