use std::collections::HashMap;

use super::{traits::Trace, visitor::Visitor};

/// Values traced on every collection until removed.
pub struct PersistentRoots {
    trace_callbacks: HashMap<u32, Box<dyn Trace>>,
    key: u32,
}

impl PersistentRoots {
    pub fn new() -> Self {
        Self {
            trace_callbacks: HashMap::new(),
            key: 0,
        }
    }

    pub fn add<T: 'static + Trace>(&mut self, root: T) -> u32 {
        let object = Box::new(root);

        self.trace_callbacks.insert(self.key, object);
        self.key += 1;

        self.key - 1
    }

    pub fn remove(&mut self, key: u32) -> Option<Box<dyn Trace>> {
        self.trace_callbacks.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.trace_callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace_callbacks.is_empty()
    }
}

impl Default for PersistentRoots {
    fn default() -> Self {
        Self::new()
    }
}

impl Trace for PersistentRoots {
    fn trace(&self, visitor: &mut dyn Visitor) {
        for root in self.trace_callbacks.values() {
            root.trace(visitor);
        }
    }
}
