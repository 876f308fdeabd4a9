//! Hub-owned connection id registry
//!
//! Every leaf name is bound to one 16-bit connection id for the lifetime of
//! the hub. A reconnecting leaf gets its old id back; the hub itself uses 0.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

#[derive(Debug)]
struct RegistryState {
    by_name: HashMap<String, i16>,
    next: i16,
}

/// Maps leaf names to the connection ids stamped into their identifiers
#[derive(Debug)]
pub struct ConnectionIdRegistry {
    state: Mutex<RegistryState>,
}

impl Default for ConnectionIdRegistry {
    fn default() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                by_name: HashMap::new(),
                next: 1,
            }),
        }
    }
}

impl ConnectionIdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `name` and whether the name has been seen before
    pub fn assign(&self, name: &str) -> (i16, bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = state.by_name.get(name) {
            return (*id, true);
        }

        let id = state.next;
        state.next = match state.next.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        state.by_name.insert(name.to_string(), id);
        debug!("Assigned connection id {} to {}", id, name);
        (id, false)
    }

    pub fn lookup(&self, name: &str) -> Option<i16> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(name)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_stable_per_name() {
        let registry = ConnectionIdRegistry::new();
        assert_eq!(registry.assign("alpha"), (1, false));
        assert_eq!(registry.assign("beta"), (2, false));
        assert_eq!(registry.assign("alpha"), (1, true));
        assert_eq!(registry.lookup("beta"), Some(2));
        assert_eq!(registry.lookup("gamma"), None);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_zero_is_never_assigned() {
        let registry = ConnectionIdRegistry::new();
        registry.state.lock().unwrap().next = -1;
        assert_eq!(registry.assign("a").0, -1);
        assert_eq!(registry.assign("b").0, 1);
    }
}
