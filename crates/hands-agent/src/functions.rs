//! Named trampolines forwarding into the inbound bridge

use crate::bridge::InboundBridge;
use hands_common::Result;
use hands_core::{Trampoline, TrampolineHandler};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Handler behind one created function.
pub struct RemoteFunction {
    name: String,
    arity: usize,
    bridge: Arc<InboundBridge>,
}

impl RemoteFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }
}

impl TrampolineHandler for RemoteFunction {
    fn invoke(&self, args: &[usize]) -> usize {
        self.bridge.forward(&self.name, args)
    }
}

/// Name to trampoline map.
///
/// Freeing a function releases its executable stub. Native code must not be
/// inside or about to enter it at that point; the registry cannot observe
/// callers it did not start.
pub struct FunctionRegistry {
    bridge: Arc<InboundBridge>,
    functions: RwLock<HashMap<String, Trampoline<RemoteFunction>>>,
}

impl FunctionRegistry {
    pub fn new(bridge: Arc<InboundBridge>) -> Self {
        Self {
            bridge,
            functions: RwLock::new(HashMap::new()),
        }
    }

    /// Create the trampoline for `name`, or return the existing one.
    ///
    /// An existing entry wins even if it was created with another arity.
    pub fn create(&self, name: &str, arity: usize) -> Result<usize> {
        let mut functions = self.functions.write();
        if let Some(existing) = functions.get(name) {
            debug!(
                target: "hands_agent::functions",
                function = name,
                address = format!("{:#x}", existing.address()),
                "Function already exists"
            );
            return Ok(existing.address());
        }

        let handler = RemoteFunction {
            name: name.to_string(),
            arity,
            bridge: self.bridge.clone(),
        };
        let trampoline = Trampoline::new(arity, handler)?;
        let address = trampoline.address();
        functions.insert(name.to_string(), trampoline);

        info!(
            target: "hands_agent::functions",
            function = name,
            arity,
            address = format!("{:#x}", address),
            "Function created"
        );
        Ok(address)
    }

    /// Release the trampoline for `name`. False if there was none.
    pub fn free(&self, name: &str) -> bool {
        let removed = self.functions.write().remove(name);
        match removed {
            Some(trampoline) => {
                info!(
                    target: "hands_agent::functions",
                    function = name,
                    address = format!("{:#x}", trampoline.address()),
                    "Function freed"
                );
                true
            }
            None => {
                debug!(target: "hands_agent::functions", function = name, "No such function");
                false
            }
        }
    }

    pub fn address_of(&self, name: &str) -> Option<usize> {
        self.functions.read().get(name).map(Trampoline::address)
    }

    pub fn arity_of(&self, name: &str) -> Option<usize> {
        self.functions
            .read()
            .get(name)
            .map(|trampoline| trampoline.handler().arity())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hands_core::call_function;

    fn registry() -> FunctionRegistry {
        FunctionRegistry::new(Arc::new(InboundBridge::new()))
    }

    #[test]
    fn test_create_is_idempotent() {
        let registry = registry();
        let first = registry.create("on_event", 2).unwrap();
        assert_ne!(first, 0);
        assert_eq!(registry.create("on_event", 2).unwrap(), first);
        assert_eq!(registry.create("on_event", 5).unwrap(), first);
        assert_eq!(registry.arity_of("on_event"), Some(2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_names_get_distinct_addresses() {
        let registry = registry();
        let a = registry.create("a", 0).unwrap();
        let b = registry.create("b", 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_free_and_recreate() {
        let registry = registry();
        registry.create("cb", 1).unwrap();
        assert!(registry.free("cb"));
        assert!(!registry.free("cb"));
        assert_eq!(registry.address_of("cb"), None);
        assert!(registry.is_empty());

        assert_ne!(registry.create("cb", 1).unwrap(), 0);
        assert!(registry.address_of("cb").is_some());
    }

    #[test]
    fn test_unattached_trampoline_returns_zero() {
        let registry = registry();
        let address = registry.create("detached", 3).unwrap();
        assert_eq!(call_function(address, &[1, 2, 3]).unwrap(), 0);
    }
}
