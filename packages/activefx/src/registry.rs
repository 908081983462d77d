//! Explicit domain registry owned by the composition root.
//!
//! No global mutable state: the registry is a plain value the application
//! constructs, passes by reference, and drops on shutdown. Domains of
//! different context types share one registry through the type-erased
//! [`DomainControl`] view.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::core::FsmContext;
use crate::domain::{DomainHandle, DomainLifecycle};
use crate::error::ActivefxError;

/// Type-erased lifecycle view of a running domain.
pub trait DomainControl: Send + Sync + 'static {
    /// The domain's name.
    fn name(&self) -> &str;

    /// Current engine lifecycle.
    fn lifecycle(&self) -> DomainLifecycle;

    /// Events currently queued.
    fn queue_depth(&self) -> usize;

    /// Request an asynchronous stop.
    fn stop(&self);
}

impl<C: FsmContext> DomainControl for DomainHandle<C> {
    fn name(&self) -> &str {
        DomainHandle::name(self)
    }

    fn lifecycle(&self) -> DomainLifecycle {
        DomainHandle::lifecycle(self)
    }

    fn queue_depth(&self) -> usize {
        DomainHandle::queue_depth(self)
    }

    fn stop(&self) {
        DomainHandle::stop(self)
    }
}

/// Name-addressed collection of running domains.
#[derive(Default)]
pub struct DomainRegistry {
    domains: DashMap<String, Arc<dyn DomainControl>>,
}

impl DomainRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            domains: DashMap::new(),
        }
    }

    /// Register a domain under its own name.
    ///
    /// Duplicate names are a configuration error: the existing entry is kept
    /// and `Err(DuplicateDomain)` returned.
    pub fn register(&self, domain: Arc<dyn DomainControl>) -> Result<(), ActivefxError> {
        let name = domain.name().to_string();
        match self.domains.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!(domain = %name, "duplicate domain registration rejected");
                Err(ActivefxError::DuplicateDomain { name })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(domain = %name, "domain registered");
                slot.insert(domain);
                Ok(())
            }
        }
    }

    /// Look up a domain by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn DomainControl>> {
        self.domains.get(name).map(|entry| entry.value().clone())
    }

    /// Remove a domain by name, returning it if present.
    pub fn deregister(&self, name: &str) -> Option<Arc<dyn DomainControl>> {
        self.domains.remove(name).map(|(_, domain)| domain)
    }

    /// Request a stop on every registered domain.
    pub fn stop_all(&self) {
        for entry in self.domains.iter() {
            entry.value().stop();
        }
    }

    /// Number of registered domains.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// True when no domains are registered.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl std::fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainRegistry")
            .field("domains", &self.domains.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StateId;
    use crate::domain::FsmDomain;
    use crate::state::State;
    use crate::testing::TestContext;
    use std::time::Duration;

    fn started_handle(name: &str) -> DomainHandle<TestContext> {
        let mut domain = FsmDomain::new(name);
        domain.add_state(State::new(StateId(0), "INIT"), true);
        domain.start().unwrap()
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = DomainRegistry::new();
        let handle = started_handle("alpha");
        registry.register(Arc::new(handle.clone())).unwrap();

        let found = registry.get("alpha").unwrap();
        assert_eq!(found.name(), "alpha");
        assert_eq!(found.lifecycle(), DomainLifecycle::Running);
        assert!(registry.get("beta").is_none());

        handle.stop();
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = DomainRegistry::new();
        let first = started_handle("alpha");
        let second = started_handle("alpha");

        registry.register(Arc::new(first.clone())).unwrap();
        let err = registry.register(Arc::new(second.clone()));
        assert!(matches!(err, Err(ActivefxError::DuplicateDomain { .. })));
        assert_eq!(registry.len(), 1);

        first.stop();
        second.stop();
    }

    #[tokio::test]
    async fn test_stop_all_stops_every_domain() {
        let registry = DomainRegistry::new();
        let a = started_handle("alpha");
        let b = started_handle("beta");
        registry.register(Arc::new(a.clone())).unwrap();
        registry.register(Arc::new(b.clone())).unwrap();

        registry.stop_all();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(a.lifecycle(), DomainLifecycle::Stopped);
        assert_eq!(b.lifecycle(), DomainLifecycle::Stopped);
    }
}
