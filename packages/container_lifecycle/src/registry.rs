use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::container::Container;
use crate::error::LifecycleError;
use crate::ids::{ContainerId, IdResolver};

struct RegistryInner {
    containers: HashMap<ContainerId, Arc<Container>>,
    names: HashMap<String, ContainerId>,
    resolver: IdResolver,
}

/// The set of containers that currently exist.
///
/// Passed explicitly to every component that needs it; there is no global
/// list. A container disappears from listings once it is removed.
pub struct ContainerRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for ContainerRegistry {
    fn default() -> Self {
        Self::new(IdResolver::default())
    }
}

impl ContainerRegistry {
    pub fn new(resolver: IdResolver) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                containers: HashMap::new(),
                names: HashMap::new(),
                resolver,
            }),
        }
    }

    pub fn with_min_prefix_len(min_prefix_len: usize) -> Self {
        Self::new(IdResolver::new(min_prefix_len))
    }

    pub fn add(&self, container: Arc<Container>) -> Result<(), LifecycleError> {
        let mut inner = self.inner.write();
        if let Some(name) = container.name() {
            if inner.names.contains_key(name) {
                return Err(LifecycleError::NameInUse(name.to_string()));
            }
            inner
                .names
                .insert(name.to_string(), container.id().clone());
        }
        inner.resolver.register(container.id().clone());
        inner
            .containers
            .insert(container.id().clone(), container);
        Ok(())
    }

    pub fn remove(&self, id: &ContainerId) -> Option<Arc<Container>> {
        let mut inner = self.inner.write();
        let container = inner.containers.remove(id)?;
        inner.resolver.unregister(id.as_str());
        if let Some(name) = container.name() {
            inner.names.remove(name);
        }
        Some(container)
    }

    /// Resolve a name, full id or unique id prefix.
    pub fn resolve(&self, reference: &str) -> Result<ContainerId, LifecycleError> {
        let inner = self.inner.read();
        if let Some(id) = inner.names.get(reference) {
            return Ok(id.clone());
        }
        inner.resolver.resolve(reference)
    }

    pub fn get(&self, reference: &str) -> Result<Arc<Container>, LifecycleError> {
        let id = self.resolve(reference)?;
        self.inner
            .read()
            .containers
            .get(&id)
            .cloned()
            .ok_or_else(|| LifecycleError::NotFound(reference.to_string()))
    }

    pub fn contains(&self, id: &ContainerId) -> bool {
        self.inner.read().containers.contains_key(id)
    }

    /// Every registered container, newest first.
    pub fn list(&self) -> Vec<Arc<Container>> {
        let mut list: Vec<_> = self.inner.read().containers.values().cloned().collect();
        list.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        list
    }

    pub fn len(&self) -> usize {
        self.inner.read().containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().containers.is_empty()
    }
}
