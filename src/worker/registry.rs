//! Task registry.
//!
//! Built once at startup from explicit registrations, then frozen and shared
//! by every lane through an `Arc`. There is no way to add a handler after
//! [`TaskRegistryBuilder::build`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TaskError;
use crate::worker::task::TaskHandler;

/// A collaborator that contributes task handlers.
pub trait TaskSource {
    fn register_tasks(&self, registry: &mut TaskRegistryBuilder) -> Result<(), TaskError>;
}

/// Mutable registration phase.
#[derive(Default)]
pub struct TaskRegistryBuilder {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Duplicate names are rejected.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<&mut Self, TaskError> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(TaskError::Duplicate { name });
        }
        tracing::debug!(task = %name, "Registered task");
        self.handlers.insert(name, handler);
        Ok(self)
    }

    /// Let a collaborator register its handlers.
    pub fn register_source(&mut self, source: &dyn TaskSource) -> Result<&mut Self, TaskError> {
        source.register_tasks(self)?;
        Ok(self)
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry {
            handlers: self.handlers,
        }
    }
}

/// Immutable name → handler map.
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
