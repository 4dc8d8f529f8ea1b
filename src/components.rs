//! Component registry.
//!
//! Enabled component modules are registered here under their complete key so
//! that other plugins and the host can discover them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{LifecycleError, Result};
use crate::plugin::PluginModule;

/// Metadata about a registered component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDescriptor {
    /// `<plugin key>:<module key>`
    pub complete_key: String,
    /// Key of the plugin that provides the component
    pub provider: String,
}

/// The dependency-injection container the coordinator registers into.
pub trait ComponentContainer: Send + Sync {
    /// Register a component; fails if the key is taken.
    fn register(
        &self,
        descriptor: ComponentDescriptor,
        component: Arc<dyn PluginModule>,
    ) -> Result<()>;

    /// Remove one component. Returns whether it was registered.
    fn unregister(&self, complete_key: &str) -> bool;

    /// Remove every component of a provider plugin.
    fn unregister_provider(&self, provider: &str) -> usize;

    fn lookup(&self, complete_key: &str) -> Option<Arc<dyn PluginModule>>;
}

/// Thread-safe component registry.
pub struct ComponentRegistry {
    components: RwLock<HashMap<String, RegisteredComponent>>,
}

struct RegisteredComponent {
    descriptor: ComponentDescriptor,
    component: Arc<dyn PluginModule>,
}

impl ComponentRegistry {
    /// Create a new empty component registry.
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
        }
    }

    /// List all registered components.
    pub fn list(&self) -> Vec<ComponentDescriptor> {
        self.components
            .read()
            .map(|c| c.values().map(|r| r.descriptor.clone()).collect())
            .unwrap_or_default()
    }

    /// Check if a component is registered.
    pub fn has_component(&self, complete_key: &str) -> bool {
        self.components
            .read()
            .map(|c| c.contains_key(complete_key))
            .unwrap_or(false)
    }

    /// Get the number of registered components.
    pub fn len(&self) -> usize {
        self.components.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentContainer for ComponentRegistry {
    fn register(
        &self,
        descriptor: ComponentDescriptor,
        component: Arc<dyn PluginModule>,
    ) -> Result<()> {
        let mut components = self
            .components
            .write()
            .map_err(|_| LifecycleError::LockPoisoned("component registry"))?;

        if components.contains_key(&descriptor.complete_key) {
            return Err(LifecycleError::ComponentAlreadyRegistered(
                descriptor.complete_key,
            ));
        }

        tracing::info!(
            "Registered component: {} from {}",
            descriptor.complete_key,
            descriptor.provider
        );

        components.insert(
            descriptor.complete_key.clone(),
            RegisteredComponent {
                descriptor,
                component,
            },
        );
        Ok(())
    }

    fn unregister(&self, complete_key: &str) -> bool {
        match self.components.write() {
            Ok(mut components) => {
                let removed = components.remove(complete_key).is_some();
                if removed {
                    tracing::info!("Unregistered component: {}", complete_key);
                }
                removed
            }
            Err(_) => false,
        }
    }

    fn unregister_provider(&self, provider: &str) -> usize {
        let Ok(mut components) = self.components.write() else {
            return 0;
        };

        let to_remove: Vec<String> = components
            .iter()
            .filter(|(_, v)| v.descriptor.provider == provider)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &to_remove {
            tracing::info!("Unregistered component: {} from {}", key, provider);
            components.remove(key);
        }
        to_remove.len()
    }

    fn lookup(&self, complete_key: &str) -> Option<Arc<dyn PluginModule>> {
        self.components
            .read()
            .ok()?
            .get(complete_key)
            .map(|c| c.component.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Panel;
    impl PluginModule for Panel {}

    fn descriptor(complete_key: &str, provider: &str) -> ComponentDescriptor {
        ComponentDescriptor {
            complete_key: complete_key.into(),
            provider: provider.into(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ComponentRegistry::new();
        registry
            .register(descriptor("com.acme:panel", "com.acme"), Arc::new(Panel))
            .unwrap();

        assert!(registry.has_component("com.acme:panel"));
        assert!(registry.lookup("com.acme:panel").is_some());
        assert!(registry.lookup("nonexistent").is_none());
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = ComponentRegistry::new();
        registry
            .register(descriptor("com.acme:panel", "com.acme"), Arc::new(Panel))
            .unwrap();
        let result = registry.register(descriptor("com.acme:panel", "com.acme"), Arc::new(Panel));

        assert!(matches!(
            result,
            Err(LifecycleError::ComponentAlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_unregister_provider() {
        let registry = ComponentRegistry::new();

        // Register multiple components from same provider
        for i in 1..=3 {
            registry
                .register(
                    descriptor(&format!("com.acme:panel{}", i), "com.acme"),
                    Arc::new(Panel),
                )
                .unwrap();
        }

        // Register component from different provider
        registry
            .register(descriptor("com.other:panel", "com.other"), Arc::new(Panel))
            .unwrap();

        assert_eq!(registry.len(), 4);

        assert_eq!(registry.unregister_provider("com.acme"), 3);

        assert_eq!(registry.len(), 1);
        assert!(!registry.has_component("com.acme:panel1"));
        assert!(registry.has_component("com.other:panel"));
    }

    #[test]
    fn test_unregister_single() {
        let registry = ComponentRegistry::new();
        registry
            .register(descriptor("com.acme:panel", "com.acme"), Arc::new(Panel))
            .unwrap();

        assert!(registry.unregister("com.acme:panel"));
        assert!(!registry.unregister("com.acme:panel"));
        assert!(registry.is_empty());
    }
}
