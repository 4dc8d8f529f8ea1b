//! Component lookup by name.
//!
//! Resolution walks a chain of resolvers and stops at the first hit. The
//! registry lookup is O(1); the plugin scans are O(n) fallbacks for
//! components that were never registered (disabled modules, non-component
//! kinds, plugins still starting).

use std::sync::Arc;

use crate::components::ComponentContainer;
use crate::plugin::{Plugin, PluginModule};

/// What the resolvers may look at.
pub struct ResolveScope<'a> {
    /// Installed plugins
    pub plugins: &'a [Plugin],
    /// Whether a plugin key is enabled
    pub is_enabled: &'a dyn Fn(&str) -> bool,
}

/// One step of component resolution.
pub trait ComponentResolver: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn resolve(&self, name: &str, scope: &ResolveScope<'_>) -> Option<Arc<dyn PluginModule>>;
}

/// Looks the name up as a complete key in the component container.
pub struct RegistryResolver {
    container: Arc<dyn ComponentContainer>,
}

impl RegistryResolver {
    pub fn new(container: Arc<dyn ComponentContainer>) -> Self {
        Self { container }
    }
}

impl ComponentResolver for RegistryResolver {
    fn name(&self) -> &'static str {
        "registry"
    }

    fn resolve(&self, name: &str, _scope: &ResolveScope<'_>) -> Option<Arc<dyn PluginModule>> {
        self.container.lookup(name)
    }
}

fn scan<'a>(
    name: &str,
    plugins: impl Iterator<Item = &'a Plugin>,
) -> Option<Arc<dyn PluginModule>> {
    for plugin in plugins {
        for module in &plugin.modules {
            if module.key == name || plugin.complete_key(&module.key) == name {
                if let Some(implementation) = &module.implementation {
                    return Some(implementation.clone());
                }
            }
        }
    }
    None
}

/// Fallback: O(n) scan over the modules of enabled plugins.
pub struct EnabledPluginsScan;

impl ComponentResolver for EnabledPluginsScan {
    fn name(&self) -> &'static str {
        "enabled-plugins"
    }

    fn resolve(&self, name: &str, scope: &ResolveScope<'_>) -> Option<Arc<dyn PluginModule>> {
        scan(
            name,
            scope.plugins.iter().filter(|p| (scope.is_enabled)(&p.key)),
        )
    }
}

/// Last resort: O(n) scan over the modules of every installed plugin.
pub struct AllPluginsScan;

impl ComponentResolver for AllPluginsScan {
    fn name(&self) -> &'static str {
        "all-plugins"
    }

    fn resolve(&self, name: &str, scope: &ResolveScope<'_>) -> Option<Arc<dyn PluginModule>> {
        scan(name, scope.plugins.iter())
    }
}

/// Ordered list of resolvers.
#[derive(Default)]
pub struct ResolverChain {
    resolvers: Vec<Box<dyn ComponentResolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry first, then the enabled-plugin scan, then the full scan.
    pub fn standard(container: Arc<dyn ComponentContainer>) -> Self {
        Self::new()
            .with(RegistryResolver::new(container))
            .with(EnabledPluginsScan)
            .with(AllPluginsScan)
    }

    /// Append a resolver.
    pub fn with(mut self, resolver: impl ComponentResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    pub fn resolve(&self, name: &str, scope: &ResolveScope<'_>) -> Option<Arc<dyn PluginModule>> {
        for resolver in &self.resolvers {
            if let Some(found) = resolver.resolve(name, scope) {
                tracing::debug!("Resolved component {} via {}", name, resolver.name());
                return Some(found);
            }
        }
        tracing::debug!("Component {} not resolved", name);
        None
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{ComponentDescriptor, ComponentRegistry};
    use crate::plugin::{ModuleDescriptor, ModuleKind};

    struct Marker(&'static str);
    impl PluginModule for Marker {}

    fn marker_of(module: &Arc<dyn PluginModule>, expected: &Arc<Marker>) -> bool {
        std::ptr::eq(
            Arc::as_ptr(module) as *const u8,
            Arc::as_ptr(expected) as *const u8,
        )
    }

    #[test]
    fn test_registry_wins_over_scans() {
        let registry = Arc::new(ComponentRegistry::new());
        let registered = Arc::new(Marker("registered"));
        registry
            .register(
                ComponentDescriptor {
                    complete_key: "com.acme:panel".into(),
                    provider: "com.acme".into(),
                },
                registered.clone(),
            )
            .unwrap();

        let declared = Arc::new(Marker("declared"));
        let plugins = vec![Plugin::new("com.acme", "Acme", "1.0").with_module(
            ModuleDescriptor::new("panel", ModuleKind::Component)
                .with_implementation(declared.clone()),
        )];
        let chain = ResolverChain::standard(registry);
        let scope = ResolveScope {
            plugins: &plugins,
            is_enabled: &|_| true,
        };

        let found = chain.resolve("com.acme:panel", &scope).unwrap();
        assert!(marker_of(&found, &registered));
        assert_eq!(registered.0, "registered");
    }

    #[test]
    fn test_enabled_scan_before_full_scan() {
        let disabled = Arc::new(Marker("disabled"));
        let enabled = Arc::new(Marker("enabled"));
        let plugins = vec![
            Plugin::new("com.old", "Old", "1.0").with_module(
                ModuleDescriptor::new("renderer", ModuleKind::Other("renderer".into()))
                    .with_implementation(disabled.clone()),
            ),
            Plugin::new("com.new", "New", "1.0").with_module(
                ModuleDescriptor::new("renderer", ModuleKind::Other("renderer".into()))
                    .with_implementation(enabled.clone()),
            ),
        ];
        let chain = ResolverChain::standard(Arc::new(ComponentRegistry::new()));

        let only_new = |key: &str| key == "com.new";
        let scope = ResolveScope {
            plugins: &plugins,
            is_enabled: &only_new,
        };
        assert!(marker_of(&chain.resolve("renderer", &scope).unwrap(), &enabled));

        let none = |_: &str| false;
        let scope = ResolveScope {
            plugins: &plugins,
            is_enabled: &none,
        };
        assert!(marker_of(&chain.resolve("renderer", &scope).unwrap(), &disabled));
        assert!(chain.resolve("missing", &scope).is_none());
        assert_eq!(disabled.0, "disabled");
        assert_eq!(enabled.0, "enabled");
    }
}
