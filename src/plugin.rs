//! Installed plugin and module model.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{BoxError, LifecycleError, Result};

/// Separator between the plugin key and the module key of a complete key.
pub const COMPLETE_KEY_SEPARATOR: char = ':';

/// Lifecycle state of an installed plugin.
///
/// Uninstalled plugins have no state; they are simply absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Constructed, never enabled
    Installed,
    /// Enabled and serving
    Enabled,
    /// Disabled after install or enable
    Disabled,
}

/// Kind of a plugin module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleKind {
    /// Registered with the component container when enabled
    Component,
    /// Anything else; opaque to the lifecycle layer
    Other(String),
}

impl ModuleKind {
    /// Parse a descriptor kind string.
    pub fn parse(kind: &str) -> Self {
        match kind {
            "component" => ModuleKind::Component,
            other => ModuleKind::Other(other.to_string()),
        }
    }
}

/// Context handed to modules during initialization.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    /// Owning plugin key
    pub plugin_key: String,
    /// Complete key of the module
    pub complete_key: String,
}

/// Optional capability: modules that need a hook before they are registered.
pub trait Initializable {
    /// Initialize the module; an error prevents the plugin from enabling.
    fn init(&self, context: &ModuleContext) -> std::result::Result<(), BoxError>;
}

/// Runtime implementation of a module.
pub trait PluginModule: Send + Sync {
    /// Returns the `Initializable` capability if the module has one.
    fn as_initializable(&self) -> Option<&dyn Initializable> {
        None
    }
}

/// A module declared by a plugin.
#[derive(Clone)]
pub struct ModuleDescriptor {
    /// Module key, unique within the plugin
    pub key: String,
    /// Module kind
    pub kind: ModuleKind,
    /// State used when nothing has been persisted for the module
    pub enabled_by_default: bool,
    /// Runtime implementation, if the factory provided one
    pub implementation: Option<Arc<dyn PluginModule>>,
}

impl ModuleDescriptor {
    /// Create an enabled-by-default module without an implementation.
    pub fn new(key: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            key: key.into(),
            kind,
            enabled_by_default: true,
            implementation: None,
        }
    }

    /// Attach a runtime implementation.
    pub fn with_implementation(mut self, implementation: Arc<dyn PluginModule>) -> Self {
        self.implementation = Some(implementation);
        self
    }

    /// Set the default enabled state.
    pub fn enabled_by_default(mut self, enabled: bool) -> Self {
        self.enabled_by_default = enabled;
        self
    }

    /// Check if this module is registered with the component container.
    pub fn is_component(&self) -> bool {
        self.kind == ModuleKind::Component
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("enabled_by_default", &self.enabled_by_default)
            .field("has_implementation", &self.implementation.is_some())
            .finish()
    }
}

/// A constructed plugin.
#[derive(Clone)]
pub struct Plugin {
    /// Stable plugin key
    pub key: String,
    /// Human-readable name
    pub name: String,
    /// Installed version string
    pub version: String,
    /// Declared modules
    pub modules: Vec<ModuleDescriptor>,
    /// Keys of plugins that must be enabled first
    pub dependencies: Vec<String>,
    /// Name of the artifact the plugin was built from
    pub artifact_name: String,
    /// Keeps runtime resources (e.g. a loaded library) alive
    runtime: Option<Arc<dyn Any + Send + Sync>>,
}

impl Plugin {
    /// Create a plugin without modules.
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            version: version.into(),
            modules: Vec::new(),
            dependencies: Vec::new(),
            artifact_name: String::new(),
            runtime: None,
        }
    }

    /// Add a module.
    pub fn with_module(mut self, module: ModuleDescriptor) -> Self {
        self.modules.push(module);
        self
    }

    /// Add a required plugin.
    pub fn with_dependency(mut self, plugin_key: impl Into<String>) -> Self {
        self.dependencies.push(plugin_key.into());
        self
    }

    /// Record the originating artifact.
    pub fn with_artifact_name(mut self, artifact_name: impl Into<String>) -> Self {
        self.artifact_name = artifact_name.into();
        self
    }

    /// Keep a runtime resource alive for as long as the plugin.
    pub fn with_runtime(mut self, runtime: Arc<dyn Any + Send + Sync>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Check if a runtime resource is attached.
    pub fn has_runtime(&self) -> bool {
        self.runtime.is_some()
    }

    /// Get a module by its module key.
    pub fn module(&self, module_key: &str) -> Option<&ModuleDescriptor> {
        self.modules.iter().find(|m| m.key == module_key)
    }

    /// Complete key of one of this plugin's modules.
    pub fn complete_key(&self, module_key: &str) -> String {
        format!("{}{}{}", self.key, COMPLETE_KEY_SEPARATOR, module_key)
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("modules", &self.modules)
            .field("dependencies", &self.dependencies)
            .field("artifact_name", &self.artifact_name)
            .finish()
    }
}

/// Split a complete key into `(plugin key, module key)`.
pub fn split_complete_key(complete_key: &str) -> Result<(&str, &str)> {
    match complete_key.split_once(COMPLETE_KEY_SEPARATOR) {
        Some((plugin, module)) if !plugin.is_empty() && !module.is_empty() => Ok((plugin, module)),
        _ => Err(LifecycleError::InvalidCompleteKey(complete_key.to_string())),
    }
}

/// Check whether a state key belongs to a plugin (its own key or one of its modules).
pub fn belongs_to_plugin(state_key: &str, plugin_key: &str) -> bool {
    match state_key.strip_prefix(plugin_key) {
        Some("") => true,
        Some(rest) => rest.starts_with(COMPLETE_KEY_SEPARATOR),
        None => false,
    }
}
