//! Plugin factories and the JSON descriptor format.

use std::sync::Arc;

use serde::Deserialize;

use crate::artifact::PluginArtifact;
use crate::error::BoxError;
use crate::plugin::{ModuleDescriptor, ModuleKind, Plugin, PluginModule};

/// Builds plugins from artifacts it recognises.
pub trait PluginFactory: Send + Sync {
    /// Identifier used in logs and admission decisions.
    fn id(&self) -> &str;

    /// Check whether this factory can construct the artifact.
    fn can_create(&self, artifact: &PluginArtifact) -> bool;

    /// Construct the plugin.
    fn create(&self, artifact: &PluginArtifact) -> Result<Plugin, BoxError>;
}

/// Serialized plugin descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginDescriptor {
    pub key: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
    #[serde(default)]
    pub requires: Vec<String>,
}

/// One module entry of a descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleEntry {
    pub key: String,
    pub kind: String,
    #[serde(default = "default_enabled")]
    pub enabled_by_default: bool,
}

fn default_enabled() -> bool {
    true
}

/// Component implementation for modules declared only by a descriptor.
#[derive(Debug)]
pub struct DeclaredComponent {
    pub complete_key: String,
}

impl PluginModule for DeclaredComponent {}

impl PluginDescriptor {
    /// Parse a descriptor from JSON text.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Turn the descriptor into a plugin.
    ///
    /// Component modules get a `DeclaredComponent` implementation so they can
    /// be registered with the component container.
    pub fn into_plugin(self, artifact_name: &str) -> Plugin {
        let mut plugin = Plugin::new(&self.key, &self.name, &self.version)
            .with_artifact_name(artifact_name);

        for entry in self.modules {
            let kind = ModuleKind::parse(&entry.kind);
            let mut module =
                ModuleDescriptor::new(&entry.key, kind).enabled_by_default(entry.enabled_by_default);
            if module.is_component() {
                module = module.with_implementation(Arc::new(DeclaredComponent {
                    complete_key: plugin.complete_key(&entry.key),
                }));
            }
            plugin = plugin.with_module(module);
        }

        for required in self.requires {
            plugin = plugin.with_dependency(required);
        }

        plugin
    }
}

/// Builds plugins from `*.plugin.json` descriptor files.
#[derive(Debug, Default)]
pub struct DescriptorFactory;

/// File name suffix recognised by [`DescriptorFactory`].
pub const DESCRIPTOR_SUFFIX: &str = ".plugin.json";

impl DescriptorFactory {
    pub fn new() -> Self {
        Self
    }
}

impl PluginFactory for DescriptorFactory {
    fn id(&self) -> &str {
        "descriptor"
    }

    fn can_create(&self, artifact: &PluginArtifact) -> bool {
        artifact.name.ends_with(DESCRIPTOR_SUFFIX) && artifact.path.is_some()
    }

    fn create(&self, artifact: &PluginArtifact) -> Result<Plugin, BoxError> {
        let path = artifact
            .path
            .as_ref()
            .ok_or_else(|| format!("Artifact {} has no file", artifact.name))?;
        let text = std::fs::read_to_string(path)?;
        let descriptor = PluginDescriptor::from_json(&text)?;
        Ok(descriptor.into_plugin(&artifact.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"{
        "key": "com.acme.reports",
        "name": "Acme Reports",
        "version": "2.1.0",
        "requires": ["com.acme.core"],
        "modules": [
            {"key": "report-service", "kind": "component"},
            {"key": "report-panel", "kind": "web-panel", "enabled_by_default": false}
        ]
    }"#;

    #[test]
    fn test_descriptor_into_plugin() {
        let plugin = PluginDescriptor::from_json(DESCRIPTOR)
            .unwrap()
            .into_plugin("reports.plugin.json");

        assert_eq!(plugin.key, "com.acme.reports");
        assert_eq!(plugin.version, "2.1.0");
        assert_eq!(plugin.artifact_name, "reports.plugin.json");
        assert_eq!(plugin.dependencies, vec!["com.acme.core"]);

        let service = plugin.module("report-service").unwrap();
        assert!(service.is_component());
        assert!(service.implementation.is_some());

        let panel = plugin.module("report-panel").unwrap();
        assert!(!panel.enabled_by_default);
        assert!(panel.implementation.is_none());
    }

    #[test]
    fn test_descriptor_factory_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports.plugin.json");
        std::fs::write(&path, DESCRIPTOR).unwrap();

        let factory = DescriptorFactory::new();
        let artifact = PluginArtifact::from_path(&path);
        assert!(factory.can_create(&artifact));
        assert!(!factory.can_create(&PluginArtifact::named("reports.plugin.json")));
        assert!(!factory.can_create(&PluginArtifact::named("reports.jar")));

        let plugin = factory.create(&artifact).unwrap();
        assert_eq!(plugin.name, "Acme Reports");
    }

    #[test]
    fn test_descriptor_factory_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.plugin.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = DescriptorFactory::new().create(&PluginArtifact::from_path(&path));
        assert!(result.is_err());
    }
}
