//! Native plugin factory using libloading.

use std::ffi::{c_char, CStr};
use std::sync::Arc;

use libloading::{Library, Symbol};

use crate::artifact::PluginArtifact;
use crate::error::BoxError;
use crate::factory::{PluginDescriptor, PluginFactory};
use crate::plugin::Plugin;

/// Symbol every native plugin exports.
///
/// It returns a NUL-terminated JSON [`PluginDescriptor`] owned by the library.
pub const PLUGIN_DESCRIPTOR_SYMBOL: &[u8] = b"lib_plugin_descriptor";

type DescriptorFn = unsafe extern "C" fn() -> *const c_char;

/// Platform-specific shared library extension.
pub fn library_extension() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(target_os = "windows") {
        "dll"
    } else {
        "so"
    }
}

/// Builds plugins from native shared libraries.
///
/// The loaded library is attached to the plugin so it stays mapped for as
/// long as the plugin value is alive.
#[derive(Debug, Default)]
pub struct NativeLibraryFactory;

impl NativeLibraryFactory {
    pub fn new() -> Self {
        Self
    }

    /// Load a library and read its descriptor.
    ///
    /// # Safety
    /// This loads and runs native code. Only trusted artifacts may be passed.
    unsafe fn load(&self, artifact: &PluginArtifact) -> Result<Plugin, BoxError> {
        let path = artifact
            .path
            .as_ref()
            .ok_or_else(|| format!("Artifact {} has no file", artifact.name))?;

        let library = Library::new(path)?;

        let descriptor_json = {
            let entry: Symbol<DescriptorFn> = library.get(PLUGIN_DESCRIPTOR_SYMBOL)?;
            let ptr = entry();
            if ptr.is_null() {
                return Err("Plugin descriptor symbol returned null".into());
            }
            CStr::from_ptr(ptr).to_str()?.to_owned()
        };

        let descriptor = PluginDescriptor::from_json(&descriptor_json)?;
        tracing::debug!(
            "Loaded native plugin {} v{} from {}",
            descriptor.key,
            descriptor.version,
            path.display()
        );

        Ok(descriptor
            .into_plugin(&artifact.name)
            .with_runtime(Arc::new(library)))
    }
}

impl PluginFactory for NativeLibraryFactory {
    fn id(&self) -> &str {
        "native"
    }

    fn can_create(&self, artifact: &PluginArtifact) -> bool {
        artifact.path.is_some() && artifact.extension() == Some(library_extension())
    }

    fn create(&self, artifact: &PluginArtifact) -> Result<Plugin, BoxError> {
        // Safety: artifacts reach this factory only after passing the load gate
        unsafe { self.load(artifact) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_create_platform_libraries_only() {
        let factory = NativeLibraryFactory::new();
        let lib = format!("/opt/plugins/libreports.{}", library_extension());

        assert!(factory.can_create(&PluginArtifact::from_path(&lib)));
        assert!(!factory.can_create(&PluginArtifact::from_path("/opt/plugins/reports.jar")));
        // name alone is not enough, the library must be on disk
        assert!(!factory.can_create(&PluginArtifact::named(format!(
            "libreports.{}",
            library_extension()
        ))));
    }

    #[test]
    fn test_create_missing_library_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join(format!("libmissing.{}", library_extension()));

        let result = NativeLibraryFactory::new().create(&PluginArtifact::from_path(path));
        assert!(result.is_err());
    }
}
