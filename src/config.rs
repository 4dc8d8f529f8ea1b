//! Plugin lifecycle configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Default idle window before a cached service handle is evicted.
pub const DEFAULT_HANDLE_TTL: Duration = Duration::from_secs(5 * 60);

/// Configuration for the plugin lifecycle layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Directory where installed plugin artifacts live
    pub plugins_dir: PathBuf,

    /// Working directory (bundled archive is unpacked below it)
    pub cache_dir: PathBuf,

    /// Admit only artifacts matching `startup_allow_patterns`
    pub restricted_startup: bool,

    /// Ordered allow-patterns for restricted startup, first match wins
    pub startup_allow_patterns: Vec<String>,

    /// Skip the bundled-plugins archive entirely
    pub disable_bundled_plugins: bool,

    /// Archive (tar.gz) of plugins shipped with the host
    pub bundled_archive: Option<PathBuf>,

    /// Also scan `custom_scan_dir`
    pub custom_scan_enabled: bool,

    /// Extra directory scanned for artifacts
    pub custom_scan_dir: Option<PathBuf>,

    /// Idle window for cached service handles, in seconds
    pub handle_cache_ttl_secs: u64,
}

impl PluginConfig {
    /// Create a new configuration with required paths.
    pub fn new(plugins_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            plugins_dir,
            cache_dir,
            restricted_startup: false,
            startup_allow_patterns: Vec::new(),
            disable_bundled_plugins: false,
            bundled_archive: None,
            custom_scan_enabled: false,
            custom_scan_dir: None,
            handle_cache_ttl_secs: DEFAULT_HANDLE_TTL.as_secs(),
        }
    }

    /// Load a configuration from a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Restrict startup to artifacts matching the given patterns.
    pub fn with_restricted_startup(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.restricted_startup = true;
        self.startup_allow_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the bundled-plugins archive.
    pub fn with_bundled_archive(mut self, archive: impl Into<PathBuf>) -> Self {
        self.bundled_archive = Some(archive.into());
        self
    }

    /// Disable all bundled plugins.
    pub fn disable_bundled_plugins(mut self, disable: bool) -> Self {
        self.disable_bundled_plugins = disable;
        self
    }

    /// Enable scanning of a custom directory.
    pub fn with_custom_scan_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.custom_scan_enabled = true;
        self.custom_scan_dir = Some(dir.into());
        self
    }

    /// Set the handle cache idle window.
    pub fn with_handle_cache_ttl(mut self, ttl: Duration) -> Self {
        self.handle_cache_ttl_secs = ttl.as_secs();
        self
    }

    /// Idle window for cached service handles.
    pub fn handle_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.handle_cache_ttl_secs)
    }

    /// The custom scan directory, if scanning it is enabled.
    pub fn effective_custom_scan_dir(&self) -> Option<&Path> {
        if self.custom_scan_enabled {
            self.custom_scan_dir.as_deref()
        } else {
            None
        }
    }

    /// Where the bundled archive is unpacked.
    pub fn bundled_dir(&self) -> PathBuf {
        self.cache_dir.join("bundled-plugins")
    }

    /// Ensure directories exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.plugins_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        // Use platform-appropriate default directories
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));

        Self::new(data_dir.join("plugins"), cache_dir.join("plugins"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_scan_dir_requires_flag() {
        let mut config = PluginConfig::new("p".into(), "c".into());
        config.custom_scan_dir = Some("custom".into());
        assert!(config.effective_custom_scan_dir().is_none());

        let config = config.with_custom_scan_dir("custom");
        assert_eq!(
            config.effective_custom_scan_dir(),
            Some(Path::new("custom"))
        );
    }

    #[test]
    fn test_from_json_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        std::fs::write(
            &path,
            r#"{
                "plugins_dir": "/srv/plugins",
                "restricted_startup": true,
                "startup_allow_patterns": ["auiplugin-.*\\.jar"]
            }"#,
        )
        .unwrap();

        let config = PluginConfig::from_json_file(&path).unwrap();
        assert_eq!(config.plugins_dir, PathBuf::from("/srv/plugins"));
        assert!(config.restricted_startup);
        assert_eq!(config.startup_allow_patterns, vec!["auiplugin-.*\\.jar"]);
        assert_eq!(config.handle_cache_ttl(), DEFAULT_HANDLE_TTL);
        assert!(!config.disable_bundled_plugins);
    }
}
