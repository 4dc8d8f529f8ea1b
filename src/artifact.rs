//! Plugin artifacts and the directories they are discovered in.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::config::PluginConfig;
use crate::error::Result;

/// Installable bytes, identified by file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginArtifact {
    /// File name, used for whitelisting and factory decisions
    pub name: String,
    /// Location on disk, if the artifact is backed by a file
    pub path: Option<PathBuf>,
}

impl PluginArtifact {
    /// Create an artifact that only has a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
        }
    }

    /// Create an artifact from a file path; the name is the file name.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            name,
            path: Some(path),
        }
    }

    /// File extension, if any.
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.name).extension().and_then(|e| e.to_str())
    }
}

/// Discovers artifacts in the configured plugin directories.
#[derive(Debug, Clone)]
pub struct ArtifactSource {
    plugins_dir: PathBuf,
    custom_dir: Option<PathBuf>,
    bundled_archive: Option<PathBuf>,
    bundled_dir: PathBuf,
}

impl ArtifactSource {
    /// Build a source from configuration.
    ///
    /// The bundled archive is ignored when bundled plugins are disabled.
    pub fn new(config: &PluginConfig) -> Self {
        let bundled_archive = if config.disable_bundled_plugins {
            None
        } else {
            config.bundled_archive.clone()
        };

        Self {
            plugins_dir: config.plugins_dir.clone(),
            custom_dir: config.effective_custom_scan_dir().map(Path::to_path_buf),
            bundled_archive,
            bundled_dir: config.bundled_dir(),
        }
    }

    /// Unpack bundled plugins, then list every directory.
    ///
    /// Run once at startup. The bundled directory is replaced wholesale, so
    /// later lookups go through [`ArtifactSource::list`].
    pub fn scan(&self) -> Result<Vec<PluginArtifact>> {
        if let Some(archive) = &self.bundled_archive {
            self.unpack_bundled(archive)?;
        }
        self.list()
    }

    /// List artifacts already on disk, sorted by name.
    ///
    /// Later directories do not override earlier ones when names collide.
    pub fn list(&self) -> Result<Vec<PluginArtifact>> {
        let mut artifacts: Vec<PluginArtifact> = Vec::new();

        if self.bundled_archive.is_some() {
            collect_files(&self.bundled_dir, &mut artifacts)?;
        }

        collect_files(&self.plugins_dir, &mut artifacts)?;

        if let Some(custom) = &self.custom_dir {
            collect_files(custom, &mut artifacts)?;
        }

        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artifacts)
    }

    /// Find an artifact on disk by name.
    pub fn find(&self, name: &str) -> Result<Option<PluginArtifact>> {
        Ok(self.list()?.into_iter().find(|a| a.name == name))
    }

    fn unpack_bundled(&self, archive: &Path) -> Result<()> {
        if !archive.exists() {
            tracing::warn!("Bundled plugins archive not found: {}", archive.display());
            return Ok(());
        }

        if self.bundled_dir.exists() {
            std::fs::remove_dir_all(&self.bundled_dir)?;
        }
        std::fs::create_dir_all(&self.bundled_dir)?;

        let file = File::open(archive)?;
        Archive::new(GzDecoder::new(file)).unpack(&self.bundled_dir)?;

        tracing::debug!(
            "Unpacked bundled plugins from {} into {}",
            archive.display(),
            self.bundled_dir.display()
        );
        Ok(())
    }
}

fn collect_files(dir: &Path, artifacts: &mut Vec<PluginArtifact>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }

        let artifact = PluginArtifact::from_path(path);
        if artifacts.iter().any(|a| a.name == artifact.name) {
            tracing::debug!("Skipping duplicate artifact {}", artifact.name);
            continue;
        }
        artifacts.push(artifact);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn write_bundle(path: &Path, names: &[&str]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for name in names {
            let data = b"{}";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, &data[..]).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_artifact_from_path() {
        let artifact = PluginArtifact::from_path("/opt/plugins/auiplugin-5.0.jar");
        assert_eq!(artifact.name, "auiplugin-5.0.jar");
        assert_eq!(artifact.extension(), Some("jar"));
    }

    #[test]
    fn test_scan_all_directories() {
        let root = tempfile::tempdir().unwrap();
        let plugins_dir = root.path().join("installed");
        let custom_dir = root.path().join("custom");
        std::fs::create_dir_all(&plugins_dir).unwrap();
        std::fs::create_dir_all(&custom_dir).unwrap();
        std::fs::write(plugins_dir.join("b.plugin.json"), "{}").unwrap();
        std::fs::write(custom_dir.join("c.plugin.json"), "{}").unwrap();

        let archive = root.path().join("bundled.tar.gz");
        write_bundle(&archive, &["a.plugin.json"]);

        let config = PluginConfig::new(plugins_dir, root.path().join("cache"))
            .with_bundled_archive(&archive)
            .with_custom_scan_dir(&custom_dir);

        let names: Vec<String> = ArtifactSource::new(&config)
            .scan()
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["a.plugin.json", "b.plugin.json", "c.plugin.json"]);
    }

    #[test]
    fn test_disabled_bundled_plugins_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let archive = root.path().join("bundled.tar.gz");
        write_bundle(&archive, &["a.plugin.json"]);

        let config = PluginConfig::new(root.path().join("installed"), root.path().join("cache"))
            .with_bundled_archive(&archive)
            .disable_bundled_plugins(true);

        let source = ArtifactSource::new(&config);
        assert!(source.scan().unwrap().is_empty());
        assert!(!config.bundled_dir().exists());
    }

    #[test]
    fn test_list_leaves_bundled_files_alone() {
        let root = tempfile::tempdir().unwrap();
        let archive = root.path().join("bundled.tar.gz");
        write_bundle(&archive, &["a.plugin.json"]);
        let config = PluginConfig::new(root.path().join("installed"), root.path().join("cache"))
            .with_bundled_archive(&archive);
        let source = ArtifactSource::new(&config);

        assert_eq!(source.scan().unwrap().len(), 1);
        let unpacked = config.bundled_dir().join("a.plugin.json");
        std::fs::write(&unpacked, "loaded").unwrap();

        let names: Vec<String> = source.list().unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["a.plugin.json"]);
        assert!(source.find("a.plugin.json").unwrap().is_some());
        assert_eq!(std::fs::read_to_string(&unpacked).unwrap(), "loaded");
    }

    #[test]
    fn test_find_by_name() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("x.plugin.json"), "{}").unwrap();
        let config = PluginConfig::new(root.path().to_path_buf(), root.path().join("cache"));
        let source = ArtifactSource::new(&config);

        assert!(source.find("x.plugin.json").unwrap().is_some());
        assert!(source.find("y.plugin.json").unwrap().is_none());
    }
}
