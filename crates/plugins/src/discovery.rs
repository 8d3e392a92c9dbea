//! Plugin discovery from filesystem directories.
//!
//! Every immediate subdirectory of a search path that contains a
//! `plugin.toml` is one plugin.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use {
    async_trait::async_trait,
    plughub_config::{PluginDefaults, PlughubConfig},
    tracing::{debug, warn},
};

use crate::{
    descriptor::PluginDescriptor,
    error::Result,
    manifest::{MANIFEST_FILE, parse_manifest},
    sequence::order_by_dependencies,
};

/// Produces the ordered list of plugins to manage.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn list(&self) -> Result<Vec<PluginDescriptor>>;
}

/// Filesystem-based source. Scans directories in priority order; the first
/// plugin seen under a given name wins.
pub struct FsPluginSource {
    search_paths: Vec<PathBuf>,
    defaults: PluginDefaults,
    disabled: BTreeSet<String>,
}

impl FsPluginSource {
    pub fn new(search_paths: Vec<PathBuf>, defaults: PluginDefaults) -> Self {
        Self {
            search_paths,
            defaults,
            disabled: BTreeSet::new(),
        }
    }

    /// Build a source from the `[plugins]` and `[defaults]` config sections.
    pub fn from_config(config: &PlughubConfig) -> Self {
        Self::new(config.plugin_dirs(), config.defaults.clone())
            .with_disabled(config.plugins.disabled.iter().cloned())
    }

    #[must_use]
    pub fn with_disabled(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.disabled.extend(names);
        self
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    fn scan_dir(&self, base: &Path, out: &mut Vec<PluginDescriptor>, seen: &mut BTreeSet<String>) {
        let entries = match std::fs::read_dir(base) {
            Ok(e) => e,
            Err(e) => {
                warn!(path = %base.display(), error = %e, "failed to read plugin directory");
                return;
            },
        };

        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for plugin_dir in dirs {
            let manifest_path = plugin_dir.join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                continue;
            }

            let content = match std::fs::read_to_string(&manifest_path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %manifest_path.display(), error = %e, "failed to read plugin manifest");
                    continue;
                },
            };

            let manifest = match parse_manifest(&content, &manifest_path) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %manifest_path.display(), error = %e, "skipping invalid plugin manifest");
                    continue;
                },
            };

            if !seen.insert(manifest.name.clone()) {
                warn!(
                    plugin = %manifest.name,
                    path = %manifest_path.display(),
                    "duplicate plugin name, keeping the first one found"
                );
                continue;
            }

            let mut descriptor = manifest.into_descriptor(&plugin_dir, &self.defaults);
            if self.disabled.contains(&descriptor.name) {
                descriptor.enabled = false;
            }
            debug!(plugin = %descriptor.name, entry = %descriptor.entry.display(), "discovered plugin");
            out.push(descriptor);
        }
    }
}

#[async_trait]
impl DescriptorSource for FsPluginSource {
    async fn list(&self) -> Result<Vec<PluginDescriptor>> {
        let mut found = Vec::new();
        let mut seen = BTreeSet::new();

        for base in &self.search_paths {
            if !base.is_dir() {
                continue;
            }
            self.scan_dir(base, &mut found, &mut seen);
        }

        Ok(order_by_dependencies(found))
    }
}

/// A fixed list of descriptors, used when plugins are registered in code.
#[derive(Debug, Clone, Default)]
pub struct StaticSource(pub Vec<PluginDescriptor>);

#[async_trait]
impl DescriptorSource for StaticSource {
    async fn list(&self) -> Result<Vec<PluginDescriptor>> {
        Ok(order_by_dependencies(self.0.clone()))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn write_plugin(base: &Path, dir: &str, manifest: &str) {
        std::fs::create_dir_all(base.join(dir)).unwrap();
        std::fs::write(base.join(dir).join(MANIFEST_FILE), manifest).unwrap();
    }

    #[tokio::test]
    async fn discover_plugins_in_temp_dir() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(
            tmp.path(),
            "echo",
            "name = \"echo\"\nentry = \"./worker\"\n",
        );

        let source = FsPluginSource::new(vec![tmp.path().to_path_buf()], PluginDefaults::default());
        let plugins = source.list().await.unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name, "echo");
        assert_eq!(plugins[0].entry, tmp.path().join("echo/worker"));
        assert!(plugins[0].enabled);
    }

    #[tokio::test]
    async fn discover_skips_missing_dirs() {
        let source =
            FsPluginSource::new(vec![PathBuf::from("/nonexistent")], PluginDefaults::default());
        assert!(source.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn discover_skips_invalid_manifests() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(tmp.path(), "bad", "this is not toml = = =");
        write_plugin(tmp.path(), "dotted", "name = \"a.b\"\nentry = \"x\"\n");
        std::fs::create_dir_all(tmp.path().join("no-manifest")).unwrap();

        let source = FsPluginSource::new(vec![tmp.path().to_path_buf()], PluginDefaults::default());
        assert!(source.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_duplicate_wins_across_search_paths() {
        let project = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write_plugin(project.path(), "x", "name = \"x\"\nentry = \"project\"\n");
        write_plugin(user.path(), "x", "name = \"x\"\nentry = \"user\"\n");

        let source = FsPluginSource::new(
            vec![project.path().to_path_buf(), user.path().to_path_buf()],
            PluginDefaults::default(),
        );
        let plugins = source.list().await.unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].entry, PathBuf::from("project"));
    }

    #[tokio::test]
    async fn disabled_plugins_are_listed_but_marked() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(tmp.path(), "a", "name = \"a\"\nentry = \"x\"\nenabled = false\n");
        write_plugin(tmp.path(), "b", "name = \"b\"\nentry = \"x\"\n");

        let source = FsPluginSource::new(vec![tmp.path().to_path_buf()], PluginDefaults::default())
            .with_disabled(["b".to_string()]);
        let plugins = source.list().await.unwrap();
        assert_eq!(plugins.len(), 2);
        assert!(plugins.iter().all(|d| !d.enabled));
    }

    #[tokio::test]
    async fn results_are_dependency_ordered() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(
            tmp.path(),
            "a-app",
            "name = \"app\"\nentry = \"x\"\ndependencies = [\"db\"]\n",
        );
        write_plugin(tmp.path(), "b-db", "name = \"db\"\nentry = \"x\"\n");

        let source = FsPluginSource::new(vec![tmp.path().to_path_buf()], PluginDefaults::default());
        let names: Vec<String> = source
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, ["db", "app"]);
    }
}
