use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::PlughubConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "plughub.toml",
    "plughub.yaml",
    "plughub.yml",
    "plughub.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<PlughubConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Load an explicitly requested config file, or discover one when `path` is `None`.
///
/// An explicit path that fails to load is an error; a discovered one falls
/// back to defaults with a warning.
pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<PlughubConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(discover_and_load()),
    }
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./plughub.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/plughub/plughub.{toml,yaml,yml,json}` (user-global)
///
/// Returns `PlughubConfig::default()` if no config file is found.
pub fn discover_and_load() -> PlughubConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    PlughubConfig::default()
}

/// Find the first config file in standard locations.
pub(crate) fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let config_dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| config_dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/plughub/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "plughub").map(|d| d.config_dir().to_path_buf())
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("plughub.toml")
}

/// Plugin directories to scan when the config does not list any.
pub fn default_plugin_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from("plugins")];
    if let Some(config_dir) = config_dir() {
        dirs.push(config_dir.join("plugins"));
    }
    dirs
}

impl PlughubConfig {
    /// Configured plugin directories, or [`default_plugin_dirs`] when none are set.
    #[must_use]
    pub fn plugin_dirs(&self) -> Vec<PathBuf> {
        if self.plugins.dirs.is_empty() {
            default_plugin_dirs()
        } else {
            self.plugins.dirs.clone()
        }
    }
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<PlughubConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
