//! `plugin.toml` parsing.
//!
//! Each plugin lives in its own directory with a manifest:
//!
//! ```toml
//! name = "github"
//! description = "GitHub issues and pull requests"
//! entry = "./bin/github-worker"
//! args = ["--stdio"]
//! dependencies = ["auth"]
//!
//! [env]
//! GITHUB_TOKEN = "${GITHUB_TOKEN}"
//!
//! [lifecycle]
//! restart_policy = "on-failure"
//! max_restarts = 5
//! restart_delay = "2s"
//! call_timeout = "1m"
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    time::Duration,
};

use {
    plughub_config::{PluginDefaults, RestartPolicy, env_subst::substitute_env},
    serde::{Deserialize, Serialize},
};

use crate::{
    descriptor::{PluginDescriptor, validate_plugin_name},
    error::{Error, Result},
};

pub const MANIFEST_FILE: &str = "plugin.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub entry: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub lifecycle: LifecycleOverrides,
}

/// Per-plugin overrides of `[defaults]` from the host config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleOverrides {
    #[serde(default)]
    pub restart_policy: Option<RestartPolicy>,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    #[serde(default, with = "plughub_config::duration::serde_str_opt")]
    pub restart_delay: Option<Duration>,
    #[serde(default, with = "plughub_config::duration::serde_str_opt")]
    pub call_timeout: Option<Duration>,
}

fn default_true() -> bool {
    true
}

/// Parse manifest text. `path` is only used for error messages.
pub fn parse_manifest(content: &str, path: &Path) -> Result<PluginManifest> {
    let content = substitute_env(content);
    let manifest: PluginManifest =
        toml::from_str(&content).map_err(|e| Error::invalid_manifest(path, e.to_string()))?;

    validate_plugin_name(&manifest.name)?;
    if manifest.entry.trim().is_empty() {
        return Err(Error::invalid_manifest(path, "entry must not be empty"));
    }
    if manifest.lifecycle.call_timeout == Some(Duration::ZERO) {
        return Err(Error::invalid_manifest(
            path,
            "lifecycle.call_timeout must be greater than zero",
        ));
    }

    Ok(manifest)
}

impl PluginManifest {
    /// Resolve the manifest into a descriptor rooted at `dir`.
    ///
    /// Entries that look like paths (`./worker`, `bin/worker`) resolve against
    /// the plugin directory; bare commands (`node`, `python3`) are left for
    /// `PATH` lookup at spawn time.
    pub fn into_descriptor(self, dir: &Path, defaults: &PluginDefaults) -> PluginDescriptor {
        let entry = resolve_entry(&self.entry, dir);
        let lifecycle = self.lifecycle;

        PluginDescriptor {
            name: self.name,
            entry,
            args: self.args,
            env: self.env,
            working_dir: Some(dir.to_path_buf()),
            restart_policy: lifecycle.restart_policy.unwrap_or(defaults.restart_policy),
            max_restarts: lifecycle.max_restarts.unwrap_or(defaults.max_restarts),
            restart_delay: lifecycle.restart_delay.unwrap_or(defaults.restart_delay),
            call_timeout: lifecycle.call_timeout.unwrap_or(defaults.call_timeout),
            dependencies: self.dependencies.into_iter().collect::<BTreeSet<_>>(),
            version: self.version,
            description: self.description,
            enabled: self.enabled,
        }
    }
}

fn resolve_entry(entry: &str, dir: &Path) -> PathBuf {
    let path = Path::new(entry);
    if path.is_absolute() {
        path.to_path_buf()
    } else if entry.contains('/') || entry.contains(std::path::MAIN_SEPARATOR) {
        dir.join(path.strip_prefix("./").unwrap_or(path))
    } else {
        path.to_path_buf()
    }
}
