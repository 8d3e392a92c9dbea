//! Configuration loading, validation, env substitution, and duration parsing.
//!
//! Config files: `plughub.toml`, `plughub.yaml`, or `plughub.json`
//! Searched in `./` then `~/.config/plughub/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod duration;
pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    duration::{format_duration, parse_duration},
    loader::{
        config_dir, default_plugin_dirs, discover_and_load, find_or_default_config_path,
        load_config, load_or_default,
    },
    schema::{
        HealthConfig, MetricsConfig, PluginDefaults, PluginsConfig, PlughubConfig, RestartPolicy,
        SupervisorConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult},
};
