//! Plugin descriptors: manifest parsing, filesystem discovery, and start ordering.
//!
//! Every plugin lives in its own directory containing a `plugin.toml`
//! manifest. Discovery turns manifests into immutable [`PluginDescriptor`]s
//! that the supervisor consumes; nothing here touches a process.

pub mod descriptor;
pub mod discovery;
pub mod error;
pub mod manifest;
pub mod sequence;

pub use {
    descriptor::{PluginDescriptor, validate_plugin_name},
    discovery::{DescriptorSource, FsPluginSource, StaticSource},
    error::{Error, Result},
    manifest::{LifecycleOverrides, MANIFEST_FILE, PluginManifest, parse_manifest},
    plughub_config::RestartPolicy,
    sequence::order_by_dependencies,
};
