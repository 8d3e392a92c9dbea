//! Config schema types (plugin search, per-plugin defaults, health, supervisor).

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlughubConfig {
    pub plugins: PluginsConfig,
    pub defaults: PluginDefaults,
    pub health: HealthConfig,
    pub supervisor: SupervisorConfig,
    pub metrics: MetricsConfig,
}

/// Where plugin manifests are discovered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directories scanned for `<plugin>/plugin.toml`, in priority order.
    /// When empty, `./plugins` and `~/.config/plughub/plugins` are used.
    pub dirs: Vec<PathBuf>,
    /// Plugin names that are discovered but never started.
    pub disabled: Vec<String>,
}

/// Whether and how often a failed worker is restarted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    #[default]
    OnFailure,
    Never,
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::OnFailure => write!(f, "on-failure"),
            Self::Never => write!(f, "never"),
        }
    }
}

/// Values applied to manifests that leave a lifecycle field unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginDefaults {
    pub restart_policy: RestartPolicy,
    pub max_restarts: u32,
    #[serde(with = "crate::duration::serde_str")]
    pub restart_delay: Duration,
    #[serde(with = "crate::duration::serde_str")]
    pub call_timeout: Duration,
}

impl Default for PluginDefaults {
    fn default() -> Self {
        Self {
            restart_policy: RestartPolicy::OnFailure,
            max_restarts: 3,
            restart_delay: Duration::from_secs(1),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Periodic liveness probing of running workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Whether the health monitor runs. Defaults to true.
    pub enabled: bool,
    /// Time between probe rounds. Defaults to "30s".
    #[serde(with = "crate::duration::serde_str")]
    pub interval: Duration,
    /// Upper bound for a single probe. Defaults to "5s".
    #[serde(with = "crate::duration::serde_str")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Supervisor-wide knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Capacity of the lifecycle event channel. Slow subscribers lag past this.
    pub event_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { event_buffer: 256 }
    }
}

/// Metrics recorder settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Labels attached to every exported metric.
    pub labels: std::collections::BTreeMap<String, String>,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg: PlughubConfig = toml::from_str("").unwrap();
        assert!(cfg.plugins.dirs.is_empty());
        assert_eq!(cfg.defaults.restart_policy, RestartPolicy::OnFailure);
        assert_eq!(cfg.defaults.max_restarts, 3);
        assert_eq!(cfg.defaults.call_timeout, Duration::from_secs(30));
        assert!(cfg.health.enabled);
        assert_eq!(cfg.supervisor.event_buffer, 256);
        assert!(!cfg.metrics.enabled);
    }

    #[test]
    fn parses_durations_and_policy() {
        let cfg: PlughubConfig = toml::from_str(
            r#"
[defaults]
restart_policy = "always"
restart_delay = "250ms"
call_timeout = "2m"

[health]
interval = "10s"
probe_timeout = "1s"
"#,
        )
        .unwrap();
        assert_eq!(cfg.defaults.restart_policy, RestartPolicy::Always);
        assert_eq!(cfg.defaults.restart_delay, Duration::from_millis(250));
        assert_eq!(cfg.defaults.call_timeout, Duration::from_secs(120));
        assert_eq!(cfg.health.interval, Duration::from_secs(10));
        assert_eq!(cfg.health.probe_timeout, Duration::from_secs(1));
    }

    #[test]
    fn rejects_unknown_policy() {
        let err = toml::from_str::<PlughubConfig>("[defaults]\nrestart_policy = \"sometimes\"")
            .unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn policy_display_matches_wire_names() {
        assert_eq!(RestartPolicy::OnFailure.to_string(), "on-failure");
        assert_eq!(
            serde_json::to_value(RestartPolicy::OnFailure).unwrap(),
            serde_json::json!("on-failure")
        );
    }
}
