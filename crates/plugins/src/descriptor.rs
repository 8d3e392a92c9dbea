//! The immutable description of one installable plugin.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    time::Duration,
};

use {
    plughub_config::{PluginDefaults, RestartPolicy},
    serde::Serialize,
};

use crate::error::{Error, Result};

/// Everything the supervisor needs to launch and keep one worker alive.
///
/// Loaded once per discovery pass and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginDescriptor {
    /// Unique key, also the namespace of the plugin's capabilities.
    pub name: String,
    /// Executable launched as the worker process.
    pub entry: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Directory the worker runs in, normally the manifest's directory.
    pub working_dir: Option<PathBuf>,
    pub restart_policy: RestartPolicy,
    pub max_restarts: u32,
    #[serde(with = "plughub_config::duration::serde_str")]
    pub restart_delay: Duration,
    #[serde(with = "plughub_config::duration::serde_str")]
    pub call_timeout: Duration,
    /// Names of plugins this one expects to be started first. Informational.
    pub dependencies: BTreeSet<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    /// Disabled plugins are listed but never started.
    pub enabled: bool,
}

impl PluginDescriptor {
    /// A descriptor with the built-in lifecycle defaults.
    pub fn new(name: impl Into<String>, entry: impl Into<PathBuf>) -> Self {
        Self::with_defaults(name, entry, &PluginDefaults::default())
    }

    pub fn with_defaults(
        name: impl Into<String>,
        entry: impl Into<PathBuf>,
        defaults: &PluginDefaults,
    ) -> Self {
        Self {
            name: name.into(),
            entry: entry.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            restart_policy: defaults.restart_policy,
            max_restarts: defaults.max_restarts,
            restart_delay: defaults.restart_delay,
            call_timeout: defaults.call_timeout,
            dependencies: BTreeSet::new(),
            version: None,
            description: None,
            enabled: true,
        }
    }

    #[must_use]
    pub fn restart_policy(mut self, policy: RestartPolicy, max_restarts: u32) -> Self {
        self.restart_policy = policy;
        self.max_restarts = max_restarts;
        self
    }

    #[must_use]
    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into());
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether a worker that has already been restarted `restart_count` times
    /// may be restarted again after a failure.
    #[must_use]
    pub fn permits_restart(&self, restart_count: u32) -> bool {
        match self.restart_policy {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => restart_count < self.max_restarts,
            RestartPolicy::Never => false,
        }
    }
}

/// Plugin names become capability namespaces (`<plugin>.<capability>`), so
/// they must be non-empty and free of dots and whitespace.
pub fn validate_plugin_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name.contains('.') {
        Some("must not contain '.'")
    } else if name.chars().any(char::is_whitespace) {
        Some("must not contain whitespace")
    } else if name.chars().any(char::is_control) {
        Some("must not contain control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(Error::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
