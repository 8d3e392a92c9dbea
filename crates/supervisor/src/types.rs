//! Worker records, capability entries and the status view.

use {
    plughub_common::time::now_ms,
    plughub_plugins::PluginDescriptor,
    plughub_protocol::{CapabilityDef, CapabilityList},
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::error::{Error, FailureCode};

/// Lifecycle state of one managed worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Failed,
    Stopping,
    Stopped,
}

impl WorkerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

/// One namespaced catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityEntry {
    pub owner: String,
    pub local_name: String,
    /// `<owner>.<local_name>`
    pub qualified_name: String,
    pub kind: CapabilityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schema: Value,
}

impl CapabilityEntry {
    #[must_use]
    pub fn new(owner: &str, kind: CapabilityKind, def: &CapabilityDef) -> Self {
        Self {
            owner: owner.to_string(),
            local_name: def.name.clone(),
            qualified_name: qualify(owner, &def.name),
            kind,
            description: def.description.clone(),
            schema: def.schema.clone(),
        }
    }
}

#[must_use]
pub fn qualify(owner: &str, local: &str) -> String {
    format!("{owner}.{local}")
}

/// The last successful capability query of a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilitySnapshot {
    pub capabilities: CapabilityList,
    pub queried_at_ms: u64,
}

impl CapabilitySnapshot {
    #[must_use]
    pub fn new(capabilities: CapabilityList) -> Self {
        Self {
            capabilities,
            queried_at_ms: now_ms(),
        }
    }

    /// Flatten into catalog entries for `owner`, tools first.
    #[must_use]
    pub fn entries(&self, owner: &str) -> Vec<CapabilityEntry> {
        let list = &self.capabilities;
        list.tools
            .iter()
            .map(|d| CapabilityEntry::new(owner, CapabilityKind::Tool, d))
            .chain(
                list.resources
                    .iter()
                    .map(|d| CapabilityEntry::new(owner, CapabilityKind::Resource, d)),
            )
            .chain(
                list.prompts
                    .iter()
                    .map(|d| CapabilityEntry::new(owner, CapabilityKind::Prompt, d)),
            )
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub code: FailureCode,
    pub message: String,
    pub at_ms: u64,
}

impl LastError {
    #[must_use]
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            at_ms: now_ms(),
        }
    }

    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        Self::new(err.code().unwrap_or(FailureCode::WorkerError), err.to_string())
    }
}

/// Supervisor-owned bookkeeping for one plugin.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub descriptor: PluginDescriptor,
    pub state: WorkerState,
    /// OS process id while a process is attached.
    pub pid: Option<u32>,
    /// Automatic restarts since the last manual start or restart.
    pub restart_count: u32,
    pub last_transition_at_ms: u64,
    /// Retained after failure; replaced by the next successful query.
    pub snapshot: Option<CapabilitySnapshot>,
    pub last_error: Option<LastError>,
    /// Incremented every time the worker enters `Starting`.
    pub generation: u64,
}

impl WorkerRecord {
    #[must_use]
    pub fn new(descriptor: PluginDescriptor) -> Self {
        Self {
            descriptor,
            state: WorkerState::Starting,
            pid: None,
            restart_count: 0,
            last_transition_at_ms: now_ms(),
            snapshot: None,
            last_error: None,
            generation: 0,
        }
    }

    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        let (tools, resources, prompts) = self
            .snapshot
            .as_ref()
            .map(|s| {
                (
                    s.capabilities.tools.len(),
                    s.capabilities.resources.len(),
                    s.capabilities.prompts.len(),
                )
            })
            .unwrap_or_default();

        WorkerStatus {
            state: self.state,
            restart_count: self.restart_count,
            last_transition_at_ms: self.last_transition_at_ms,
            tool_count: tools,
            resource_count: resources,
            prompt_count: prompts,
            pid: self.pid,
            last_error: self.last_error.clone(),
        }
    }
}

/// Per-plugin entry of `Supervisor::status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub restart_count: u32,
    pub last_transition_at_ms: u64,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_list() -> CapabilityList {
        CapabilityList {
            tools: vec![CapabilityDef::new("search"), CapabilityDef::new("create")],
            resources: vec![CapabilityDef::new("readme")],
            prompts: vec![],
        }
    }

    #[test]
    fn snapshot_entries_are_qualified() {
        let snapshot = CapabilitySnapshot::new(sample_list());
        let entries = snapshot.entries("github");
        let names: Vec<&str> = entries.iter().map(|e| e.qualified_name.as_str()).collect();
        assert_eq!(names, ["github.search", "github.create", "github.readme"]);
        assert_eq!(entries[2].kind, CapabilityKind::Resource);
        assert_eq!(entries[0].owner, "github");
    }

    #[test]
    fn status_counts_come_from_snapshot() {
        let mut record = WorkerRecord::new(PluginDescriptor::new("github", "gh"));
        assert_eq!(record.status().tool_count, 0);

        record.snapshot = Some(CapabilitySnapshot::new(sample_list()));
        record.state = WorkerState::Failed;
        let status = record.status();
        assert_eq!(status.state, WorkerState::Failed);
        assert_eq!(status.tool_count, 2);
        assert_eq!(status.resource_count, 1);
        assert_eq!(status.prompt_count, 0);
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&WorkerState::Stopping).unwrap(),
            "\"stopping\""
        );
        assert_eq!(WorkerState::Running.to_string(), "running");
    }
}
