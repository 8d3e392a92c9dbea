use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

/// Machine-readable failure classification, shared by lifecycle errors,
/// `status()` and invocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    SpawnFailure,
    HandshakeTimeout,
    CapabilityQueryFailed,
    DuplicateCapabilityName,
    InvocationTimeout,
    OwnerNotRunning,
    UnknownCapability,
    AlreadyManaged,
    RestartBudgetExhausted,
    /// The worker answered with an `error` frame.
    WorkerError,
    /// The stream ended, or the supervisor shut down while a call was pending.
    ChannelClosed,
    /// Lifecycle call on a name with no record.
    UnknownPlugin,
    /// The worker process exited while running.
    WorkerExited,
}

impl FailureCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SpawnFailure => "spawn_failure",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::CapabilityQueryFailed => "capability_query_failed",
            Self::DuplicateCapabilityName => "duplicate_capability_name",
            Self::InvocationTimeout => "invocation_timeout",
            Self::OwnerNotRunning => "owner_not_running",
            Self::UnknownCapability => "unknown_capability",
            Self::AlreadyManaged => "already_managed",
            Self::RestartBudgetExhausted => "restart_budget_exhausted",
            Self::WorkerError => "worker_error",
            Self::ChannelClosed => "channel_closed",
            Self::UnknownPlugin => "unknown_plugin",
            Self::WorkerExited => "worker_exited",
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure returned to dispatchers by `invoke`.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{qualified_name}: {message} ({code})")]
pub struct InvocationFailure {
    pub code: FailureCode,
    pub owner: String,
    pub qualified_name: String,
    pub message: String,
    /// Code carried by the worker's `error` frame, for `WorkerError`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl InvocationFailure {
    #[must_use]
    pub fn new(
        code: FailureCode,
        owner: impl Into<String>,
        qualified_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            owner: owner.into(),
            qualified_name: qualified_name.into(),
            message: message.into(),
            worker_code: None,
            data: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn worker for plugin '{plugin}': {source}")]
    Spawn {
        plugin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("handshake with plugin '{plugin}' failed: {reason}")]
    Handshake { plugin: String, reason: String },
    #[error("capability query for plugin '{plugin}' failed: {reason}")]
    CapabilityQuery { plugin: String, reason: String },
    #[error("plugin '{plugin}' advertises '{name}' more than once")]
    DuplicateCapability { plugin: String, name: String },
    #[error("plugin '{plugin}' exited: {reason}")]
    WorkerExited { plugin: String, reason: String },
    #[error("plugin '{plugin}' is already managed")]
    AlreadyManaged { plugin: String },
    #[error("unknown plugin '{plugin}'")]
    UnknownPlugin { plugin: String },
    #[error("plugin '{plugin}' will not be restarted: {reason}")]
    RestartBudgetExhausted { plugin: String, reason: String },
    #[error(transparent)]
    Invocation(#[from] InvocationFailure),
    #[error(transparent)]
    Plugins(#[from] plughub_plugins::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    /// The failure class, for errors that belong to the supervisor taxonomy.
    #[must_use]
    pub fn code(&self) -> Option<FailureCode> {
        match self {
            Self::Spawn { .. } => Some(FailureCode::SpawnFailure),
            Self::Handshake { .. } => Some(FailureCode::HandshakeTimeout),
            Self::CapabilityQuery { .. } => Some(FailureCode::CapabilityQueryFailed),
            Self::DuplicateCapability { .. } => Some(FailureCode::DuplicateCapabilityName),
            Self::WorkerExited { .. } => Some(FailureCode::WorkerExited),
            Self::AlreadyManaged { .. } => Some(FailureCode::AlreadyManaged),
            Self::UnknownPlugin { .. } => Some(FailureCode::UnknownPlugin),
            Self::RestartBudgetExhausted { .. } => Some(FailureCode::RestartBudgetExhausted),
            Self::Invocation(failure) => Some(failure.code),
            Self::Plugins(_) | Self::Io(_) | Self::Message { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_code_serializes_snake_case() {
        let json = serde_json::to_string(&FailureCode::RestartBudgetExhausted).unwrap();
        assert_eq!(json, "\"restart_budget_exhausted\"");
        assert_eq!(
            FailureCode::OwnerNotRunning.to_string(),
            serde_json::from_str::<String>(
                &serde_json::to_string(&FailureCode::OwnerNotRunning).unwrap()
            )
            .unwrap()
        );
    }

    #[test]
    fn errors_carry_codes() {
        let err = Error::Handshake {
            plugin: "echo".into(),
            reason: "timed out".into(),
        };
        assert_eq!(err.code(), Some(FailureCode::HandshakeTimeout));
        assert!(Error::message("x").code().is_none());

        let failure = InvocationFailure::new(
            FailureCode::UnknownCapability,
            "echo",
            "echo.nope",
            "no such capability",
        );
        assert_eq!(Error::from(failure).code(), Some(FailureCode::UnknownCapability));
    }

    #[test]
    fn invocation_failure_json_shape() {
        let mut failure =
            InvocationFailure::new(FailureCode::WorkerError, "gh", "gh.issues", "boom");
        failure.worker_code = Some(-32602);
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["code"], "worker_error");
        assert_eq!(json["owner"], "gh");
        assert_eq!(json["worker_code"], -32602);
        assert!(json.get("data").is_none());
    }
}
