//! Metric name and label definitions.
//!
//! Every metric recorded by the supervisor is named here so the exported set
//! stays documented in one place.

/// Worker lifecycle metrics
pub mod supervisor {
    /// Total number of worker launches (first starts and restarts)
    pub const WORKER_STARTS_TOTAL: &str = "plughub_worker_starts_total";
    /// Total number of automatic restarts scheduled by the restart policy
    pub const WORKER_RESTARTS_TOTAL: &str = "plughub_worker_restarts_total";
    /// Total number of worker failures, labelled by failure code
    pub const WORKER_FAILURES_TOTAL: &str = "plughub_worker_failures_total";
    /// Number of workers currently in the running state
    pub const WORKERS_RUNNING: &str = "plughub_workers_running";
    /// Time from spawn to a completed handshake, in seconds
    pub const HANDSHAKE_DURATION_SECONDS: &str = "plughub_handshake_duration_seconds";
}

/// Capability invocation metrics
pub mod invocations {
    /// Total number of invocations routed through the registry
    pub const TOTAL: &str = "plughub_invocations_total";
    /// Invocations that returned a structured failure, labelled by failure code
    pub const ERRORS_TOTAL: &str = "plughub_invocation_errors_total";
    /// Invocation duration in seconds
    pub const DURATION_SECONDS: &str = "plughub_invocation_duration_seconds";
}

/// Health monitor metrics
pub mod health {
    /// Total number of liveness probes issued
    pub const PROBES_TOTAL: &str = "plughub_health_probes_total";
    /// Probes that failed or timed out
    pub const PROBE_FAILURES_TOTAL: &str = "plughub_health_probe_failures_total";
}

/// Common label keys
pub mod labels {
    pub const PLUGIN: &str = "plugin";
    pub const CODE: &str = "code";
    pub const KIND: &str = "kind";
}

/// Standard histogram buckets
pub mod buckets {
    /// Invocation duration buckets (in seconds), 1ms to 5 minutes
    pub const INVOCATION_DURATION: &[f64] = &[
        0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    ];

    /// Handshake duration buckets (in seconds), 1ms to 30s
    pub const HANDSHAKE_DURATION: &[f64] =
        &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
}
