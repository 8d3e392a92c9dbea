//! Process-based plugin supervisor.
//!
//! This crate provides:
//! - Worker spawning behind a launcher seam (`launcher`)
//! - Framed request/response RPC with each worker (`channel`)
//! - The restart-policy state machine, one task per worker (`supervisor`)
//! - The namespaced capability catalog and invocation router (`registry`)
//! - Periodic health probes (`health`)
//! - Lifecycle events (`events`)

pub mod channel;
pub mod error;
pub mod events;
pub mod health;
pub mod launcher;
pub mod registry;
pub mod supervisor;
pub mod types;

mod worker;

pub use {
    channel::{ChannelError, WorkerChannel},
    error::{Error, FailureCode, InvocationFailure, Result},
    events::{EventBus, LifecycleEvent},
    health::HealthMonitor,
    launcher::{BoxedReader, BoxedWriter, LaunchedWorker, ProcessLauncher, WorkerLauncher, WorkerProcess},
    registry::{CapabilityRegistry, Resolution},
    supervisor::Supervisor,
    types::{
        CapabilityEntry, CapabilityKind, CapabilitySnapshot, LastError, WorkerRecord, WorkerState,
        WorkerStatus,
    },
};
