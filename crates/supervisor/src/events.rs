//! Lifecycle notifications published by the supervisor.
//!
//! Subscribers get every state change plus coarser `started`, `stopped` and
//! `failed` events. Events for one plugin are delivered in the order the
//! transitions happened; there is no ordering across plugins.

use {serde::Serialize, tokio::sync::broadcast, tracing::trace};

use crate::{error::FailureCode, types::WorkerState};

pub const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StateChanged {
        plugin: String,
        /// `None` when the record was just created.
        from: Option<WorkerState>,
        to: WorkerState,
        at_ms: u64,
    },
    Started {
        plugin: String,
        pid: Option<u32>,
        capabilities: usize,
    },
    Stopped {
        plugin: String,
    },
    Failed {
        plugin: String,
        code: FailureCode,
        reason: String,
        /// No automatic restart will follow.
        terminal: bool,
    },
}

impl LifecycleEvent {
    #[must_use]
    pub fn plugin(&self) -> &str {
        match self {
            Self::StateChanged { plugin, .. }
            | Self::Started { plugin, .. }
            | Self::Stopped { plugin }
            | Self::Failed { plugin, .. } => plugin,
        }
    }
}

/// Cloneable publishing side of the event stream.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        if self.tx.send(event).is_err() {
            trace!("lifecycle event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}
