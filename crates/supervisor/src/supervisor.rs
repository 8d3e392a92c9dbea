//! The process supervisor: the record table and the public lifecycle API.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use {
    plughub_common::time::now_ms,
    plughub_config::SupervisorConfig,
    plughub_plugins::{DescriptorSource, PluginDescriptor, validate_plugin_name},
    serde_json::Value,
    tokio::sync::{RwLock, broadcast, mpsc, oneshot, watch},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{
    error::{Error, FailureCode, InvocationFailure, Result},
    events::{DEFAULT_EVENT_BUFFER, EventBus, LifecycleEvent},
    launcher::WorkerLauncher,
    registry::{CapabilityRegistry, owner_of},
    types::{CapabilityEntry, WorkerRecord, WorkerState, WorkerStatus},
    worker::{Command, Session, WorkerHandle, WorkerTask},
};

/// A running session the health monitor may probe.
pub(crate) struct ProbeTarget {
    pub plugin: String,
    pub session: Session,
    pub commands: mpsc::UnboundedSender<Command>,
}

/// Owns one worker per plugin and keeps it alive according to its restart
/// policy. All state lives inside the instance; there is no global state.
pub struct Supervisor {
    workers: RwLock<BTreeMap<String, Arc<WorkerHandle>>>,
    launcher: Arc<dyn WorkerLauncher>,
    registry: Arc<CapabilityRegistry>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self::with_event_buffer(launcher, DEFAULT_EVENT_BUFFER)
    }

    pub fn with_event_buffer(launcher: Arc<dyn WorkerLauncher>, event_buffer: usize) -> Self {
        Self {
            workers: RwLock::new(BTreeMap::new()),
            launcher,
            registry: Arc::new(CapabilityRegistry::new()),
            events: EventBus::new(event_buffer),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(launcher: Arc<dyn WorkerLauncher>, config: &SupervisorConfig) -> Self {
        Self::with_event_buffer(launcher, config.event_buffer)
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Subscribe to lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Cancelled when [`Supervisor::shutdown`] begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start managing a plugin.
    ///
    /// Returns once the first start attempt has finished. Spawn, handshake
    /// and capability failures are not returned here; they drive the restart
    /// policy and show in [`Supervisor::status`].
    pub async fn start(&self, descriptor: PluginDescriptor) -> Result<()> {
        validate_plugin_name(&descriptor.name)?;
        let name = descriptor.name.clone();
        let (started_tx, started_rx) = oneshot::channel();

        {
            let mut workers = self.workers.write().await;
            if self.shutdown.is_cancelled() {
                return Err(Error::message("supervisor is shutting down"));
            }
            if workers.contains_key(&name) {
                return Err(Error::AlreadyManaged { plugin: name });
            }

            let record = WorkerRecord::new(descriptor.clone());
            let at_ms = record.last_transition_at_ms;
            let record = Arc::new(RwLock::new(record));
            let session = Arc::new(RwLock::new(None));
            let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
            let (commands_tx, commands_rx) = mpsc::unbounded_channel();

            self.registry.track(&name, state_rx).await;
            self.events.emit(LifecycleEvent::StateChanged {
                plugin: name.clone(),
                from: None,
                to: WorkerState::Starting,
                at_ms,
            });

            let task = WorkerTask::new(
                descriptor,
                Arc::clone(&record),
                Arc::clone(&session),
                state_tx,
                commands_rx,
                Arc::clone(&self.launcher),
                Arc::clone(&self.registry),
                self.events.clone(),
                started_tx,
            );
            let handle = tokio::spawn(task.run());

            workers.insert(
                name.clone(),
                Arc::new(WorkerHandle {
                    record,
                    session,
                    commands: commands_tx,
                    task: tokio::sync::Mutex::new(Some(handle)),
                }),
            );
        }

        info!(plugin = %name, "plugin scheduled");
        let _ = started_rx.await;
        Ok(())
    }

    /// Start every enabled descriptor from `source`, in its order. Plugins
    /// that are already managed are skipped. Returns the names started.
    pub async fn start_all(&self, source: &dyn DescriptorSource) -> Result<Vec<String>> {
        let descriptors = source.list().await?;
        let mut started = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let name = descriptor.name.clone();
            if !descriptor.enabled {
                info!(plugin = %name, "plugin disabled, not starting");
                continue;
            }
            match self.start(descriptor).await {
                Ok(()) => started.push(name),
                Err(e) if e.code() == Some(FailureCode::AlreadyManaged) => {
                    warn!(plugin = %name, "plugin already managed, skipping");
                },
                Err(e) => warn!(plugin = %name, error = %e, "failed to schedule plugin"),
            }
        }

        Ok(started)
    }

    async fn handle(&self, name: &str) -> Result<Arc<WorkerHandle>> {
        self.workers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownPlugin {
                plugin: name.to_string(),
            })
    }

    async fn send_and_wait(
        &self,
        name: &str,
        make: impl FnOnce(oneshot::Sender<()>) -> Command,
    ) -> Result<()> {
        let handle = self.handle(name).await?;
        let (done_tx, done_rx) = oneshot::channel();
        let gone = || Error::UnknownPlugin {
            plugin: name.to_string(),
        };
        handle.commands.send(make(done_tx)).map_err(|_| gone())?;
        done_rx.await.map_err(|_| gone())
    }

    /// Gracefully stop a plugin's worker. The record stays. Idempotent.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.send_and_wait(name, |done| Command::Stop { done }).await
    }

    /// Stop (if running) and start again with a fresh restart budget. This is
    /// the only way to clear `RestartBudgetExhausted`.
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.send_and_wait(name, |done| Command::Restart { done })
            .await
    }

    /// Stop a plugin and delete its record.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let handle = self
            .workers
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::UnknownPlugin {
                plugin: name.to_string(),
            })?;

        let _ = handle.commands.send(Command::Exit);
        join_worker(name, &handle).await;
        self.registry.forget(name).await;
        info!(plugin = %name, "plugin unloaded");
        Ok(())
    }

    /// Snapshot of every record, keyed by plugin name.
    pub async fn status(&self) -> BTreeMap<String, WorkerStatus> {
        let handles: Vec<(String, Arc<WorkerHandle>)> = self
            .workers
            .read()
            .await
            .iter()
            .map(|(name, handle)| (name.clone(), Arc::clone(handle)))
            .collect();

        let mut status = BTreeMap::new();
        for (name, handle) in handles {
            status.insert(name, handle.record.read().await.status());
        }
        status
    }

    /// Full record of one plugin.
    pub async fn record(&self, name: &str) -> Option<WorkerRecord> {
        let handle = self.workers.read().await.get(name).cloned()?;
        let record = handle.record.read().await.clone();
        Some(record)
    }

    pub async fn catalog(&self) -> Vec<CapabilityEntry> {
        self.registry.catalog().await
    }

    /// Invoke `<plugin>.<capability>` with the owner's `call_timeout`, or
    /// `timeout` when given. Refused with `OwnerNotRunning` once shutdown has
    /// begun.
    pub async fn invoke(
        &self,
        qualified_name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> std::result::Result<Value, InvocationFailure> {
        if self.shutdown.is_cancelled() {
            return Err(InvocationFailure::new(
                FailureCode::OwnerNotRunning,
                owner_of(qualified_name).unwrap_or_default(),
                qualified_name,
                "supervisor is shutting down",
            ));
        }
        self.registry
            .invoke(qualified_name, arguments, timeout)
            .await
    }

    /// Sessions currently running, for the health monitor.
    pub(crate) async fn probe_targets(&self) -> Vec<ProbeTarget> {
        let handles: Vec<(String, Arc<WorkerHandle>)> = self
            .workers
            .read()
            .await
            .iter()
            .map(|(name, handle)| (name.clone(), Arc::clone(handle)))
            .collect();

        let mut targets = Vec::with_capacity(handles.len());
        for (plugin, handle) in handles {
            if handle.record.read().await.state != WorkerState::Running {
                continue;
            }
            if let Some(session) = handle.session.read().await.clone() {
                targets.push(ProbeTarget {
                    plugin,
                    session,
                    commands: handle.commands.clone(),
                });
            }
        }
        targets
    }

    /// Refuse new invocations, cancel pending ones, stop every worker
    /// (graceful, then forced) and wait for every worker task to finish.
    /// Records are kept.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let started = now_ms();

        let handles: Vec<(String, Arc<WorkerHandle>)> = self
            .workers
            .read()
            .await
            .iter()
            .map(|(name, handle)| (name.clone(), Arc::clone(handle)))
            .collect();

        for (name, handle) in &handles {
            self.registry.unbind(name).await;
            if let Some(session) = handle.session.read().await.clone() {
                session.channel.cancel_pending().await;
            }
            let _ = handle.commands.send(Command::Exit);
        }

        futures::future::join_all(
            handles
                .iter()
                .map(|(name, handle)| join_worker(name, handle)),
        )
        .await;

        info!(
            workers = handles.len(),
            elapsed_ms = now_ms().saturating_sub(started),
            "supervisor shut down"
        );
    }
}

async fn join_worker(name: &str, handle: &WorkerHandle) {
    let task = handle.task.lock().await.take();
    if let Some(task) = task
        && let Err(e) = task.await
    {
        warn!(plugin = %name, error = %e, "worker task ended abnormally");
    }
}
