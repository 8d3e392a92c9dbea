//! The per-worker task.
//!
//! Every managed plugin gets one task that owns its process and channel and
//! performs all of its state transitions, so transitions for one plugin are
//! strictly sequential. The rest of the supervisor talks to it through a
//! command queue and reads its record through a shared lock.

use std::{sync::Arc, time::Duration};

use {
    plughub_common::time::now_ms,
    plughub_plugins::{PluginDescriptor, RestartPolicy},
    plughub_protocol::CapabilityList,
    tokio::sync::{RwLock, mpsc, oneshot, watch},
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use plughub_metrics::{counter, gauge, histogram, labels, supervisor as supervisor_metrics};

use crate::{
    channel::WorkerChannel,
    error::{Error, FailureCode},
    events::{EventBus, LifecycleEvent},
    launcher::{LaunchedWorker, WorkerLauncher, WorkerProcess, describe_exit},
    registry::CapabilityRegistry,
    types::{CapabilitySnapshot, LastError, WorkerRecord, WorkerState},
};

pub(crate) enum Command {
    /// Graceful stop; the record stays.
    Stop { done: oneshot::Sender<()> },
    /// Stop if needed, clear the restart budget and start again. `done`
    /// fires once the new start attempt has finished.
    Restart { done: oneshot::Sender<()> },
    /// A health probe for session `generation` failed.
    ProbeFailed { generation: u64, reason: String },
    /// A health probe for session `generation` returned a capability list.
    Refreshed {
        generation: u64,
        capabilities: CapabilityList,
    },
    /// Stop if needed and end the task.
    Exit,
}

/// The live channel of a running session, shared with the health monitor.
#[derive(Clone)]
pub(crate) struct Session {
    pub generation: u64,
    pub channel: Arc<WorkerChannel>,
}

/// What the supervisor keeps for each managed plugin.
pub(crate) struct WorkerHandle {
    pub record: Arc<RwLock<WorkerRecord>>,
    pub session: Arc<RwLock<Option<Session>>>,
    pub commands: mpsc::UnboundedSender<Command>,
    pub task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct Live {
    process: Box<dyn WorkerProcess>,
    channel: Arc<WorkerChannel>,
    generation: u64,
}

enum Phase {
    Start,
    Running(Live),
    Failed(Error),
    Idle,
    Exit,
}

pub(crate) struct WorkerTask {
    name: String,
    descriptor: PluginDescriptor,
    record: Arc<RwLock<WorkerRecord>>,
    session: Arc<RwLock<Option<Session>>>,
    state_tx: watch::Sender<WorkerState>,
    commands: mpsc::UnboundedReceiver<Command>,
    launcher: Arc<dyn WorkerLauncher>,
    registry: Arc<CapabilityRegistry>,
    events: EventBus,
    /// Notified when the next start attempt finishes.
    start_waiters: Vec<oneshot::Sender<()>>,
}

impl WorkerTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        descriptor: PluginDescriptor,
        record: Arc<RwLock<WorkerRecord>>,
        session: Arc<RwLock<Option<Session>>>,
        state_tx: watch::Sender<WorkerState>,
        commands: mpsc::UnboundedReceiver<Command>,
        launcher: Arc<dyn WorkerLauncher>,
        registry: Arc<CapabilityRegistry>,
        events: EventBus,
        started: oneshot::Sender<()>,
    ) -> Self {
        Self {
            name: descriptor.name.clone(),
            descriptor,
            record,
            session,
            state_tx,
            commands,
            launcher,
            registry,
            events,
            start_waiters: vec![started],
        }
    }

    /// Drive the worker until it is unloaded or the supervisor shuts down.
    /// The record is already in `Starting` when this is called.
    pub(crate) async fn run(mut self) {
        let mut phase = Phase::Start;
        let mut first = true;

        loop {
            phase = match phase {
                Phase::Start => {
                    let attempt = self.start_session(first).await;
                    first = false;
                    match attempt {
                        Ok(live) => {
                            self.notify_start_waiters();
                            Phase::Running(live)
                        },
                        Err(err) => Phase::Failed(err),
                    }
                },
                Phase::Running(live) => self.supervise(live).await,
                Phase::Failed(err) => self.handle_failure(err).await,
                Phase::Idle => self.idle().await,
                Phase::Exit => break,
            };
        }

        debug!(plugin = %self.name, "worker task finished");
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    /// Move the record to `to`, applying `update` under the same lock, then
    /// publish the change.
    async fn transition(&self, to: WorkerState, update: impl FnOnce(&mut WorkerRecord)) -> u64 {
        let (from, generation, at_ms) = {
            let mut record = self.record.write().await;
            let from = record.state;
            record.state = to;
            record.last_transition_at_ms = now_ms();
            update(&mut record);
            (from, record.generation, record.last_transition_at_ms)
        };

        self.state_tx.send_replace(to);

        #[cfg(feature = "metrics")]
        if from != to {
            if to == WorkerState::Running {
                gauge!(supervisor_metrics::WORKERS_RUNNING).increment(1.0);
            } else if from == WorkerState::Running {
                gauge!(supervisor_metrics::WORKERS_RUNNING).decrement(1.0);
            }
        }

        debug!(plugin = %self.name, %from, %to, "worker state changed");
        self.events.emit(LifecycleEvent::StateChanged {
            plugin: self.name.clone(),
            from: Some(from),
            to,
            at_ms,
        });
        generation
    }

    /// Callers of `start`/`restart` wait until the attempt has either
    /// reached `Running` or been recorded as a failure.
    fn notify_start_waiters(&mut self) {
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    async fn state(&self) -> WorkerState {
        self.record.read().await.state
    }

    async fn reset_restart_budget(&self) {
        let mut record = self.record.write().await;
        record.restart_count = 0;
        record.last_error = None;
    }

    // ── Starting ────────────────────────────────────────────────────────────

    /// Spawn, handshake, query and ingest. On success the record is
    /// `Running`; on failure everything spawned has been torn down.
    async fn start_session(&mut self, first: bool) -> Result<Live, Error> {
        let generation = if first {
            let mut record = self.record.write().await;
            record.generation += 1;
            record.pid = None;
            record.generation
        } else {
            self.transition(WorkerState::Starting, |r| {
                r.generation += 1;
                r.pid = None;
            })
            .await
        };

        #[cfg(feature = "metrics")]
        counter!(supervisor_metrics::WORKER_STARTS_TOTAL, labels::PLUGIN => self.name.clone())
            .increment(1);

        let LaunchedWorker {
            reader,
            writer,
            mut process,
        } = self
            .launcher
            .launch(&self.descriptor)
            .await
            .map_err(|source| Error::Spawn {
                plugin: self.name.clone(),
                source,
            })?;

        let pid = process.pid();
        {
            self.record.write().await.pid = pid;
        }

        let channel = WorkerChannel::new(&self.name, reader, writer);
        let timeout = self.descriptor.call_timeout;

        #[cfg(feature = "metrics")]
        let handshake_start = std::time::Instant::now();

        let handshake = tokio::select! {
            result = channel.handshake(timeout) => result,
            status = process.wait() => Err(Error::Handshake {
                plugin: self.name.clone(),
                reason: format!("{} before handshake", describe_exit(&status)),
            }),
        };
        if let Err(err) = handshake {
            teardown(process.as_mut(), &channel).await;
            return Err(err);
        }

        #[cfg(feature = "metrics")]
        histogram!(supervisor_metrics::HANDSHAKE_DURATION_SECONDS, labels::PLUGIN => self.name.clone())
            .record(handshake_start.elapsed().as_secs_f64());

        let capabilities = tokio::select! {
            result = channel.query_capabilities(timeout) => result,
            status = process.wait() => Err(Error::CapabilityQuery {
                plugin: self.name.clone(),
                reason: describe_exit(&status),
            }),
        };
        let capabilities = match capabilities {
            Ok(c) => c,
            Err(err) => {
                teardown(process.as_mut(), &channel).await;
                return Err(err);
            },
        };

        let snapshot = CapabilitySnapshot::new(capabilities);
        let entries = snapshot.entries(&self.name);
        let count = entries.len();
        if let Err(err) = self
            .registry
            .ingest(&self.name, entries, Arc::clone(&channel), timeout)
            .await
        {
            teardown(process.as_mut(), &channel).await;
            return Err(err);
        }

        *self.session.write().await = Some(Session {
            generation,
            channel: Arc::clone(&channel),
        });
        self.transition(WorkerState::Running, |r| r.snapshot = Some(snapshot))
            .await;

        info!(plugin = %self.name, pid = ?pid, capabilities = count, generation, "plugin worker running");
        self.events.emit(LifecycleEvent::Started {
            plugin: self.name.clone(),
            pid,
            capabilities: count,
        });

        Ok(Live {
            process,
            channel,
            generation,
        })
    }

    // ── Running ─────────────────────────────────────────────────────────────

    async fn supervise(&mut self, mut live: Live) -> Phase {
        loop {
            let command = tokio::select! {
                status = live.process.wait() => {
                    let err = Error::WorkerExited {
                        plugin: self.name.clone(),
                        reason: describe_exit(&status),
                    };
                    return self.leave_running(live, err).await;
                },
                command = self.commands.recv() => command,
            };

            match command {
                Some(Command::ProbeFailed { generation, reason }) => {
                    if generation != live.generation {
                        debug!(plugin = %self.name, generation, "ignoring stale probe failure");
                        continue;
                    }
                    let err = Error::CapabilityQuery {
                        plugin: self.name.clone(),
                        reason: format!("health probe failed: {reason}"),
                    };
                    return self.leave_running(live, err).await;
                },
                Some(Command::Refreshed {
                    generation,
                    capabilities,
                }) => {
                    if generation != live.generation {
                        continue;
                    }
                    if let Err(err) = self.refresh(&live.channel, capabilities).await {
                        return self.leave_running(live, err).await;
                    }
                },
                Some(Command::Stop { done }) => {
                    self.stop_running(live).await;
                    let _ = done.send(());
                    return Phase::Idle;
                },
                Some(Command::Restart { done }) => {
                    info!(plugin = %self.name, "manual restart");
                    self.stop_running(live).await;
                    self.reset_restart_budget().await;
                    self.start_waiters.push(done);
                    return Phase::Start;
                },
                Some(Command::Exit) | None => {
                    self.stop_running(live).await;
                    return Phase::Exit;
                },
            }
        }
    }

    /// Apply a newer capability list from a health probe.
    async fn refresh(
        &self,
        channel: &Arc<WorkerChannel>,
        capabilities: CapabilityList,
    ) -> Result<(), Error> {
        let unchanged = self
            .record
            .read()
            .await
            .snapshot
            .as_ref()
            .is_some_and(|s| s.capabilities == capabilities);

        let snapshot = CapabilitySnapshot::new(capabilities);
        if !unchanged {
            let entries = snapshot.entries(&self.name);
            self.registry
                .ingest(
                    &self.name,
                    entries,
                    Arc::clone(channel),
                    self.descriptor.call_timeout,
                )
                .await?;
            info!(plugin = %self.name, "capabilities changed");
        }
        self.record.write().await.snapshot = Some(snapshot);
        Ok(())
    }

    /// Unpublish a running session and tear it down after a failure.
    async fn leave_running(&mut self, mut live: Live, err: Error) -> Phase {
        self.registry.retract(&self.name).await;
        *self.session.write().await = None;
        teardown(live.process.as_mut(), &live.channel).await;
        Phase::Failed(err)
    }

    /// Graceful stop: `Stopping`, shutdown request, wait up to `call_timeout`,
    /// kill if still alive, `Stopped`.
    async fn stop_running(&mut self, mut live: Live) {
        self.transition(WorkerState::Stopping, |_| {}).await;
        self.registry.retract(&self.name).await;
        *self.session.write().await = None;

        let timeout = self.descriptor.call_timeout;
        let graceful = tokio::time::timeout(timeout, async {
            if let Err(e) = live.channel.request_shutdown(timeout).await {
                debug!(plugin = %self.name, error = %e, "shutdown request not acknowledged");
            }
            live.process.wait().await
        })
        .await;

        match graceful {
            Ok(status) => debug!(plugin = %self.name, exit = %describe_exit(&status), "worker exited"),
            Err(_) => {
                warn!(plugin = %self.name, ?timeout, "worker did not exit in time, killing");
                if let Err(e) = live.process.kill().await {
                    warn!(plugin = %self.name, error = %e, "failed to kill worker");
                }
            },
        }
        live.channel.close().await;

        self.transition(WorkerState::Stopped, |r| r.pid = None).await;
        info!(plugin = %self.name, "plugin worker stopped");
        self.events.emit(LifecycleEvent::Stopped {
            plugin: self.name.clone(),
        });
    }

    // ── Failed ──────────────────────────────────────────────────────────────

    /// Record the failure, then either schedule a restart or settle in
    /// `Failed` for good.
    async fn handle_failure(&mut self, err: Error) -> Phase {
        let code = err.code().unwrap_or(FailureCode::WorkerError);
        let reason = err.to_string();
        let restart_count = self.record.read().await.restart_count;
        let restart = self.descriptor.permits_restart(restart_count);

        #[cfg(feature = "metrics")]
        counter!(
            supervisor_metrics::WORKER_FAILURES_TOTAL,
            labels::PLUGIN => self.name.clone(),
            labels::CODE => code.as_str()
        )
        .increment(1);

        // The registry may still hold entries if ingest was the last step to
        // succeed before the failure.
        self.registry.retract(&self.name).await;

        if !restart {
            let exhausted = Error::RestartBudgetExhausted {
                plugin: self.name.clone(),
                reason: match self.descriptor.restart_policy {
                    RestartPolicy::Never => format!("restart policy is never ({reason})"),
                    _ => format!(
                        "{} restarts used ({reason})",
                        self.descriptor.max_restarts
                    ),
                },
            };
            let last_error = LastError::from_error(&exhausted);
            self.transition(WorkerState::Failed, |r| {
                r.pid = None;
                r.last_error = Some(last_error);
            })
            .await;

            self.notify_start_waiters();
            warn!(plugin = %self.name, %code, %reason, restart_count, "plugin failed permanently");
            self.events.emit(LifecycleEvent::Failed {
                plugin: self.name.clone(),
                code,
                reason,
                terminal: true,
            });
            return Phase::Idle;
        }

        let last_error = LastError::new(code, reason.clone());
        self.transition(WorkerState::Failed, |r| {
            r.pid = None;
            r.last_error = Some(last_error);
            r.restart_count += 1;
        })
        .await;

        self.notify_start_waiters();

        let delay = self.descriptor.restart_delay;
        warn!(
            plugin = %self.name,
            %code,
            %reason,
            attempt = restart_count + 1,
            ?delay,
            "plugin failed, restarting"
        );
        self.events.emit(LifecycleEvent::Failed {
            plugin: self.name.clone(),
            code,
            reason,
            terminal: false,
        });

        #[cfg(feature = "metrics")]
        counter!(supervisor_metrics::WORKER_RESTARTS_TOTAL, labels::PLUGIN => self.name.clone())
            .increment(1);

        self.wait_restart_delay(delay).await
    }

    /// Sleep out the restart delay while still answering commands.
    async fn wait_restart_delay(&mut self, delay: Duration) -> Phase {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return Phase::Start,
                command = self.commands.recv() => {
                    if let Some(phase) = self.on_command_while_down(command).await {
                        return phase;
                    }
                },
            }
        }
    }

    // ── Failed (terminal) / Stopped ─────────────────────────────────────────

    async fn idle(&mut self) -> Phase {
        loop {
            let command = self.commands.recv().await;
            if let Some(phase) = self.on_command_while_down(command).await {
                return phase;
            }
        }
    }

    /// Handle a command while no process is attached. `None` keeps waiting.
    async fn on_command_while_down(&mut self, command: Option<Command>) -> Option<Phase> {
        match command {
            Some(Command::Stop { done }) => {
                if self.state().await == WorkerState::Failed {
                    self.transition(WorkerState::Stopped, |_| {}).await;
                    self.events.emit(LifecycleEvent::Stopped {
                        plugin: self.name.clone(),
                    });
                }
                let _ = done.send(());
                Some(Phase::Idle)
            },
            Some(Command::Restart { done }) => {
                info!(plugin = %self.name, "manual restart");
                self.reset_restart_budget().await;
                self.start_waiters.push(done);
                Some(Phase::Start)
            },
            Some(Command::ProbeFailed { .. } | Command::Refreshed { .. }) => None,
            Some(Command::Exit) | None => {
                if self.state().await != WorkerState::Stopped {
                    self.transition(WorkerState::Stopped, |_| {}).await;
                    self.events.emit(LifecycleEvent::Stopped {
                        plugin: self.name.clone(),
                    });
                }
                Some(Phase::Exit)
            },
        }
    }
}

/// Kill a process that failed to come up (or went bad) and close its channel.
async fn teardown(process: &mut dyn WorkerProcess, channel: &WorkerChannel) {
    channel.close().await;
    if let Err(e) = process.kill().await {
        debug!(plugin = %channel.plugin(), error = %e, "kill after failure");
    }
}
