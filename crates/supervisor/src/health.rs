//! Periodic health probes.
//!
//! On every tick each running worker gets a capability query with a bounded
//! timeout. Probes run as independent tasks, at most one per worker at a
//! time, so a hung worker never delays probes of the others. A failed probe
//! is reported to the worker's task, which treats it like a crash. Reports
//! carry the session generation so a probe that outlives its session cannot
//! fail the next one.

use std::{collections::HashSet, sync::Arc, time::Duration};

use {
    plughub_config::HealthConfig,
    tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use plughub_metrics::{counter, health as health_metrics, labels};

use crate::{
    supervisor::{ProbeTarget, Supervisor},
    worker::Command,
};

pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(supervisor: Arc<Supervisor>, interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            supervisor,
            interval,
            probe_timeout,
        }
    }

    pub fn from_config(supervisor: Arc<Supervisor>, config: &HealthConfig) -> Self {
        Self::new(supervisor, config.interval, config.probe_timeout)
    }

    /// Run until the supervisor shuts down or `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let shutdown = self.supervisor.shutdown_token();
        let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; workers were just started.
        ticker.tick().await;

        info!(
            interval = ?self.interval,
            probe_timeout = ?self.probe_timeout,
            "health monitor started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {},
            }

            for target in self.supervisor.probe_targets().await {
                if !in_flight.lock().await.insert(target.plugin.clone()) {
                    debug!(plugin = %target.plugin, "previous probe still running");
                    continue;
                }
                tokio::spawn(probe(target, self.probe_timeout, Arc::clone(&in_flight)));
            }
        }

        debug!("health monitor stopped");
    }
}

async fn probe(target: ProbeTarget, timeout: Duration, in_flight: Arc<Mutex<HashSet<String>>>) {
    let ProbeTarget {
        plugin,
        session,
        commands,
    } = target;

    #[cfg(feature = "metrics")]
    counter!(health_metrics::PROBES_TOTAL, labels::PLUGIN => plugin.clone()).increment(1);

    let command = match session.channel.query_capabilities(timeout).await {
        Ok(capabilities) => Command::Refreshed {
            generation: session.generation,
            capabilities,
        },
        Err(e) => {
            warn!(plugin = %plugin, generation = session.generation, error = %e, "health probe failed");

            #[cfg(feature = "metrics")]
            counter!(health_metrics::PROBE_FAILURES_TOTAL, labels::PLUGIN => plugin.clone())
                .increment(1);

            Command::ProbeFailed {
                generation: session.generation,
                reason: e.to_string(),
            }
        },
    };

    // The worker may have been unloaded meanwhile.
    let _ = commands.send(command);
    in_flight.lock().await.remove(&plugin);
}
