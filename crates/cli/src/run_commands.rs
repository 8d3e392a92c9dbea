//! `run` and `invoke`: the commands that launch worker processes.

use std::sync::Arc;

use {
    anyhow::{Context, anyhow, bail},
    plughub_config::{PlughubConfig, parse_duration},
    plughub_metrics::{MetricsRecorderConfig, init_metrics},
    plughub_plugins::{DescriptorSource, FsPluginSource},
    plughub_supervisor::{HealthMonitor, LifecycleEvent, ProcessLauncher, Supervisor},
    serde_json::{Value, json},
    tokio::sync::broadcast::{self, error::RecvError},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

/// Start every enabled plugin, probe them while running and stop them all on Ctrl-C.
pub async fn run(config: PlughubConfig) -> anyhow::Result<()> {
    let metrics = init_metrics(MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        global_labels: config.metrics.labels.clone().into_iter().collect(),
    })?;

    let supervisor = Arc::new(Supervisor::from_config(
        Arc::new(ProcessLauncher),
        &config.supervisor,
    ));
    let event_log = tokio::spawn(log_events(supervisor.subscribe()));

    let source = FsPluginSource::from_config(&config);
    let started = supervisor.start_all(&source).await?;
    info!(count = started.len(), plugins = ?started, "plugins scheduled");

    let probes = CancellationToken::new();
    let monitor = if config.health.enabled {
        let monitor = HealthMonitor::from_config(Arc::clone(&supervisor), &config.health);
        Some(monitor.spawn(probes.clone()))
    } else {
        info!("health monitor disabled");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    probes.cancel();
    if let Some(monitor) = monitor
        && let Err(e) = monitor.await
    {
        warn!(error = %e, "health monitor task failed");
    }
    supervisor.shutdown().await;
    event_log.abort();

    for (name, status) in supervisor.status().await {
        debug!(plugin = %name, state = %status.state, restarts = status.restart_count, "final status");
    }

    let rendered = metrics.render();
    if !rendered.is_empty() {
        print!("{rendered}");
    }
    Ok(())
}

/// Start only the plugin owning `qualified_name`, call it once, print the
/// result and stop the plugin again.
pub async fn invoke(
    config: PlughubConfig,
    qualified_name: &str,
    arguments: Option<&str>,
    timeout: Option<&str>,
) -> anyhow::Result<()> {
    let arguments: Value = match arguments {
        Some(raw) => serde_json::from_str(raw).context("arguments must be valid JSON")?,
        None => json!({}),
    };
    let timeout = timeout.map(parse_duration).transpose()?;

    let Some((plugin, _)) = qualified_name.split_once('.') else {
        bail!("expected <plugin>.<capability>, got '{qualified_name}'");
    };

    let source = FsPluginSource::from_config(&config);
    let descriptor = source
        .list()
        .await?
        .into_iter()
        .find(|d| d.name == plugin)
        .ok_or_else(|| anyhow!("plugin '{plugin}' not found"))?;
    if !descriptor.enabled {
        bail!("plugin '{plugin}' is disabled");
    }

    let supervisor = Supervisor::from_config(Arc::new(ProcessLauncher), &config.supervisor);
    supervisor.start(descriptor).await?;

    let outcome = supervisor.invoke(qualified_name, arguments, timeout).await;
    let last_error = supervisor
        .status()
        .await
        .remove(plugin)
        .and_then(|s| s.last_error);
    supervisor.shutdown().await;

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        },
        Err(failure) => {
            eprintln!("{}", serde_json::to_string_pretty(&failure)?);
            if let Some(last_error) = last_error {
                eprintln!(
                    "plugin '{plugin}' last error: {} ({})",
                    last_error.message, last_error.code
                );
            }
            std::process::exit(1);
        },
    }
}

async fn log_events(mut events: broadcast::Receiver<LifecycleEvent>) {
    loop {
        match events.recv().await {
            Ok(LifecycleEvent::StateChanged { plugin, from, to, .. }) => match from {
                Some(from) => debug!(plugin = %plugin, %from, %to, "state changed"),
                None => debug!(plugin = %plugin, %to, "state changed"),
            },
            Ok(LifecycleEvent::Started {
                plugin,
                pid,
                capabilities,
            }) => info!(plugin = %plugin, ?pid, capabilities, "plugin started"),
            Ok(LifecycleEvent::Stopped { plugin }) => info!(plugin = %plugin, "plugin stopped"),
            Ok(LifecycleEvent::Failed {
                plugin,
                code,
                reason,
                terminal,
            }) => {
                if terminal {
                    error!(plugin = %plugin, %code, reason = %reason, "plugin failed, giving up");
                } else {
                    warn!(plugin = %plugin, %code, reason = %reason, "plugin failed, restarting");
                }
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "lifecycle event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
