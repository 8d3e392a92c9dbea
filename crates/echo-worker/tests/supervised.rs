//! The echo worker as a real child process under the supervisor.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use {
    plughub_plugins::{PluginDescriptor, RestartPolicy},
    plughub_protocol::error_codes,
    plughub_supervisor::{
        FailureCode, LifecycleEvent, ProcessLauncher, Supervisor, WorkerState,
    },
    serde_json::json,
    tokio::sync::broadcast,
};

const WORKER: &str = env!("CARGO_BIN_EXE_plughub-echo-worker");

fn descriptor(name: &str, policy: RestartPolicy, max_restarts: u32) -> PluginDescriptor {
    PluginDescriptor::new(name, WORKER)
        .env("PLUGHUB_ECHO_NAME", name)
        .restart_policy(policy, max_restarts)
        .restart_delay(Duration::from_millis(50))
        .call_timeout(Duration::from_secs(5))
}

fn supervisor() -> Supervisor {
    Supervisor::new(Arc::new(ProcessLauncher))
}

async fn wait_for(supervisor: &Supervisor, plugin: &str, state: WorkerState) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while supervisor
            .status()
            .await
            .get(plugin)
            .is_none_or(|s| s.state != state)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{plugin} never reached {state}"));
}

async fn next_failure(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    plugin: &str,
) -> (FailureCode, bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let LifecycleEvent::Failed {
                plugin: p,
                code,
                terminal,
                ..
            } = events.recv().await.unwrap()
                && p == plugin
            {
                return (code, terminal);
            }
        }
    })
    .await
    .expect("timed out waiting for a failure")
}

async fn next_state(events: &mut broadcast::Receiver<LifecycleEvent>, plugin: &str) -> WorkerState {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let LifecycleEvent::StateChanged { plugin: p, to, .. } = events.recv().await.unwrap()
                && p == plugin
            {
                return to;
            }
        }
    })
    .await
    .expect("timed out waiting for a state change")
}

#[tokio::test]
async fn serves_tools_resources_and_prompts() {
    let supervisor = supervisor();
    supervisor
        .start(descriptor("echo", RestartPolicy::Never, 0))
        .await
        .unwrap();

    let status = supervisor.status().await["echo"].clone();
    assert_eq!(status.state, WorkerState::Running);
    assert!(status.pid.is_some());
    assert_eq!(
        (status.tool_count, status.resource_count, status.prompt_count),
        (3, 1, 1)
    );

    let names: Vec<String> = supervisor
        .catalog()
        .await
        .into_iter()
        .map(|e| e.qualified_name)
        .collect();
    for expected in ["echo.echo", "echo.sleep", "echo.fail", "echo.motd", "echo.greet"] {
        assert!(names.iter().any(|n| n == expected), "missing {expected}");
    }

    let payload = json!({"nested": {"list": [1, "two", null]}});
    let echoed = supervisor
        .invoke("echo.echo", payload.clone(), None)
        .await
        .unwrap();
    assert_eq!(echoed, payload);

    let motd = supervisor.invoke("echo.motd", json!({}), None).await.unwrap();
    assert!(motd["text"].is_string());

    let err = supervisor
        .invoke("echo.fail", json!({"message": "nope"}), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, FailureCode::WorkerError);
    assert_eq!(err.worker_code, Some(error_codes::INTERNAL_ERROR));
    assert_eq!(err.message, "nope");

    supervisor.stop("echo").await.unwrap();
    let status = supervisor.status().await["echo"].clone();
    assert_eq!(status.state, WorkerState::Stopped);
    assert!(status.pid.is_none());
}

#[tokio::test]
async fn concurrent_calls_complete_independently() {
    let supervisor = Arc::new(supervisor());
    supervisor
        .start(descriptor("echo", RestartPolicy::Never, 0))
        .await
        .unwrap();

    let slow = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            supervisor
                .invoke("echo.sleep", json!({"ms": 1000}), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    supervisor
        .invoke("echo.echo", json!("fast"), None)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(800));
    assert!(!slow.is_finished());

    assert_eq!(slow.await.unwrap().unwrap(), json!({"sleptMs": 1000}));
    supervisor.shutdown().await;
}

#[tokio::test]
async fn crash_mid_call_restarts_the_worker() {
    let supervisor = supervisor();
    let mut events = supervisor.subscribe();
    supervisor
        .start(
            descriptor("crashy", RestartPolicy::OnFailure, 2).env("PLUGHUB_ECHO_CRASH_AFTER", "1"),
        )
        .await
        .unwrap();
    let first_pid = supervisor.status().await["crashy"].pid;

    supervisor
        .invoke("crashy.echo", json!(1), None)
        .await
        .unwrap();
    let err = supervisor
        .invoke("crashy.echo", json!(2), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, FailureCode::ChannelClosed);

    let (code, terminal) = next_failure(&mut events, "crashy").await;
    assert_eq!(code, FailureCode::WorkerExited);
    assert!(!terminal);

    wait_for(&supervisor, "crashy", WorkerState::Running).await;
    let status = supervisor.status().await["crashy"].clone();
    assert_eq!(status.restart_count, 1);
    assert_ne!(status.pid, first_pid);

    // Fresh process, fresh invocation budget.
    supervisor
        .invoke("crashy.echo", json!(3), None)
        .await
        .unwrap();
    supervisor.shutdown().await;
}

#[tokio::test]
async fn restart_budget_runs_out_after_three_crashes() {
    use WorkerState::{Failed, Running, Starting};

    let supervisor = supervisor();
    let mut events = supervisor.subscribe();
    supervisor
        .start(
            descriptor("echo", RestartPolicy::OnFailure, 2).env("PLUGHUB_ECHO_CRASH_AFTER", "0"),
        )
        .await
        .unwrap();

    let mut seen = vec![
        next_state(&mut events, "echo").await,
        next_state(&mut events, "echo").await,
    ];
    for round in 0..3 {
        let err = supervisor
            .invoke("echo.echo", json!(round), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, FailureCode::ChannelClosed);
        seen.push(next_state(&mut events, "echo").await);
        if round < 2 {
            seen.push(next_state(&mut events, "echo").await);
            seen.push(next_state(&mut events, "echo").await);
        }
    }

    assert_eq!(seen, [
        Starting, Running, Failed, Starting, Running, Failed, Starting, Running, Failed
    ]);
    let status = supervisor.status().await["echo"].clone();
    assert_eq!(status.state, Failed);
    assert_eq!(status.restart_count, 2);
    assert_eq!(
        status.last_error.map(|e| e.code),
        Some(FailureCode::RestartBudgetExhausted)
    );
    assert!(supervisor.catalog().await.is_empty());
}

#[tokio::test]
async fn silent_handshake_times_out() {
    let supervisor = supervisor();
    let mut events = supervisor.subscribe();
    supervisor
        .start(
            descriptor("mute", RestartPolicy::Never, 0)
                .env("PLUGHUB_ECHO_SILENT", "1")
                .call_timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap();

    assert_eq!(
        next_failure(&mut events, "mute").await,
        (FailureCode::HandshakeTimeout, true)
    );
    let status = supervisor.status().await["mute"].clone();
    assert_eq!(status.state, WorkerState::Failed);
    assert!(status.pid.is_none());
    assert!(supervisor.catalog().await.is_empty());
}

#[tokio::test]
async fn wrong_protocol_version_fails_handshake() {
    let supervisor = supervisor();
    let mut events = supervisor.subscribe();
    supervisor
        .start(
            descriptor("future", RestartPolicy::Never, 0)
                .env("PLUGHUB_ECHO_PROTOCOL_VERSION", "99"),
        )
        .await
        .unwrap();

    let (code, _) = next_failure(&mut events, "future").await;
    assert_eq!(code, FailureCode::HandshakeTimeout);
    wait_for(&supervisor, "future", WorkerState::Failed).await;
}

#[tokio::test]
async fn duplicate_advertisement_fails_the_worker() {
    let supervisor = supervisor();
    let mut events = supervisor.subscribe();
    supervisor
        .start(descriptor("dup", RestartPolicy::Never, 0).env("PLUGHUB_ECHO_DUPLICATE", "true"))
        .await
        .unwrap();

    let (code, _) = next_failure(&mut events, "dup").await;
    assert_eq!(code, FailureCode::DuplicateCapabilityName);
    wait_for(&supervisor, "dup", WorkerState::Failed).await;
    assert!(supervisor.catalog().await.is_empty());
}

#[tokio::test]
async fn shutdown_stops_every_worker() {
    let supervisor = supervisor();
    for name in ["one", "two"] {
        supervisor
            .start(descriptor(name, RestartPolicy::Always, 0))
            .await
            .unwrap();
    }

    supervisor.shutdown().await;
    for (name, status) in supervisor.status().await {
        assert_eq!(status.state, WorkerState::Stopped, "{name}");
        assert!(status.pid.is_none(), "{name}");
    }
}
