//! In-memory workers for supervisor tests.
//!
//! `FakeLauncher` hands the supervisor a pair of `duplex` pipes per launch and
//! runs a scripted worker on the other end. Tests can crash the current
//! session, count invocations and shape the worker's behaviour per plugin.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    plughub_plugins::{PluginDescriptor, RestartPolicy},
    plughub_protocol::{
        CapabilityDef, CapabilityList, Frame, PROTOCOL_VERSION, decode, encode, error_codes,
    },
    plughub_supervisor::{
        LaunchedWorker, LifecycleEvent, Supervisor, WorkerLauncher, WorkerProcess, WorkerState,
    },
    serde_json::json,
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex},
        sync::{Mutex as AsyncMutex, Notify, broadcast, watch},
        task::JoinSet,
    },
    tokio_util::sync::CancellationToken,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handshake {
    #[default]
    Normal,
    /// Never answer.
    Silent,
    /// Answer with something that is not a handshake result.
    Malformed,
    WrongVersion,
}

/// Behaviour of one plugin's fake worker.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub tools: Vec<String>,
    pub resources: Vec<String>,
    pub prompts: Vec<String>,
    pub handshake: Handshake,
    /// Per-tool response delay.
    pub delays: HashMap<String, Duration>,
    /// Answer only the first capability query; later ones hang.
    pub hang_probes: bool,
    /// Answer only the first capability query; later ones get an error frame.
    pub fail_probes: bool,
    /// Ignore shutdown requests.
    pub ignore_shutdown: bool,
}

impl Behavior {
    pub fn tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn delay(mut self, tool: &str, delay: Duration) -> Self {
        self.delays.insert(tool.to_string(), delay);
        self
    }

    fn capabilities(&self) -> CapabilityList {
        let defs = |names: &[String]| -> Vec<CapabilityDef> {
            names.iter().map(CapabilityDef::new).collect()
        };
        CapabilityList {
            tools: defs(&self.tools),
            resources: defs(&self.resources),
            prompts: defs(&self.prompts),
        }
    }
}

/// Per-plugin counters shared across sessions.
#[derive(Default)]
struct PluginStats {
    launches: AtomicU32,
    invocations: AtomicUsize,
    /// Crash trigger of the most recent session.
    crash: Mutex<Option<Arc<Notify>>>,
}

#[derive(Default)]
pub struct FakeLauncher {
    behaviors: Mutex<HashMap<String, Behavior>>,
    stats: Mutex<HashMap<String, Arc<PluginStats>>>,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        })
    }

    pub fn register(&self, plugin: &str, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(plugin.to_string(), behavior);
    }

    fn stats(&self, plugin: &str) -> Arc<PluginStats> {
        Arc::clone(
            self.stats
                .lock()
                .unwrap()
                .entry(plugin.to_string())
                .or_default(),
        )
    }

    pub fn launches(&self, plugin: &str) -> u32 {
        self.stats(plugin).launches.load(Ordering::SeqCst)
    }

    pub fn invocations(&self, plugin: &str) -> usize {
        self.stats(plugin).invocations.load(Ordering::SeqCst)
    }

    /// Make the current session of `plugin` exit with code 1.
    pub fn crash(&self, plugin: &str) {
        let stats = self.stats(plugin);
        let crash = stats.crash.lock().unwrap().clone();
        crash.expect("plugin was never launched").notify_one();
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, descriptor: &PluginDescriptor) -> io::Result<LaunchedWorker> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such worker"))?;

        let stats = self.stats(&descriptor.name);
        stats.launches.fetch_add(1, Ordering::SeqCst);
        let crash = Arc::new(Notify::new());
        *stats.crash.lock().unwrap() = Some(Arc::clone(&crash));

        let (host_out, worker_in) = duplex(64 * 1024);
        let (worker_out, host_in) = duplex(64 * 1024);
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();

        tokio::spawn(run_worker(
            behavior,
            worker_in,
            worker_out,
            stats,
            crash,
            kill.clone(),
            exit_tx,
        ));

        Ok(LaunchedWorker {
            reader: Box::new(host_in),
            writer: Box::new(host_out),
            process: Box::new(FakeProcess {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                exit: exit_rx,
                kill,
            }),
        })
    }
}

struct FakeProcess {
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
    kill: CancellationToken,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        loop {
            if let Some(code) = *self.exit.borrow_and_update() {
                return Ok(Some(code));
            }
            if self.exit.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.kill.cancel();
        let _ = self.wait().await;
        Ok(())
    }
}

async fn run_worker(
    behavior: Behavior,
    input: DuplexStream,
    output: DuplexStream,
    stats: Arc<PluginStats>,
    crash: Arc<Notify>,
    kill: CancellationToken,
    exit: watch::Sender<Option<i32>>,
) {
    let output = Arc::new(AsyncMutex::new(output));
    let mut lines = BufReader::new(input).lines();
    let mut invokes = JoinSet::new();
    let mut queries = 0usize;

    let code = loop {
        let line = tokio::select! {
            () = kill.cancelled() => break 137,
            () = crash.notified() => break 1,
            line = lines.next_line() => line,
        };
        let Ok(Some(line)) = line else { break 0 };
        let Ok(frame) = decode(&line) else { continue };

        let reply = match frame {
            Frame::Handshake { id, .. } => match behavior.handshake {
                Handshake::Normal => Some(Frame::reply(
                    id,
                    json!({"name": "fake", "protocolVersion": PROTOCOL_VERSION}),
                )),
                Handshake::Silent => None,
                Handshake::Malformed => Some(Frame::reply(id, json!("hello"))),
                Handshake::WrongVersion => Some(Frame::reply(
                    id,
                    json!({"name": "fake", "protocolVersion": PROTOCOL_VERSION + 1}),
                )),
            },
            Frame::ListCapabilities { id } => {
                queries += 1;
                if behavior.hang_probes && queries > 1 {
                    None
                } else if behavior.fail_probes && queries > 1 {
                    Some(Frame::error(id, error_codes::INTERNAL_ERROR, "probe refused"))
                } else {
                    Some(Frame::reply(
                        id,
                        serde_json::to_value(behavior.capabilities()).unwrap(),
                    ))
                }
            },
            Frame::Invoke {
                id,
                name,
                arguments,
                ..
            } => {
                stats.invocations.fetch_add(1, Ordering::SeqCst);
                let known = behavior.tools.contains(&name)
                    || behavior.resources.contains(&name)
                    || behavior.prompts.contains(&name);
                let delay = behavior.delays.get(&name).copied();
                let output = Arc::clone(&output);
                invokes.spawn(async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    let frame = if known {
                        Frame::reply(id, json!({"tool": name, "arguments": arguments}))
                    } else {
                        Frame::error(id, error_codes::UNKNOWN_CAPABILITY, "unknown capability")
                    };
                    write_frame(&output, &frame).await;
                });
                None
            },
            Frame::Shutdown { id } => {
                if behavior.ignore_shutdown {
                    None
                } else {
                    write_frame(&output, &Frame::reply(id, json!(null))).await;
                    break 0;
                }
            },
            _ => None,
        };

        if let Some(reply) = reply {
            write_frame(&output, &reply).await;
        }
    };

    invokes.abort_all();
    while invokes.join_next().await.is_some() {}
    drop(output);
    drop(lines);
    let _ = exit.send(Some(code));
}

async fn write_frame(output: &AsyncMutex<DuplexStream>, frame: &Frame) {
    let line = encode(frame).unwrap();
    let mut out = output.lock().await;
    let _ = out.write_all(line.as_bytes()).await;
}

// ── Descriptors and waiting helpers ─────────────────────────────────────────

pub const FAST: Duration = Duration::from_millis(10);

pub fn descriptor(name: &str, policy: RestartPolicy, max_restarts: u32) -> PluginDescriptor {
    PluginDescriptor::new(name, format!("/fake/{name}"))
        .restart_policy(policy, max_restarts)
        .restart_delay(FAST)
        .call_timeout(Duration::from_millis(500))
}

/// Next state `plugin` transitions to, skipping other events.
pub async fn next_state(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    plugin: &str,
) -> WorkerState {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.unwrap() {
                LifecycleEvent::StateChanged { plugin: p, to, .. } if p == plugin => return to,
                _ => {},
            }
        }
    })
    .await
    .expect("timed out waiting for a state change")
}

/// Next `failed` event of `plugin`: (code, terminal).
pub async fn next_failure(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    plugin: &str,
) -> (plughub_supervisor::FailureCode, bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.unwrap() {
                LifecycleEvent::Failed {
                    plugin: p,
                    code,
                    terminal,
                    ..
                } if p == plugin => return (code, terminal),
                _ => {},
            }
        }
    })
    .await
    .expect("timed out waiting for a failure")
}

pub async fn wait_for_state(supervisor: &Supervisor, plugin: &str, state: WorkerState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if supervisor
                .status()
                .await
                .get(plugin)
                .is_some_and(|s| s.state == state)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{plugin} never reached {state}"));
}

pub fn qualified_names(catalog: &[plughub_supervisor::CapabilityEntry]) -> Vec<String> {
    catalog.iter().map(|e| e.qualified_name.clone()).collect()
}
