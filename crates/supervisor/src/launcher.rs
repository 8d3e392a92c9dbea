//! Spawning workers.
//!
//! [`WorkerLauncher`] is the seam between the supervisor and the operating
//! system: the supervisor only sees a byte stream pair and a handle it can
//! wait on or kill. [`ProcessLauncher`] is the real implementation.

use std::{io, process::Stdio};

use {
    async_trait::async_trait,
    plughub_plugins::PluginDescriptor,
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
        process::{Child, Command},
    },
    tracing::{debug, info, warn},
};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle to a running worker process.
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit. Returns the exit code, `None` when the
    /// process was terminated by a signal. Cancel-safe.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Force-terminate the process and reap it.
    async fn kill(&mut self) -> io::Result<()>;
}

/// A freshly spawned worker: its stdout, its stdin and the process handle.
pub struct LaunchedWorker {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub process: Box<dyn WorkerProcess>,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, descriptor: &PluginDescriptor) -> io::Result<LaunchedWorker>;
}

/// Launches each plugin's `entry` as a child process speaking the protocol
/// over stdin/stdout. Stderr lines are forwarded to the log.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, descriptor: &PluginDescriptor) -> io::Result<LaunchedWorker> {
        info!(
            plugin = %descriptor.name,
            entry = %descriptor.entry.display(),
            args = ?descriptor.args,
            "spawning plugin worker"
        );

        let mut cmd = Command::new(&descriptor.entry);
        cmd.args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &descriptor.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("failed to capture worker stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("failed to capture worker stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let plugin = descriptor.name.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let trimmed = line.trim();
                            if !trimmed.is_empty() {
                                warn!(plugin = %plugin, stderr = %trimmed, "plugin worker stderr");
                            }
                        },
                    }
                }
                debug!(plugin = %plugin, "plugin worker stderr closed");
            });
        }

        Ok(LaunchedWorker {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Box::new(ChildProcess { child }),
        })
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// Human-readable description of a `WorkerProcess::wait` outcome.
pub(crate) fn describe_exit(status: &io::Result<Option<i32>>) -> String {
    match status {
        Ok(Some(code)) => format!("worker exited with code {code}"),
        Ok(None) => "worker terminated by signal".to_string(),
        Err(e) => format!("failed to wait for worker: {e}"),
    }
}
