//! `plughub-echo-worker`: a small plugin worker speaking the plughub line
//! protocol on stdin/stdout. Logs go to stderr, which the supervisor forwards.
//!
//! Every knob can also be set through the environment so a plugin manifest
//! can shape the worker without extra arguments.

mod worker;

use {
    clap::Parser,
    tracing_subscriber::{EnvFilter, fmt},
};

use crate::worker::{Exit, Options};

/// Status used when the worker crashes on purpose.
const CRASH_STATUS: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "plughub-echo-worker", about = "Reference plughub plugin worker")]
struct Cli {
    /// Name reported in the handshake.
    #[arg(long, env = "PLUGHUB_ECHO_NAME", default_value = "echo")]
    name: String,

    /// Delay applied to every invocation, in milliseconds.
    #[arg(long, env = "PLUGHUB_ECHO_DELAY_MS", default_value_t = 0)]
    delay_ms: u64,

    /// Answer this many invocations, then exit abruptly on the next one.
    #[arg(long, env = "PLUGHUB_ECHO_CRASH_AFTER")]
    crash_after: Option<u64>,

    /// Advertise the `echo` tool twice.
    #[arg(long, env = "PLUGHUB_ECHO_DUPLICATE")]
    duplicate: bool,

    /// Never answer the handshake.
    #[arg(long, env = "PLUGHUB_ECHO_SILENT")]
    silent: bool,

    /// Protocol version reported in the handshake.
    #[arg(long, env = "PLUGHUB_ECHO_PROTOCOL_VERSION", default_value_t = plughub_protocol::PROTOCOL_VERSION)]
    protocol_version: u32,

    /// Log filter, used when `RUST_LOG` is unset.
    #[arg(long, env = "PLUGHUB_ECHO_LOG", default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    let options = Options {
        name: cli.name,
        delay: std::time::Duration::from_millis(cli.delay_ms),
        crash_after: cli.crash_after,
        duplicate: cli.duplicate,
        silent: cli.silent,
        protocol_version: cli.protocol_version,
    };

    match worker::serve(tokio::io::stdin(), tokio::io::stdout(), options).await? {
        Exit::Shutdown | Exit::Eof => Ok(()),
        Exit::Crash => {
            tracing::error!("crash requested, exiting");
            std::process::exit(CRASH_STATUS);
        },
    }
}
