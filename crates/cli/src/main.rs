mod config_commands;
mod plugin_commands;
mod run_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    plughub_config::PlughubConfig,
    tracing::{debug, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "plughub", version, about = "plughub: process-based plugin supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (skips discovery of `./plughub.toml` and the user config dir).
    #[arg(long, short, global = true, env = "PLUGHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Extra plugin directory, scanned before the configured ones. Repeatable.
    #[arg(long = "plugin-dir", global = true)]
    plugin_dirs: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every enabled plugin and supervise until Ctrl-C (default).
    Run,
    /// Plugin discovery.
    Plugins {
        #[command(subcommand)]
        action: plugin_commands::PluginAction,
    },
    /// Start the plugin owning a capability, invoke it once and print the result.
    Invoke {
        /// Qualified capability name, `<plugin>.<capability>`.
        qualified_name: String,
        /// JSON arguments. Defaults to `{}`.
        arguments: Option<String>,
        /// Call timeout (e.g. "5s"), overriding the plugin's own.
        #[arg(long)]
        timeout: Option<String>,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so `invoke` and `plugins list --json` keep stdout clean.
    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Load the config and apply command-line overrides.
fn load_config(cli: &Cli) -> anyhow::Result<PlughubConfig> {
    let mut config = plughub_config::load_or_default(cli.config.as_deref())?;
    if !cli.plugin_dirs.is_empty() {
        let mut dirs = cli.plugin_dirs.clone();
        dirs.extend(config.plugin_dirs());
        config.plugins.dirs = dirs;
    }
    debug!(dirs = ?config.plugin_dirs(), "plugin search paths");
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "plughub starting");

    match &cli.command {
        None | Some(Commands::Run) => {
            let config = load_config(&cli)?;
            run_commands::run(config).await
        },
        Some(Commands::Plugins { action }) => {
            let config = load_config(&cli)?;
            plugin_commands::handle_plugins(action, &config).await
        },
        Some(Commands::Invoke {
            qualified_name,
            arguments,
            timeout,
        }) => {
            let config = load_config(&cli)?;
            run_commands::invoke(
                config,
                qualified_name,
                arguments.as_deref(),
                timeout.as_deref(),
            )
            .await
        },
        Some(Commands::Config { action }) => {
            config_commands::handle_config(action, cli.config.as_deref())
        },
    }
}
