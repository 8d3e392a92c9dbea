//! CLI commands for plugin discovery.

use clap::Subcommand;

use {
    plughub_config::{PlughubConfig, format_duration},
    plughub_plugins::{DescriptorSource, FsPluginSource, PluginDescriptor},
};

#[derive(Subcommand)]
pub enum PluginAction {
    /// List discovered plugins in start order.
    List {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show details about a plugin.
    Info {
        /// Plugin name.
        name: String,
    },
}

pub async fn handle_plugins(action: &PluginAction, config: &PlughubConfig) -> anyhow::Result<()> {
    let source = FsPluginSource::from_config(config);
    let plugins = source.list().await?;

    match action {
        PluginAction::List { json } => {
            if *json {
                println!("{}", serde_json::to_string_pretty(&plugins)?);
                return Ok(());
            }
            if plugins.is_empty() {
                println!("No plugins found.");
                for dir in source.search_paths() {
                    println!("  searched {}/<name>/plugin.toml", dir.display());
                }
                return Ok(());
            }
            for plugin in &plugins {
                let status = if plugin.enabled {
                    "✓"
                } else {
                    "✗"
                };
                let version = plugin.version.as_deref().unwrap_or("-");
                match &plugin.description {
                    Some(desc) => println!("  {status} {} {version}: {desc}", plugin.name),
                    None => println!("  {status} {} {version}", plugin.name),
                }
            }
        },
        PluginAction::Info { name } => {
            let Some(plugin) = plugins.iter().find(|p| &p.name == name) else {
                eprintln!("Plugin '{name}' not found.");
                std::process::exit(1);
            };
            print_info(plugin);
        },
    }

    Ok(())
}

fn print_info(plugin: &PluginDescriptor) {
    println!("Name:          {}", plugin.name);
    if let Some(ref version) = plugin.version {
        println!("Version:       {version}");
    }
    if let Some(ref desc) = plugin.description {
        println!("Description:   {desc}");
    }
    println!("Entry:         {}", plugin.entry.display());
    if !plugin.args.is_empty() {
        println!("Args:          {}", plugin.args.join(" "));
    }
    if let Some(ref dir) = plugin.working_dir {
        println!("Directory:     {}", dir.display());
    }
    println!("Enabled:       {}", plugin.enabled);
    println!(
        "Restart:       {} (max {}, delay {})",
        plugin.restart_policy,
        plugin.max_restarts,
        format_duration(plugin.restart_delay)
    );
    println!("Call timeout:  {}", format_duration(plugin.call_timeout));
    if !plugin.dependencies.is_empty() {
        let deps: Vec<&str> = plugin.dependencies.iter().map(String::as_str).collect();
        println!("Depends on:    {}", deps.join(", "));
    }
    if !plugin.env.is_empty() {
        let keys: Vec<&str> = plugin.env.keys().map(String::as_str).collect();
        println!("Env:           {}", keys.join(", "));
    }
}
