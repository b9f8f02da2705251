use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use shell_plugins::logging::init_logging;
use shell_plugins::plugins::InMemoryToolRegistry;
use shell_plugins::{HostConfig, PluginManager, PluginWatcher};

/// Plugin host for the session shell
#[derive(Parser)]
#[command(name = "shell-plugins", version, about)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "SHELL_PLUGINS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level or filter directive, overrides the configuration
    #[arg(long)]
    log_level: Option<String>,

    /// Plugin directory, overrides the configuration
    #[arg(long)]
    plugin_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List candidate plugin modules
    Discover,
    /// Load one module, print its metadata as JSON and unload it again
    Load {
        /// Path to the module
        path: PathBuf,
    },
    /// Load all plugins and keep them in sync with the plugin directory
    Run {
        /// Do not watch the plugin directory
        #[arg(long)]
        no_watch: bool,
    },
    /// Print a sample configuration file
    SampleConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config =
        HostConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging = config.logging.with_level(level);
    }
    if let Some(dir) = cli.plugin_dir {
        config.plugins.plugin_dir = dir;
    }

    let _log_guard = init_logging(&config.logging)?;

    let tools = Arc::new(InMemoryToolRegistry::new());
    let manager = Arc::new(PluginManager::new(config.plugins.clone(), tools.clone()));

    match cli.command {
        Command::Discover => {
            for path in &manager.discover() {
                println!("{}", path.display());
            }
            Ok(())
        }
        Command::Load { path } => {
            let outcome = manager
                .load_or_reload(&path)
                .await
                .with_context(|| format!("Failed to load {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&outcome.metadata)?);
            manager.unload(&path).await;
            Ok(())
        }
        Command::Run { no_watch } => {
            tracing::info!(
                plugin_dir = %config.plugins.plugin_dir.display(),
                auto_load = config.plugins.auto_load,
                hot_reload = config.plugins.hot_reload && !no_watch,
                "starting plugin host"
            );

            if config.plugins.auto_load {
                manager.load_all().await;
            }

            let watcher = if config.plugins.hot_reload && !no_watch {
                Some(
                    PluginWatcher::start(manager.clone())
                        .context("Failed to watch plugin directory")?,
                )
            } else {
                None
            };

            tracing::info!("{} tool(s) registered: {:?}", tools.len(), tools.keys());
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;

            tracing::info!("shutting down");
            drop(watcher);
            manager.shutdown().await;
            Ok(())
        }
        Command::SampleConfig => {
            print!("{}", HostConfig::sample_toml()?);
            Ok(())
        }
    }
}
