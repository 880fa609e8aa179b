//! diagpipe CLI (`dp`)
//!
//! Thin wrapper over diagpipe-core: loads configuration, initializes
//! logging, and drives the diagnostic IPC proxy or config inspection.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use diagpipe_core::config::{DiagpipeConfig, CONFIG_FILE_NAME};
use diagpipe_core::logging::init_logging;
use diagpipe_core::pipeline::StopSource;
use diagpipe_core::proxy::ProxyRunner;
use diagpipe_core::transport::{ProxyEndpoint, SocketProxy};

#[derive(Parser)]
#[command(name = "dp", version, about = "Diagnostics pipelines and IPC proxy for managed runtimes")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the diagnostic IPC proxy.
    Proxy {
        /// Front-end endpoint the runtime connects to (tcp:ADDR or unix:PATH).
        #[arg(long)]
        frontend: Option<String>,
        /// Back-end endpoint tooling is reached at (tcp:ADDR or unix:PATH).
        #[arg(long)]
        backend: Option<String>,
        /// Terminate when no runtime connects within the timeout.
        #[arg(long)]
        auto_shutdown: bool,
    },
    /// Configuration inspection.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Load, validate, and print the resolved configuration.
    Check,
}

/// Parse `tcp:ADDR` / `unix:PATH` endpoint descriptions.
fn parse_endpoint(raw: &str) -> anyhow::Result<ProxyEndpoint> {
    if let Some(addr) = raw.strip_prefix("tcp:") {
        return Ok(ProxyEndpoint::Tcp {
            addr: addr.to_string(),
        });
    }
    #[cfg(unix)]
    if let Some(path) = raw.strip_prefix("unix:") {
        return Ok(ProxyEndpoint::Unix {
            path: PathBuf::from(path),
        });
    }
    bail!("invalid endpoint '{raw}': expected tcp:ADDR or unix:PATH");
}

async fn run_proxy(
    config: &DiagpipeConfig,
    frontend: Option<String>,
    backend: Option<String>,
    auto_shutdown: bool,
) -> anyhow::Result<()> {
    let mut proxy_config = config.proxy.clone();
    if let Some(raw) = frontend {
        proxy_config.frontend = parse_endpoint(&raw)?;
    }
    if let Some(raw) = backend {
        proxy_config.backend = parse_endpoint(&raw)?;
    }
    if auto_shutdown {
        proxy_config.auto_shutdown = true;
    }

    let runner = ProxyRunner::new(
        SocketProxy::new(proxy_config.transport()),
        proxy_config.runner_options(),
    );

    let stopper = StopSource::new();
    let token = stopper.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping proxy");
            stopper.stop();
        }
    });

    let status = runner.run(token).await.context("proxy runner failed")?;
    info!(
        accepted = status.accepted,
        completed = status.completed,
        failed = status.failed_accepts,
        "proxy finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let config = DiagpipeConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    init_logging(&config.logging).context("initializing logging")?;

    match cli.command {
        Command::Proxy {
            frontend,
            backend,
            auto_shutdown,
        } => run_proxy(&config, frontend, backend, auto_shutdown).await,
        Command::Config { command } => match command {
            ConfigCommand::Check => {
                config.validate().context("invalid configuration")?;
                let rendered =
                    toml::to_string_pretty(&config).context("rendering configuration")?;
                print!("{rendered}");
                Ok(())
            }
        },
    }
}
