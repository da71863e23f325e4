//! Orthrus Bridge
//!
//! Headless session bridge serving terminals and live documentation builds
//! to front ends over a Unix socket or stdio.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bridge::config::{default_config_path, Config};
use bridge::ipc::{get_socket_path, serve_connection, IpcClient, IpcServer};
use bridge::orchestrator::BridgeOrchestrator;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Orthrus Bridge - terminal and live build supervisor for documentation
/// workspaces.
#[derive(Parser, Debug)]
#[command(name = "orthrus-bridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the bridge.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the bridge
    Serve {
        /// Unix socket to listen on (default: $XDG_RUNTIME_DIR/orthrus/bridge.sock)
        #[arg(long, value_name = "PATH", conflicts_with = "stdio")]
        socket: Option<PathBuf>,

        /// Serve a single front end on stdin/stdout
        #[arg(long)]
        stdio: bool,
    },

    /// Check whether a bridge is answering on its socket
    Ping {
        /// Unix socket to connect to
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    // Load configuration
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    let _log_guard = init_logging(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Serve { socket, stdio } => {
            config.validate()?;
            let orchestrator = Arc::new(BridgeOrchestrator::new(config)?);

            if stdio {
                run_stdio(orchestrator).await?;
            } else {
                let socket = socket
                    .or_else(|| orchestrator.config().bridge.socket_path.clone())
                    .unwrap_or_else(get_socket_path);
                run_socket(orchestrator, &socket).await?;
            }
        }
        Commands::Ping { socket } => {
            let socket = socket
                .or_else(|| config.bridge.socket_path.clone())
                .unwrap_or_else(get_socket_path);
            match ping(&socket).await {
                Ok(()) => println!("Bridge is running at {}", socket.display()),
                Err(e) => {
                    eprintln!("Bridge is not running: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => {
                print!("{}", config.to_toml()?);
            }
            ConfigCommands::Path => {
                println!("{}", config_path.display());
            }
            ConfigCommands::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "Config file already exists: {} (use --force to overwrite)",
                        config_path.display()
                    );
                }
                Config::default().save(&config_path)?;
                println!("Wrote {}", config_path.display());
            }
        },
    }

    Ok(())
}

/// Initializes tracing to stderr, or to a daily log file when configured.
///
/// Stdout stays free for the stdio transport.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.bridge.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.bridge.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "bridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Serves front ends on a Unix socket until a shutdown signal arrives.
async fn run_socket(orchestrator: Arc<BridgeOrchestrator>, socket: &Path) -> anyhow::Result<()> {
    let server = IpcServer::bind(socket)
        .await
        .with_context(|| format!("Failed to bind socket: {}", socket.display()))?;
    tracing::info!("Orthrus bridge listening on {}", server.path().display());

    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        result = server.serve(Arc::clone(&orchestrator), shutdown.clone()) => {
            result.context("IPC server failed")?;
        }
        result = wait_for_shutdown_signal() => {
            result?;
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

/// Serves one front end on stdin/stdout until it closes its side or a
/// shutdown signal arrives.
async fn run_stdio(orchestrator: Arc<BridgeOrchestrator>) -> anyhow::Result<()> {
    tracing::info!("Orthrus bridge serving on stdio");

    tokio::select! {
        result = serve_connection(tokio::io::stdin(), tokio::io::stdout(), Arc::clone(&orchestrator)) => {
            result.context("stdio transport failed")?;
            tracing::info!("Front end closed stdin");
        }
        result = wait_for_shutdown_signal() => {
            result?;
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

async fn ping(socket: &Path) -> anyhow::Result<()> {
    let mut client = IpcClient::connect(socket).await?;
    if client.ping().await? {
        Ok(())
    } else {
        anyhow::bail!("unexpected answer to ping")
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
