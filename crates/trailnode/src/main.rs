//! trailnode - Trail node agent
//!
//! Follows the logs this node owns and streams their records to watchers
//! on this node or on peer nodes.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use trail_logs::SourceProfile;
use trail_proto::{DeliveryPayload, LogIdentity, TrackingMode, TrackingRequest};
use trailnode::{ChannelSink, LoggingSink, NodeConfig, TrailNode};

#[derive(Parser)]
#[command(name = "trailnode")]
#[command(about = "Trail node agent")]
#[command(version)]
struct Cli {
    /// Log as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node agent
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/trailnode/config.json")]
        config: PathBuf,
    },

    /// Start a node and print a log's records until interrupted
    Watch {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/trailnode/config.json")]
        config: PathBuf,

        /// Log to watch (file path, node://, docker:// or kubernetes://)
        log: String,

        /// Group lines into records by this timestamp format
        #[arg(long)]
        timestamp_format: Option<String>,

        /// Start with the last lines of the log
        #[arg(long)]
        backlog: bool,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/trailnode/config.json")]
        output: PathBuf,
    },

    /// Check a path against the access policy
    CheckAccess {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/trailnode/config.json")]
        config: PathBuf,

        /// Path to check
        path: PathBuf,
    },

    /// Print the follow command used for a log
    ShowCommand {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/trailnode/config.json")]
        config: PathBuf,

        /// Log to follow
        log: String,

        /// Use the grouped backlog size
        #[arg(long)]
        grouped: bool,

        /// Include the backlog
        #[arg(long)]
        backlog: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive("trailnode=info".parse()?);
    if cli.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Run { config } => {
            run_node(config).await?;
        }

        Commands::Watch {
            config,
            log,
            timestamp_format,
            backlog,
        } => {
            watch_log(config, &log, timestamp_format, backlog).await?;
        }

        Commands::InitConfig { output } => {
            init_config(output)?;
        }

        Commands::CheckAccess { config, path } => {
            check_access(config, path)?;
        }

        Commands::ShowCommand {
            config,
            log,
            grouped,
            backlog,
        } => {
            show_command(config, &log, grouped, backlog)?;
        }
    }

    Ok(())
}

async fn run_node(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting trailnode");

    let config = NodeConfig::from_file(&config_path)?;
    info!(
        name = %config.node.name,
        listen = %config.node.listen,
        peers = config.node.peers.len(),
        "loaded config"
    );

    let node = TrailNode::start(&config, Arc::new(LoggingSink)).await?;
    info!(addr = %node.local_addr(), "node ready");

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    node.shutdown().await;
    Ok(())
}

async fn watch_log(
    config_path: PathBuf,
    log: &str,
    timestamp_format: Option<String>,
    backlog: bool,
) -> anyhow::Result<()> {
    let config = NodeConfig::from_file(&config_path)?;
    let identity = LogIdentity::parse(log, &config.node.name)?;

    let (sink, mut deliveries) = ChannelSink::new(256);
    let node = TrailNode::start(&config, Arc::new(sink)).await?;

    let watcher = node.watcher_address();
    let request = match timestamp_format {
        Some(format) => TrackingRequest::grouped(identity, format, watcher, "cli"),
        None => TrackingRequest::flat(identity, watcher, "cli"),
    }
    .with_backlog(backlog);

    let outcome = node.watch(request.clone()).await?;
    info!(log = %request.identity, outcome = ?outcome, "watching");

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else {
                    break;
                };
                match delivery.payload {
                    DeliveryPayload::Record(record) => {
                        for line in record.texts() {
                            println!("{line}");
                        }
                    }
                    DeliveryPayload::Event(event) => {
                        eprintln!("[{:?}] {}", event.kind, event.message);
                    }
                }
            }
            _ = &mut interrupted => break,
        }
    }

    if let Err(e) = node.unwatch(request).await {
        warn!(error = %e, "unwatch failed");
    }
    node.shutdown().await;
    Ok(())
}

fn init_config(output: PathBuf) -> anyhow::Result<()> {
    let mut config = NodeConfig::default();
    config.access.include = vec!["/var/log/**".to_string()];
    config.access.exclude = vec!["/var/log/**/*.gz".to_string()];

    config.save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the access section and peers, then run:");
    println!("  trailnode run --config {}", output.display());

    Ok(())
}

fn check_access(config_path: PathBuf, path: PathBuf) -> anyhow::Result<()> {
    let config = NodeConfig::from_file(&config_path)?;
    let guard = config.access.to_guard()?;

    match guard.check_access(&path) {
        Ok(resolved) => println!("allowed: {}", resolved.display()),
        Err(e) => println!("denied: {e}"),
    }
    Ok(())
}

fn show_command(config_path: PathBuf, log: &str, grouped: bool, backlog: bool) -> anyhow::Result<()> {
    let config = NodeConfig::from_file(&config_path)?;
    let identity = LogIdentity::parse(log, &config.node.name)?;
    let mode = if grouped {
        TrackingMode::Grouped
    } else {
        TrackingMode::Flat
    };

    let commands = config.adapters.command_settings();
    let lines = commands.backlog.lines(identity.kind(), mode, backlog);
    let command = SourceProfile::of(identity.kind()).follow_command(&identity, lines, &commands);

    println!("{command}");
    Ok(())
}
