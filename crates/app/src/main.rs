//! Murmur - LAN messaging, discovery and file transfer
//!
//! ```bash
//! murmur host                      # accept peers, broadcast stdin lines
//! murmur connect 192.168.1.20      # talk to a host
//! murmur beacon both "desk-7"      # announce and listen on UDP
//! murmur serve ./report.pdf        # offer one file
//! murmur fetch 192.168.1.20 ./report.pdf --size 48213
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use murmur_core::Settings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(version)]
#[command(about = "LAN messaging, discovery and file transfer")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (default: $MURMUR_CONFIG or the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept peers and broadcast stdin lines to all of them
    Host {
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Connect to a host and send stdin lines
    Connect {
        host: String,
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send or receive UDP beacons
    Beacon {
        #[command(subcommand)]
        action: BeaconAction,
    },

    /// Offer one file to the next peer that connects
    Serve {
        file: PathBuf,
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Download a file from a serving peer
    Fetch {
        host: String,
        destination: PathBuf,
        #[arg(short, long)]
        port: Option<u16>,
        /// Expected size in bytes, as printed by `serve`
        #[arg(short, long)]
        size: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum BeaconAction {
    /// Repeatedly broadcast a message
    Send {
        message: String,
        #[command(flatten)]
        target: BeaconTarget,
    },
    /// Print beacons from other peers
    Listen {
        #[command(flatten)]
        target: BeaconTarget,
    },
    /// Broadcast a message and print everything heard, including our own
    Both {
        message: String,
        #[command(flatten)]
        target: BeaconTarget,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct BeaconTarget {
    #[arg(short, long)]
    port: Option<u16>,
    /// Broadcast address of the local subnet
    #[arg(short, long)]
    broadcast: Option<IpAddr>,
}

fn setup_logging(verbosity: u8) {
    let fallback = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .init();
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    match path {
        Some(path) => {
            let mut settings = Settings::load_from(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            settings.apply_overrides(|key| std::env::var(key).ok());
            settings.validate()?;
            Ok(settings)
        }
        None => Settings::load().context("Failed to load config"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let settings = load_settings(cli.config.as_ref())?;
    tracing::debug!(?settings, "Settings resolved");

    match cli.command {
        Command::Host { port } => commands::host(&settings, port).await,
        Command::Connect { host, port } => commands::connect(&settings, &host, port).await,
        Command::Beacon { action } => match action {
            BeaconAction::Send { message, target } => {
                commands::beacon_send(&settings, message, target.port, target.broadcast).await
            }
            BeaconAction::Listen { target } => {
                commands::beacon_listen(&settings, target.port, target.broadcast).await
            }
            BeaconAction::Both { message, target } => {
                commands::beacon_both(&settings, message, target.port, target.broadcast).await
            }
        },
        Command::Serve { file, port } => commands::serve(&settings, &file, port).await,
        Command::Fetch {
            host,
            destination,
            port,
            size,
        } => commands::fetch(&settings, &host, &destination, port, size).await,
    }
}
