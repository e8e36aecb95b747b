//! Command handlers
//!
//! Each handler builds one network component from the settings, subscribes
//! the log subscriber, runs it on a background task and stops it on Ctrl+C.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use murmur_core::{file_checksum, file_name, readable_file_size, Settings};
use murmur_net::frame::frame;
use murmur_net::{
    resolve, BeaconConfig, BeaconReceiver, BeaconSender, BeaconSenderAndReceiver, Collector,
    Connection, ConnectionManager, Event, EventKind, FileTransferClient, FileTransferServer,
    LogSubscriber, Subscriber, MESSAGE_DELIMITER,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

type Task = JoinHandle<murmur_net::Result<()>>;

/// How a watched task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Completed,
    Interrupted,
}

pub async fn host(settings: &Settings, port: Option<u16>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(settings.communication.port)));
    let hub = ConnectionManager::listen_on(addr, settings.connection_config())
        .await
        .context("Failed to start host")?;
    hub.subscribe(Arc::new(LogSubscriber));
    let mut task = hub.spawn();
    info!(addr = %hub.local_addr(), "Hosting, lines typed here are sent to every peer");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            result = &mut task => return joined(result),
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(text)) => {
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    let delivered = hub.broadcast(&frame(text, MESSAGE_DELIMITER)).await;
                    info!(delivered, "Broadcast sent");
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "Stopped reading stdin");
                    stdin_open = false;
                }
            },
        }
    }

    info!(peers = hub.connection_count(), "Shutting down host");
    hub.stop();
    joined(task.await)
}

pub async fn connect(settings: &Settings, host: &str, port: Option<u16>) -> Result<()> {
    let addr = resolve(host, port.unwrap_or(settings.communication.port)).await?;
    let connection = Connection::open_with_config(addr, settings.connection_config())
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    connection.subscribe(Arc::new(LogSubscriber));
    let mut task = connection.spawn();
    info!(peer = %addr, local = %connection.local_address(), "Connected, lines typed here are sent to the host");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            result = &mut task => return joined(result),
            line = lines.next_line() => match line? {
                Some(text) => {
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    connection
                        .send(&frame(text, MESSAGE_DELIMITER))
                        .await
                        .context("Failed to send message")?;
                }
                None => break,
            },
        }
    }

    connection.stop();
    joined(task.await)
}

pub async fn beacon_send(
    settings: &Settings,
    message: String,
    port: Option<u16>,
    broadcast: Option<IpAddr>,
) -> Result<()> {
    let config = beacon_config(settings, message, port, broadcast);
    let sender = BeaconSender::bind(config)
        .await
        .context("Failed to open beacon socket")?;
    sender.subscribe(Arc::new(LogSubscriber));
    info!(destination = %sender.config().destination(), "Sending beacons");

    until_interrupted(sender.spawn(), || sender.stop()).await?;
    Ok(())
}

pub async fn beacon_listen(
    settings: &Settings,
    port: Option<u16>,
    broadcast: Option<IpAddr>,
) -> Result<()> {
    let config = beacon_config(settings, String::new(), port, broadcast);
    let receiver = BeaconReceiver::bind(config)
        .await
        .context("Failed to open beacon socket")?;
    receiver.subscribe(Arc::new(LogSubscriber));
    receiver.subscribe(print_beacons());
    info!(addr = %receiver.local_addr(), "Listening for beacons");

    until_interrupted(receiver.spawn(), || receiver.stop()).await?;
    Ok(())
}

pub async fn beacon_both(
    settings: &Settings,
    message: String,
    port: Option<u16>,
    broadcast: Option<IpAddr>,
) -> Result<()> {
    let config = beacon_config(settings, message, port, broadcast);
    let beacon = BeaconSenderAndReceiver::bind(config)
        .await
        .context("Failed to open beacon socket")?;
    beacon.subscribe(Arc::new(LogSubscriber));
    beacon.subscribe(print_beacons());
    info!(
        addr = %beacon.local_addr(),
        destination = %beacon.config().destination(),
        "Sending and listening for beacons"
    );

    until_interrupted(beacon.spawn(), || beacon.stop()).await?;
    Ok(())
}

pub async fn serve(settings: &Settings, file: &Path, port: Option<u16>) -> Result<()> {
    let checksum =
        file_checksum(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let server = FileTransferServer::bind_with_config(
        file,
        port.unwrap_or(settings.transfer.port),
        settings.transfer_config(),
    )
    .await
    .with_context(|| format!("Failed to serve {}", file.display()))?;
    server.subscribe(Arc::new(LogSubscriber));
    let outcome = Collector::new();
    server.subscribe(outcome.clone());

    let name = file_name(file).unwrap_or_else(|| file.display().to_string());
    println!(
        "Serving {} ({}) on {}",
        name,
        readable_file_size(server.total_bytes()),
        server.local_addr()
    );
    println!("size:   {}", server.total_bytes());
    println!("sha256: {}", checksum);

    let finish = watch_progress(server.spawn(), || server.percentage(), || server.cancel()).await?;
    check_outcome(&outcome)?;
    if finish == Finish::Completed {
        println!("Sent {}", readable_file_size(server.transferred_bytes()));
    }
    Ok(())
}

pub async fn fetch(
    settings: &Settings,
    host: &str,
    destination: &Path,
    port: Option<u16>,
    size: Option<u64>,
) -> Result<()> {
    let addr = resolve(host, port.unwrap_or(settings.transfer.port)).await?;
    let client =
        FileTransferClient::with_config(destination, addr, size, settings.transfer_config());
    client.subscribe(Arc::new(LogSubscriber));
    let outcome = Collector::new();
    client.subscribe(outcome.clone());

    let finish = watch_progress(client.spawn(), || client.percentage(), || client.cancel()).await?;
    check_outcome(&outcome)?;
    if finish == Finish::Interrupted {
        warn!(path = %destination.display(), "Download interrupted, file is incomplete");
        return Ok(());
    }

    let received = client.transferred_bytes();
    if let Some(expected) = size {
        if received != expected {
            bail!("Expected {} bytes but received {}", expected, received);
        }
    }
    let checksum = file_checksum(destination)
        .with_context(|| format!("Failed to read {}", destination.display()))?;
    println!(
        "Received {} into {}",
        readable_file_size(received),
        destination.display()
    );
    println!("sha256: {}", checksum);
    Ok(())
}

fn beacon_config(
    settings: &Settings,
    message: String,
    port: Option<u16>,
    broadcast: Option<IpAddr>,
) -> BeaconConfig {
    let mut config = settings.beacon_config(message);
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(broadcast) = broadcast {
        config.broadcast_address = broadcast;
    }
    config
}

fn print_beacons() -> Arc<dyn Subscriber> {
    Arc::new(|event: &Event| {
        if event.kind() == EventKind::Beacon {
            println!("{}  {}", event.source_address(), event.content());
        }
    })
}

/// Run until the task ends by itself or Ctrl+C, then stop it and wait
async fn until_interrupted(mut task: Task, stop: impl FnOnce()) -> Result<Finish> {
    tokio::select! {
        result = &mut task => return joined(result).map(|()| Finish::Completed),
        _ = tokio::signal::ctrl_c() => {}
    }
    stop();
    joined(task.await)?;
    Ok(Finish::Interrupted)
}

/// Like [`until_interrupted`], logging the percentage as it changes
async fn watch_progress(
    mut task: Task,
    percentage: impl Fn() -> u8,
    cancel: impl FnOnce(),
) -> Result<Finish> {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut last = None;

    loop {
        tokio::select! {
            result = &mut task => return joined(result).map(|()| Finish::Completed),
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                let current = percentage();
                if last != Some(current) {
                    info!(percent = current, "Transfer progress");
                    last = Some(current);
                }
            }
        }
    }

    cancel();
    joined(task.await)?;
    Ok(Finish::Interrupted)
}

/// Surface the first error a transfer reported through its events
fn check_outcome(outcome: &Collector) -> Result<()> {
    match outcome.of_kind(EventKind::Error).first() {
        Some(event) => bail!("Transfer failed: {}", event.content()),
        None => Ok(()),
    }
}

fn joined(result: std::result::Result<murmur_net::Result<()>, JoinError>) -> Result<()> {
    result.context("Background task panicked")??;
    Ok(())
}
