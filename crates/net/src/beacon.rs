//! UDP beacons for peer discovery
//!
//! A beacon is one datagram whose payload is the raw UTF-8 message. There is
//! no header and no length prefix. Three flavours share that contract:
//!
//! - [`BeaconSender`] broadcasts the current message every resend interval
//! - [`BeaconReceiver`] publishes a `Beacon` event per datagram received
//! - [`BeaconSenderAndReceiver`] does both over a single socket

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventChannel, Subscriber};
use crate::lifecycle::{Lifecycle, LoopState, StopSignal};
use crate::{
    DEFAULT_BEACON_PORT, DEFAULT_DATAGRAM_BUFFER_SIZE, DEFAULT_RECEIVE_TIMEOUT,
    DEFAULT_RESEND_INTERVAL,
};

/// Beacon settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconConfig {
    /// UDP port beacons are sent to and received on
    pub port: u16,
    /// Destination of outgoing beacons, normally the subnet broadcast address
    pub broadcast_address: IpAddr,
    /// Initial beacon payload
    pub message: String,
    pub resend_interval: Duration,
    /// Upper bound on one receive, so the loop can notice a stop
    pub receive_timeout: Duration,
    /// Larger datagrams are truncated by the transport
    pub datagram_buffer_bytes: usize,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_BEACON_PORT,
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            message: String::new(),
            resend_interval: DEFAULT_RESEND_INTERVAL,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            datagram_buffer_bytes: DEFAULT_DATAGRAM_BUFFER_SIZE,
        }
    }
}

impl BeaconConfig {
    pub fn new(broadcast_address: IpAddr, port: u16) -> Self {
        Self {
            port,
            broadcast_address,
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_resend_interval(mut self, interval: Duration) -> Self {
        self.resend_interval = interval;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_datagram_buffer_bytes(mut self, bytes: usize) -> Self {
        self.datagram_buffer_bytes = bytes;
        self
    }

    /// Where outgoing beacons are sent
    pub fn destination(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_address, self.port)
    }
}

/// State shared by the three beacon flavours
struct BeaconCore {
    config: BeaconConfig,
    message: RwLock<String>,
    local_addr: SocketAddr,
    socket: Mutex<Option<UdpSocket>>,
    events: EventChannel,
    lifecycle: Lifecycle,
}

impl BeaconCore {
    async fn bind(config: BeaconConfig, bind_addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: bind_addr,
                source,
            })?;
        socket.set_broadcast(true).map_err(|source| Error::Bind {
            addr: bind_addr,
            source,
        })?;
        let local_addr = socket.local_addr()?;

        debug!(addr = %local_addr, destination = %config.destination(), "Beacon socket bound");

        Ok(Self {
            message: RwLock::new(config.message.clone()),
            config,
            local_addr,
            socket: Mutex::new(Some(socket)),
            events: EventChannel::new(),
            lifecycle: Lifecycle::new(),
        })
    }

    /// Mark the loop as running and hand it the socket
    fn start(&self) -> Result<(StopSignal, UdpSocket)> {
        let stop = self.lifecycle.start()?;
        match self.socket.lock().take() {
            Some(socket) => Ok((stop, socket)),
            None => {
                self.lifecycle.close();
                Err(Error::NotConnected)
            }
        }
    }

    fn finish(&self, socket: UdpSocket) {
        drop(socket);
        self.lifecycle.close();
        info!(addr = %self.local_addr, "Beacon stopped");
    }

    async fn send_current(&self, socket: &UdpSocket) -> Result<()> {
        let message = self.message.read().clone();
        let destination = self.config.destination();
        socket
            .send_to(message.as_bytes(), destination)
            .await
            .map_err(Error::Send)?;
        debug!(to = %destination, bytes = message.len(), "Beacon sent");
        Ok(())
    }

    /// Send the current message; a failure is reported but not fatal
    async fn send_or_report(&self, socket: &UdpSocket) {
        if let Err(e) = self.send_current(socket).await {
            warn!(error = %e, "Beacon send failed");
            self.events.publish(Event::error(e));
        }
    }

    async fn receive(&self, socket: &UdpSocket, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        match tokio::time::timeout(self.config.receive_timeout, socket.recv_from(buf)).await {
            Err(_) => Err(Error::Timeout),
            Ok(Ok(received)) => Ok(received),
            // ICMP errors from earlier sends surface here on some platforms
            Ok(Err(e)) if is_transient(&e) => {
                debug!(error = %e, "Ignoring transient receive error");
                Err(Error::Timeout)
            }
            Ok(Err(e)) => Err(Error::Read(e)),
        }
    }

    fn publish_beacon(&self, payload: &[u8], from: SocketAddr) {
        let content = String::from_utf8_lossy(payload).trim().to_string();
        debug!(from = %from, "Beacon received");
        self.events
            .publish(Event::beacon(from.ip().to_string(), content));
    }

    fn fail(&self, e: Error) {
        error!(addr = %self.local_addr, error = %e, "Beacon socket failed");
        self.events.publish(Event::error(e));
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

/// Accessors every beacon flavour exposes
macro_rules! beacon_handle {
    ($name:ident) => {
        impl $name {
            pub fn config(&self) -> &BeaconConfig {
                &self.core.config
            }

            pub fn local_addr(&self) -> SocketAddr {
                self.core.local_addr
            }

            pub fn events(&self) -> &EventChannel {
                &self.core.events
            }

            pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
                self.core.events.subscribe(subscriber);
            }

            pub fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) -> bool {
                self.core.events.unsubscribe(subscriber)
            }

            pub fn state(&self) -> LoopState {
                self.core.lifecycle.state()
            }

            /// Request the loop to stop; the socket is released by the loop
            pub fn stop(&self) {
                if self.core.lifecycle.stop() {
                    debug!(addr = %self.core.local_addr, "Beacon stop requested");
                }
            }

            /// Start the loop on its own task
            pub fn spawn(&self) -> JoinHandle<Result<()>> {
                let beacon = self.clone();
                tokio::spawn(async move { beacon.run().await })
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("local_addr", &self.core.local_addr)
                    .field("destination", &self.core.config.destination())
                    .field("state", &self.state())
                    .finish()
            }
        }
    };
}

/// Periodically broadcasts a beacon
#[derive(Clone)]
pub struct BeaconSender {
    core: Arc<BeaconCore>,
}

beacon_handle!(BeaconSender);

impl BeaconSender {
    /// Bind an ephemeral local port; beacons go to `config.destination()`
    pub async fn bind(config: BeaconConfig) -> Result<Self> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], 0));
        Ok(Self {
            core: Arc::new(BeaconCore::bind(config, bind_addr).await?),
        })
    }

    /// Replace the payload used by the next send
    pub fn update_beacon(&self, message: impl Into<String>) {
        *self.core.message.write() = message.into();
    }

    pub fn message(&self) -> String {
        self.core.message.read().clone()
    }

    pub async fn run(&self) -> Result<()> {
        let (mut stop, socket) = self.core.start()?;
        info!(destination = %self.core.config.destination(), "Beacon sender running");

        loop {
            if stop.is_stopped() {
                break;
            }

            self.core.send_or_report(&socket).await;

            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(self.core.config.resend_interval) => {}
            }
        }

        self.core.finish(socket);
        Ok(())
    }
}

/// Listens for beacons on the configured port
#[derive(Clone)]
pub struct BeaconReceiver {
    core: Arc<BeaconCore>,
}

beacon_handle!(BeaconReceiver);

impl BeaconReceiver {
    /// Bind `0.0.0.0:config.port`
    pub async fn bind(config: BeaconConfig) -> Result<Self> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        Ok(Self {
            core: Arc::new(BeaconCore::bind(config, bind_addr).await?),
        })
    }

    pub async fn run(&self) -> Result<()> {
        let (mut stop, socket) = self.core.start()?;
        info!(addr = %self.core.local_addr, "Beacon receiver running");

        let mut buf = vec![0u8; self.core.config.datagram_buffer_bytes.max(1)];
        loop {
            if stop.is_stopped() {
                break;
            }

            let received = tokio::select! {
                _ = stop.stopped() => break,
                received = self.core.receive(&socket, &mut buf) => received,
            };

            match received {
                Ok((n, from)) => self.core.publish_beacon(&buf[..n], from),
                Err(Error::Timeout) => continue,
                Err(e) => {
                    self.core.fail(e);
                    break;
                }
            }
        }

        self.core.finish(socket);
        Ok(())
    }
}

/// Sends and receives beacons over one socket bound to the beacon port.
/// Its own broadcasts loop back and are reported like any other beacon.
#[derive(Clone)]
pub struct BeaconSenderAndReceiver {
    core: Arc<BeaconCore>,
}

beacon_handle!(BeaconSenderAndReceiver);

impl BeaconSenderAndReceiver {
    /// Bind `0.0.0.0:config.port`
    pub async fn bind(config: BeaconConfig) -> Result<Self> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        Ok(Self {
            core: Arc::new(BeaconCore::bind(config, bind_addr).await?),
        })
    }

    /// Replace the payload used by the next send
    pub fn update_beacon(&self, message: impl Into<String>) {
        *self.core.message.write() = message.into();
    }

    pub fn message(&self) -> String {
        self.core.message.read().clone()
    }

    /// Send, wait up to the receive timeout for one beacon, then sleep the
    /// resend interval. A timeout skips the sleep and sends again.
    pub async fn run(&self) -> Result<()> {
        let (mut stop, socket) = self.core.start()?;
        info!(
            addr = %self.core.local_addr,
            destination = %self.core.config.destination(),
            "Beacon sender and receiver running"
        );

        let mut buf = vec![0u8; self.core.config.datagram_buffer_bytes.max(1)];
        loop {
            if stop.is_stopped() {
                break;
            }

            self.core.send_or_report(&socket).await;

            let received = tokio::select! {
                _ = stop.stopped() => break,
                received = self.core.receive(&socket, &mut buf) => received,
            };

            match received {
                Ok((n, from)) => self.core.publish_beacon(&buf[..n], from),
                Err(Error::Timeout) => continue,
                Err(e) => {
                    self.core.fail(e);
                    break;
                }
            }

            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(self.core.config.resend_interval) => {}
            }
        }

        self.core.finish(socket);
        Ok(())
    }
}
