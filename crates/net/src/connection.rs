//! A single TCP duplex endpoint
//!
//! A [`Connection`] wraps one socket. Its receive loop frames every read and
//! publishes one `Communication` event per message; [`Connection::send`]
//! writes raw UTF-8 text. Reads and writes proceed independently.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{Event, EventChannel, Subscriber};
use crate::frame::{self, MESSAGE_DELIMITER};
use crate::lifecycle::{Lifecycle, LoopState};
use crate::DEFAULT_COMMUNICATION_BUFFER_SIZE;

/// Unique id of a connection, used by the manager to track children
pub type ConnectionId = Uuid;

/// Resolve `host:port` to the first address the resolver returns
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", host, e)))?;
    addrs
        .next()
        .ok_or_else(|| Error::InvalidAddress(host.to_string()))
}

/// Tunables for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Maximum number of bytes taken from the socket per read
    pub buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_COMMUNICATION_BUFFER_SIZE,
        }
    }
}

/// Connection handle. Clones share the same socket and subscribers.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    remote_address: String,
    config: ConnectionConfig,
    events: EventChannel,
    lifecycle: Lifecycle,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

/// Why the receive loop ended
enum Exit {
    Stopped,
    PeerClosed,
    Failed(std::io::Error),
}

impl Connection {
    /// Connect to a listening peer
    pub async fn open(addr: SocketAddr) -> Result<Self> {
        Self::open_with_config(addr, ConnectionConfig::default()).await
    }

    /// Connect to `host:port`, resolving the host name first
    pub async fn open_host(host: &str, port: u16) -> Result<Self> {
        Self::connect((host, port), format!("{}:{}", host, port), ConnectionConfig::default()).await
    }

    pub async fn open_with_config(addr: SocketAddr, config: ConnectionConfig) -> Result<Self> {
        Self::connect(addr, addr.to_string(), config).await
    }

    async fn connect<A: ToSocketAddrs>(
        addr: A,
        label: String,
        config: ConnectionConfig,
    ) -> Result<Self> {
        info!(addr = %label, "Connecting");
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| Error::Connect {
                addr: label,
                source,
            })?;
        Self::adopt_with_config(stream, config)
    }

    /// Wrap a socket returned by `accept()`
    pub fn adopt(stream: TcpStream) -> Result<Self> {
        Self::adopt_with_config(stream, ConnectionConfig::default())
    }

    pub fn adopt_with_config(stream: TcpStream, config: ConnectionConfig) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle");
        }
        let (reader, writer) = stream.into_split();

        debug!(peer = %peer_addr, local = %local_addr, "Connection established");

        Ok(Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                peer_addr,
                local_addr,
                remote_address: peer_addr.ip().to_string(),
                config,
                events: EventChannel::new(),
                lifecycle: Lifecycle::new(),
                reader: Mutex::new(Some(reader)),
                writer: tokio::sync::Mutex::new(Some(writer)),
            }),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// IP address of the peer, as text
    pub fn remote_address(&self) -> &str {
        &self.inner.remote_address
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// IP address of this end of the connection, as text
    pub fn local_address(&self) -> String {
        self.inner.local_addr.ip().to_string()
    }

    pub fn events(&self) -> &EventChannel {
        &self.inner.events
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.inner.events.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) -> bool {
        self.inner.events.unsubscribe(subscriber)
    }

    pub fn state(&self) -> LoopState {
        self.inner.lifecycle.state()
    }

    /// Send `text` as UTF-8, waiting until every byte is written.
    ///
    /// Concurrent senders are serialized.
    pub async fn send(&self, text: &str) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;

        writer
            .write_all(text.as_bytes())
            .await
            .map_err(Error::Send)?;
        writer.flush().await.map_err(Error::Send)?;

        debug!(to = %self.inner.peer_addr, bytes = text.len(), "Sent");
        Ok(())
    }

    /// Request the receive loop to stop. The socket is closed by the loop.
    pub fn stop(&self) {
        if self.inner.lifecycle.stop() {
            debug!(peer = %self.inner.peer_addr, "Stop requested");
        }
    }

    /// Start the receive loop on its own task
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let connection = self.clone();
        tokio::spawn(async move { connection.run().await })
    }

    /// Receive loop. Runs until stopped, the peer closes, or a read fails.
    ///
    /// Each read of at most `buffer_size` bytes is framed independently.
    pub async fn run(&self) -> Result<()> {
        let mut stop = self.inner.lifecycle.start()?;
        let reader = self.inner.reader.lock().take();
        let Some(mut reader) = reader else {
            self.inner.lifecycle.close();
            return Err(Error::NotConnected);
        };

        info!(peer = %self.inner.peer_addr, "Connection running");

        let mut buf = vec![0u8; self.inner.config.buffer_size.max(1)];
        let exit = loop {
            if stop.is_stopped() {
                break Exit::Stopped;
            }

            tokio::select! {
                _ = stop.stopped() => break Exit::Stopped,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break Exit::PeerClosed,
                    Ok(n) => self.dispatch(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => break Exit::Failed(e),
                },
            }
        };

        drop(reader);
        self.release().await;

        match exit {
            Exit::Stopped => {
                info!(peer = %self.inner.peer_addr, "Connection stopped");
            }
            Exit::PeerClosed => {
                info!(peer = %self.inner.peer_addr, "Connection closed by peer");
                self.inner.events.publish(Event::info(format!(
                    "Connection closed by peer {}",
                    self.inner.remote_address
                )));
            }
            Exit::Failed(e) => {
                warn!(peer = %self.inner.peer_addr, error = %e, "Read error");
                self.inner.events.publish(Event::error(Error::Read(e)));
            }
        }

        self.inner.lifecycle.close();
        Ok(())
    }

    fn dispatch(&self, bytes: &[u8]) {
        for message in frame::decode(bytes, MESSAGE_DELIMITER) {
            debug!(from = %self.inner.peer_addr, len = message.len(), "Received message");
            self.inner
                .events
                .publish(Event::communication(self.inner.remote_address.as_str(), message));
        }
    }

    /// Shut down and drop the write half. Later sends fail with `NotConnected`.
    pub(crate) async fn release(&self) {
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Shutdown failed");
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
