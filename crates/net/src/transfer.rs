//! One-shot file transfer over a dedicated TCP connection
//!
//! Wire format: the raw file bytes, in order, with no header. The server
//! closes the connection after the last byte; end of stream is end of file.
//!
//! Both ends publish exactly one `FileTransferComplete` event when their
//! copy loop exits, preceded by an `Error` event if it exited on a failure.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::event::{Event, EventChannel, Subscriber};
use crate::lifecycle::{Lifecycle, LoopState, StopSignal};
use crate::DEFAULT_TRANSFER_BUFFER_SIZE;

/// Tunables for a transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Largest chunk read from the source and written to the socket
    pub buffer_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_TRANSFER_BUFFER_SIZE,
        }
    }
}

/// Byte accounting for one session
#[derive(Debug)]
struct Progress {
    total: Option<u64>,
    transferred: AtomicU64,
    done: AtomicBool,
}

impl Progress {
    fn new(total: Option<u64>) -> Self {
        Self {
            total,
            transferred: AtomicU64::new(0),
            done: AtomicBool::new(false),
        }
    }

    fn add(&self, bytes: usize) {
        self.transferred.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Truncated percentage; 100 only once done, at most 99 before that,
    /// 0 while the total is unknown
    fn percentage(&self) -> u8 {
        if self.is_done() {
            return 100;
        }
        match self.total {
            Some(total) if total > 0 => {
                let ratio = u128::from(self.transferred()) * 100 / u128::from(total);
                ratio.min(99) as u8
            }
            _ => 0,
        }
    }
}

/// Serves one file to the first peer that connects
#[derive(Clone)]
pub struct FileTransferServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    path: PathBuf,
    local_addr: SocketAddr,
    config: TransferConfig,
    listener: Mutex<Option<TcpListener>>,
    progress: Progress,
    events: EventChannel,
    lifecycle: Lifecycle,
}

impl FileTransferServer {
    /// Read the size of `path` and listen on `0.0.0.0:port`
    pub async fn bind(path: impl AsRef<Path>, port: u16) -> Result<Self> {
        Self::bind_with_config(path, port, TransferConfig::default()).await
    }

    pub async fn bind_with_config(
        path: impl AsRef<Path>,
        port: u16,
        config: TransferConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let total = tokio::fs::metadata(&path).await?.len();

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        info!(path = %path.display(), addr = %local_addr, bytes = total, "File transfer server bound");

        Ok(Self {
            inner: Arc::new(ServerInner {
                path,
                local_addr,
                config,
                listener: Mutex::new(Some(listener)),
                progress: Progress::new(Some(total)),
                events: EventChannel::new(),
                lifecycle: Lifecycle::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Size of the file being served
    pub fn total_bytes(&self) -> u64 {
        self.inner.progress.total.unwrap_or(0)
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.inner.progress.transferred()
    }

    pub fn percentage(&self) -> u8 {
        self.inner.progress.percentage()
    }

    pub fn is_done(&self) -> bool {
        self.inner.progress.is_done()
    }

    /// Stop after the chunk currently in flight
    pub fn cancel(&self) {
        info!(path = %self.inner.path.display(), "Transfer cancelled");
        self.inner.progress.mark_done();
        self.inner.lifecycle.stop();
    }

    pub fn events(&self) -> &EventChannel {
        &self.inner.events
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.inner.events.subscribe(subscriber);
    }

    pub fn state(&self) -> LoopState {
        self.inner.lifecycle.state()
    }

    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let server = self.clone();
        tokio::spawn(async move { server.run().await })
    }

    /// Accept one peer and stream the file to it. A session runs once.
    pub async fn run(&self) -> Result<()> {
        let mut stop = self.inner.lifecycle.start()?;
        let listener = self.inner.listener.lock().take();
        let Some(listener) = listener else {
            self.inner.lifecycle.close();
            return Err(Error::NotConnected);
        };

        let outcome = self.serve(&listener, &mut stop).await;
        drop(listener);

        finish(
            &self.inner.progress,
            &self.inner.events,
            &self.inner.lifecycle,
            outcome,
        );
        Ok(())
    }

    async fn serve(&self, listener: &TcpListener, stop: &mut StopSignal) -> Result<()> {
        let (mut stream, peer) = tokio::select! {
            _ = stop.stopped() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        info!(peer = %peer, path = %self.inner.path.display(), "Sending file");

        let mut file = File::open(&self.inner.path).await?;
        let mut buf = vec![0u8; self.inner.config.buffer_size.max(1)];
        loop {
            if stop.is_stopped() {
                debug!("Stopping between chunks");
                break;
            }

            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await.map_err(Error::Send)?;
            self.inner.progress.add(n);
        }

        stream.flush().await.map_err(Error::Send)?;
        stream.shutdown().await.map_err(Error::Send)?;
        Ok(())
    }
}

/// Downloads one file from a [`FileTransferServer`]
#[derive(Clone)]
pub struct FileTransferClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    path: PathBuf,
    server: SocketAddr,
    config: TransferConfig,
    progress: Progress,
    events: EventChannel,
    lifecycle: Lifecycle,
}

impl FileTransferClient {
    /// `total_bytes` is the expected size if the peer announced it; without
    /// it the percentage stays 0 until the transfer is done.
    pub fn new(path: impl AsRef<Path>, server: SocketAddr, total_bytes: Option<u64>) -> Self {
        Self::with_config(path, server, total_bytes, TransferConfig::default())
    }

    pub fn with_config(
        path: impl AsRef<Path>,
        server: SocketAddr,
        total_bytes: Option<u64>,
        config: TransferConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                path: path.as_ref().to_path_buf(),
                server,
                config,
                progress: Progress::new(total_bytes),
                events: EventChannel::new(),
                lifecycle: Lifecycle::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn server(&self) -> SocketAddr {
        self.inner.server
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.inner.progress.total
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.inner.progress.transferred()
    }

    pub fn percentage(&self) -> u8 {
        self.inner.progress.percentage()
    }

    pub fn is_done(&self) -> bool {
        self.inner.progress.is_done()
    }

    /// Stop after the chunk currently in flight
    pub fn cancel(&self) {
        info!(path = %self.inner.path.display(), "Download cancelled");
        self.inner.progress.mark_done();
        self.inner.lifecycle.stop();
    }

    pub fn events(&self) -> &EventChannel {
        &self.inner.events
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.inner.events.subscribe(subscriber);
    }

    pub fn state(&self) -> LoopState {
        self.inner.lifecycle.state()
    }

    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    /// Connect and copy until the server closes the connection
    pub async fn run(&self) -> Result<()> {
        let mut stop = self.inner.lifecycle.start()?;
        let outcome = self.fetch(&mut stop).await;
        finish(
            &self.inner.progress,
            &self.inner.events,
            &self.inner.lifecycle,
            outcome,
        );
        Ok(())
    }

    async fn fetch(&self, stop: &mut StopSignal) -> Result<()> {
        let server = self.inner.server;
        let mut stream = tokio::select! {
            _ = stop.stopped() => return Ok(()),
            connected = TcpStream::connect(server) => connected.map_err(|source| Error::Connect {
                addr: server.to_string(),
                source,
            })?,
        };
        info!(server = %server, path = %self.inner.path.display(), "Receiving file");

        let mut writer = BufWriter::new(File::create(&self.inner.path).await?);
        let mut buf = vec![0u8; self.inner.config.buffer_size.max(1)];
        loop {
            if stop.is_stopped() {
                debug!("Stopping between chunks");
                break;
            }

            let n = tokio::select! {
                _ = stop.stopped() => break,
                read = stream.read(&mut buf) => read.map_err(Error::Read)?,
            };
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            self.inner.progress.add(n);
        }

        writer.flush().await?;
        Ok(())
    }
}

/// Report the end of a session: error first (if any), then completion
fn finish(progress: &Progress, events: &EventChannel, lifecycle: &Lifecycle, outcome: Result<()>) {
    if let Err(e) = outcome {
        error!(error = %e, "File transfer failed");
        events.publish(Event::error(e));
    }

    progress.mark_done();
    let transferred = progress.transferred();
    info!(bytes = transferred, "File transfer finished");
    events.publish(Event::transfer_complete(format!(
        "{} bytes transferred",
        transferred
    )));
    lifecycle.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Collector, EventKind};
    use crate::testing::wait_until;
    use std::time::Duration;
    use tempfile::TempDir;

    fn loopback(addr: SocketAddr) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    }

    fn sample_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn transfer(len: usize, announce_size: bool) {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.bin");
        let dest = dir.path().join("dest.bin");
        let data = sample_bytes(len);
        std::fs::write(&source, &data).unwrap();

        let server = FileTransferServer::bind(&source, 0).await.unwrap();
        assert_eq!(server.total_bytes(), len as u64);
        assert_eq!(server.percentage(), 0);
        let server_events = Collector::new();
        server.subscribe(server_events.clone());
        server.spawn();

        let size = announce_size.then_some(len as u64);
        let client = FileTransferClient::new(&dest, loopback(server.local_addr()), size);
        let client_events = Collector::new();
        client.subscribe(client_events.clone());
        assert_eq!(client.percentage(), 0);
        client.spawn();

        assert!(wait_until(Duration::from_secs(5), || client.is_done() && server.is_done()).await);

        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(server.percentage(), 100);
        assert_eq!(client.percentage(), 100);
        assert_eq!(server.transferred_bytes(), len as u64);
        assert_eq!(client.transferred_bytes(), len as u64);

        for events in [&server_events, &client_events] {
            assert!(wait_until(Duration::from_secs(1), || events.count(EventKind::FileTransferComplete) == 1).await);
            assert_eq!(events.count(EventKind::Error), 0);
        }
    }

    #[tokio::test]
    async fn test_transfer_is_byte_identical() {
        transfer(100_000, true).await;
    }

    #[tokio::test]
    async fn test_transfer_with_unknown_size() {
        transfer(20_000, false).await;
    }

    #[tokio::test]
    async fn test_transfer_empty_file() {
        transfer(0, true).await;
    }

    #[tokio::test]
    async fn test_missing_source_file() {
        let dir = TempDir::new().unwrap();
        let result = FileTransferServer::bind(dir.path().join("nope"), 0).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_error_then_completion() {
        let dir = TempDir::new().unwrap();
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let client = FileTransferClient::new(dir.path().join("out"), addr, None);
        let events = Collector::new();
        client.subscribe(events.clone());
        client.run().await.unwrap();

        let kinds: Vec<EventKind> = events.events().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![EventKind::Error, EventKind::FileTransferComplete]);
        assert!(client.is_done());
        assert_eq!(client.percentage(), 100);
        assert!(matches!(client.run().await, Err(Error::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_peer() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, sample_bytes(1024)).unwrap();

        let server = FileTransferServer::bind(&source, 0).await.unwrap();
        let events = Collector::new();
        server.subscribe(events.clone());
        let handle = server.spawn();

        server.cancel();
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(server.is_done());
        assert_eq!(server.transferred_bytes(), 0);
        assert_eq!(events.count(EventKind::FileTransferComplete), 1);
        assert_eq!(events.count(EventKind::Error), 0);
    }

    #[test]
    fn test_percentage_truncates() {
        let progress = Progress::new(Some(3));
        progress.add(1);
        assert_eq!(progress.percentage(), 33);
        progress.add(1);
        assert_eq!(progress.percentage(), 66);
        progress.add(1);
        // Every byte counted, but the session has not finished yet
        assert_eq!(progress.percentage(), 99);
        progress.mark_done();
        assert_eq!(progress.percentage(), 100);

        let unknown = Progress::new(None);
        unknown.add(500);
        assert_eq!(unknown.percentage(), 0);
        unknown.mark_done();
        assert_eq!(unknown.percentage(), 100);
    }

    #[test]
    fn test_percentage_clamped_when_total_understated() {
        let progress = Progress::new(Some(10));
        progress.add(25);
        assert_eq!(progress.percentage(), 99);
        assert!(!progress.is_done());
        progress.mark_done();
        assert_eq!(progress.percentage(), 100);
    }
}
