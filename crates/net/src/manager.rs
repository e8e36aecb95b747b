//! TCP hub accepting many connections
//!
//! The manager owns every [`Connection`] it accepts. Each child runs its own
//! receive loop on a separate task and shares the manager's subscribers.
//! Outbound text can go to every child or to the children of one address.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionId};
use crate::error::{Error, Result};
use crate::event::{Event, EventChannel, Subscriber};
use crate::lifecycle::{Lifecycle, LoopState};

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Connection manager handle
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    local_addr: SocketAddr,
    config: ConnectionConfig,
    listener: Mutex<Option<TcpListener>>,
    /// Tracked children in accept order. Never held across an await.
    children: Mutex<Vec<Connection>>,
    events: EventChannel,
    lifecycle: Lifecycle,
}

impl Inner {
    fn remove(&self, ids: &[ConnectionId]) {
        if ids.is_empty() {
            return;
        }
        self.children.lock().retain(|c| !ids.contains(&c.id()));
    }
}

impl ConnectionManager {
    /// Listen on `0.0.0.0:port`. Port 0 picks a free port.
    pub async fn listen(port: u16) -> Result<Self> {
        Self::listen_on(SocketAddr::from(([0, 0, 0, 0], port)), ConnectionConfig::default()).await
    }

    pub async fn listen_on(addr: SocketAddr, config: ConnectionConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Connection manager bound");

        Ok(Self {
            inner: Arc::new(Inner {
                local_addr,
                config,
                listener: Mutex::new(Some(listener)),
                children: Mutex::new(Vec::new()),
                events: EventChannel::new(),
                lifecycle: Lifecycle::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn events(&self) -> &EventChannel {
        &self.inner.events
    }

    pub fn state(&self) -> LoopState {
        self.inner.lifecycle.state()
    }

    /// Register a subscriber on the manager and on every tracked child.
    /// Children accepted later inherit it as well.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        let children = self.inner.children.lock();
        self.inner.events.subscribe(subscriber.clone());
        for child in children.iter() {
            child.subscribe(subscriber.clone());
        }
    }

    /// Remove the first registration of `subscriber` from the manager and
    /// from every tracked child
    pub fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) -> bool {
        let children = self.inner.children.lock();
        for child in children.iter() {
            child.unsubscribe(subscriber);
        }
        self.inner.events.unsubscribe(subscriber)
    }

    /// Snapshot of the tracked children
    pub fn children(&self) -> Vec<Connection> {
        self.inner.children.lock().clone()
    }

    /// Remote addresses of the tracked children, in accept order
    pub fn connections(&self) -> Vec<String> {
        self.inner
            .children
            .lock()
            .iter()
            .map(|c| c.remote_address().to_string())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.children.lock().len()
    }

    /// Send `text` to every tracked child. Children that fail are stopped
    /// and untracked. Returns how many children the text was written to.
    pub async fn broadcast(&self, text: &str) -> usize {
        let targets = self.children();
        self.deliver(targets, text).await
    }

    /// Send `text` to every tracked child whose remote address is `address`.
    /// Returns how many children the text was written to.
    pub async fn send_to(&self, address: &str, text: &str) -> usize {
        let targets: Vec<Connection> = self
            .children()
            .into_iter()
            .filter(|c| c.remote_address() == address)
            .collect();
        if targets.is_empty() {
            debug!(address = %address, "No connection for address");
        }
        self.deliver(targets, text).await
    }

    async fn deliver(&self, targets: Vec<Connection>, text: &str) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for child in &targets {
            match child.send(text).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(peer = %child.peer_addr(), error = %e, "Send failed, dropping connection");
                    child.stop();
                    failed.push(child.id());
                    self.inner.events.publish(Event::error(e));
                }
            }
        }

        self.inner.remove(&failed);
        delivered
    }

    /// Stop and untrack the first child connected from `address`
    pub fn disconnect(&self, address: &str) -> bool {
        let removed = {
            let mut children = self.inner.children.lock();
            children
                .iter()
                .position(|c| c.remote_address() == address)
                .map(|index| children.remove(index))
        };

        match removed {
            Some(child) => {
                info!(peer = %child.peer_addr(), "Disconnecting");
                child.stop();
                true
            }
            None => false,
        }
    }

    /// Request the accept loop to stop. Children are stopped before the
    /// listener is released.
    pub fn stop(&self) {
        if self.inner.lifecycle.stop() {
            info!(addr = %self.inner.local_addr, "Connection manager shutdown initiated");
        }
    }

    /// Start the accept loop on its own task
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run().await })
    }

    /// Accept loop
    pub async fn run(&self) -> Result<()> {
        let mut stop = self.inner.lifecycle.start()?;
        let listener = self.inner.listener.lock().take();
        let Some(listener) = listener else {
            self.inner.lifecycle.close();
            return Err(Error::NotConnected);
        };

        info!(addr = %self.inner.local_addr, "Connection manager running");

        loop {
            if stop.is_stopped() {
                break;
            }

            tokio::select! {
                _ = stop.stopped() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.track(stream, addr),
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        self.inner.events.publish(Event::error(Error::Io(e)));
                        tokio::select! {
                            _ = stop.stopped() => break,
                            _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                        }
                    }
                },
            }
        }

        let children = std::mem::take(&mut *self.inner.children.lock());
        for child in &children {
            child.stop();
        }
        drop(listener);

        self.inner.lifecycle.close();
        info!(addr = %self.inner.local_addr, stopped = children.len(), "Connection manager stopped");
        Ok(())
    }

    /// Wrap an accepted socket, hand it the current subscribers and start it
    fn track(&self, stream: TcpStream, addr: SocketAddr) {
        let connection = match Connection::adopt_with_config(stream, self.inner.config) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(addr = %addr, error = %e, "Could not adopt connection");
                self.inner.events.publish(Event::error(e));
                return;
            }
        };

        {
            let mut children = self.inner.children.lock();
            for subscriber in self.inner.events.subscribers() {
                connection.subscribe(subscriber);
            }
            children.push(connection.clone());
        }

        info!(addr = %addr, id = %connection.id(), "Peer connected");

        let manager: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = connection.run().await {
                debug!(error = %e, "Connection loop did not run");
            }
            if let Some(manager) = manager.upgrade() {
                manager.remove(&[connection.id()]);
            }
            debug!(id = %connection.id(), "Peer untracked");
        });
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local_addr", &self.inner.local_addr)
            .field("children", &self.connection_count())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Collector, EventKind};
    use crate::testing::wait_until;

    struct Client {
        connection: Connection,
        collector: Arc<Collector>,
    }

    async fn connect_client(manager: &ConnectionManager) -> Client {
        let connection = Connection::open_host("127.0.0.1", manager.local_addr().port())
            .await
            .unwrap();
        let collector = Collector::new();
        connection.subscribe(collector.clone());
        connection.spawn();
        Client {
            connection,
            collector,
        }
    }

    async fn manager_with_clients(n: usize) -> (ConnectionManager, Vec<Client>) {
        let manager = ConnectionManager::listen(0).await.unwrap();
        manager.spawn();

        let mut clients = Vec::new();
        for _ in 0..n {
            clients.push(connect_client(&manager).await);
        }
        assert!(wait_until(Duration::from_secs(2), || manager.connection_count() == n).await);
        (manager, clients)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client_once() {
        let (manager, clients) = manager_with_clients(3).await;

        assert_eq!(manager.broadcast("x").await, 3);

        for client in &clients {
            let collector = client.collector.clone();
            assert!(wait_until(Duration::from_secs(2), || collector.count(EventKind::Communication) == 1).await);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        for client in &clients {
            let events = client.collector.of_kind(EventKind::Communication);
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].content(), "x");
        }

        manager.stop();
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_client() {
        let (manager, clients) = manager_with_clients(3).await;

        let closed = &clients[2];
        closed.connection.stop();
        assert!(wait_until(Duration::from_secs(2), || closed.connection.state() == LoopState::Closed).await);
        assert!(wait_until(Duration::from_secs(2), || manager.connection_count() == 2).await);

        assert_eq!(manager.broadcast("x").await, 2);

        for client in &clients[..2] {
            let collector = client.collector.clone();
            assert!(wait_until(Duration::from_secs(2), || collector.count(EventKind::Communication) == 1).await);
        }
        assert_eq!(closed.collector.count(EventKind::Communication), 0);
        assert_eq!(manager.connection_count(), 2);

        manager.stop();
    }

    #[tokio::test]
    async fn test_broadcast_untracks_child_whose_send_fails() {
        let (manager, clients) = manager_with_clients(3).await;
        let collector = Collector::new();
        manager.subscribe(collector.clone());

        // Still tracked, but its write half is gone
        let broken = manager.children()[0].clone();
        broken.release().await;
        assert_eq!(manager.connection_count(), 3);

        assert_eq!(manager.broadcast("x").await, 2);
        assert_eq!(manager.connection_count(), 2);
        assert!(!manager.children().iter().any(|c| c.id() == broken.id()));

        let errors = collector.of_kind(EventKind::Error);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].cause(), Some(Error::NotConnected)));

        assert!(wait_until(Duration::from_secs(2), || {
            clients
                .iter()
                .map(|c| c.collector.count(EventKind::Communication))
                .sum::<usize>()
                == 2
        })
        .await);
        assert!(wait_until(Duration::from_secs(2), || broken.state() == LoopState::Closed).await);

        manager.stop();
    }

    #[tokio::test]
    async fn test_messages_from_clients_reach_manager_subscribers() {
        let manager = ConnectionManager::listen(0).await.unwrap();
        let collector = Collector::new();
        manager.subscribe(collector.clone());
        manager.spawn();

        let client = connect_client(&manager).await;
        assert!(wait_until(Duration::from_secs(2), || manager.connection_count() == 1).await);

        client.connection.send("<msg>hi hub").await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || collector.count(EventKind::Communication) == 1).await);
        assert_eq!(collector.of_kind(EventKind::Communication)[0].content(), "<msg>hi hub");

        manager.stop();
    }

    #[tokio::test]
    async fn test_late_subscription_is_relayed_to_children() {
        let (manager, clients) = manager_with_clients(1).await;

        let collector = Collector::new();
        manager.subscribe(collector.clone());

        clients[0].connection.send("<msg>late").await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || collector.count(EventKind::Communication) == 1).await);

        let subscriber: Arc<dyn Subscriber> = collector.clone();
        assert!(manager.unsubscribe(&subscriber));
        clients[0].connection.send("<msg>ignored").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(collector.count(EventKind::Communication), 1);

        manager.stop();
    }

    #[tokio::test]
    async fn test_send_to_matches_address() {
        let (manager, clients) = manager_with_clients(2).await;

        assert_eq!(manager.send_to("10.255.255.1", "nobody").await, 0);
        assert_eq!(manager.send_to("127.0.0.1", "<msg>both").await, 2);

        for client in &clients {
            let collector = client.collector.clone();
            assert!(wait_until(Duration::from_secs(2), || collector.count(EventKind::Communication) == 1).await);
        }

        manager.stop();
    }

    #[tokio::test]
    async fn test_disconnect_first_match() {
        let (manager, _clients) = manager_with_clients(2).await;

        assert!(manager.disconnect("127.0.0.1"));
        assert_eq!(manager.connection_count(), 1);
        assert!(!manager.disconnect("10.255.255.1"));

        manager.stop();
    }

    #[tokio::test]
    async fn test_stop_propagates_to_children() {
        let (manager, clients) = manager_with_clients(2).await;
        manager.stop();
        assert!(wait_until(Duration::from_millis(600), || manager.state() == LoopState::Closed).await);
        assert_eq!(manager.connection_count(), 0);
        for client in &clients {
            let collector = client.collector.clone();
            assert!(wait_until(Duration::from_secs(2), || collector.count(EventKind::Info) == 1).await);
        }
    }

    #[tokio::test]
    async fn test_bind_in_use() {
        let first = ConnectionManager::listen(0).await.unwrap();
        let port = first.local_addr().port();
        let second = ConnectionManager::listen(port).await;
        assert!(matches!(second, Err(Error::Bind { .. })));
    }
}
