//! Murmur Network Library
//!
//! LAN messaging, discovery and file transfer, reported through one event
//! stream.
//!
//! # Architecture
//!
//! - **Connection**: one TCP socket with a receive loop that frames text
//!   messages on the `<msg>` delimiter
//! - **ConnectionManager**: accepts many connections and sends to one or all
//! - **Beacons**: UDP datagrams for announcing and finding peers
//! - **File transfer**: one file over one TCP connection, end of stream = end of file
//!
//! Every component owns an [`EventChannel`]; subscribers are called on the
//! component's own task, in subscription order.
//!
//! # Usage
//!
//! ```ignore
//! // Host accepts peers
//! let hub = ConnectionManager::listen(DEFAULT_COMMUNICATION_PORT).await?;
//! hub.subscribe(Arc::new(LogSubscriber));
//! hub.spawn();
//!
//! // Peer connects and talks
//! let peer = Connection::open(addr).await?;
//! peer.subscribe(Arc::new(|event: &Event| println!("{}", event.content())));
//! peer.spawn();
//! peer.send("<msg>hello").await?;
//!
//! hub.broadcast("<msg>welcome").await;
//! ```

use std::time::Duration;

pub mod beacon;
pub mod connection;
pub mod error;
pub mod event;
pub mod frame;
mod lifecycle;
pub mod manager;
pub mod transfer;

pub use beacon::{BeaconConfig, BeaconReceiver, BeaconSender, BeaconSenderAndReceiver};
pub use connection::{resolve, Connection, ConnectionConfig, ConnectionId};
pub use error::{Error, Result};
pub use event::{Collector, Event, EventChannel, EventKind, LogSubscriber, Subscriber};
pub use frame::MESSAGE_DELIMITER;
pub use lifecycle::LoopState;
pub use manager::ConnectionManager;
pub use transfer::{FileTransferClient, FileTransferServer, TransferConfig};

/// Default UDP port for beacons
pub const DEFAULT_BEACON_PORT: u16 = 4242;

/// Default time between two beacons
pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// Default upper bound on a single beacon receive
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default size of the beacon receive buffer
pub const DEFAULT_DATAGRAM_BUFFER_SIZE: usize = 4096;

/// Default TCP port for the message hub
pub const DEFAULT_COMMUNICATION_PORT: u16 = 7070;

/// Default number of bytes read per receive on a connection
pub const DEFAULT_COMMUNICATION_BUFFER_SIZE: usize = 4096;

/// Default TCP port for file transfers
pub const DEFAULT_TRANSFER_PORT: u16 = 7071;

/// Default chunk size for file transfers
pub const DEFAULT_TRANSFER_BUFFER_SIZE: usize = 8192;
