//! Network error types

use std::io;
use std::net::SocketAddr;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    Send(#[source] io::Error),

    #[error("Read failed: {0}")]
    Read(#[source] io::Error),

    #[error("Timed out")]
    Timeout,

    #[error("Already started")]
    AlreadyStarted,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error ends the loop that produced it.
    ///
    /// Only a receive timeout is recoverable; everything else stops the
    /// owning component.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_not_fatal() {
        assert!(!Error::Timeout.is_fatal());
        assert!(Error::NotConnected.is_fatal());
        assert!(Error::Read(io::Error::from(io::ErrorKind::ConnectionReset)).is_fatal());
    }

    #[test]
    fn test_bind_error_mentions_address() {
        let addr: SocketAddr = "0.0.0.0:4242".parse().unwrap();
        let err = Error::Bind {
            addr,
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("0.0.0.0:4242"));
    }
}
