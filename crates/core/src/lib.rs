//! Murmur Core
//!
//! Settings and file helpers shared by the murmur front ends. The network
//! layer lives in `murmur-net`; this crate turns a config file into the
//! runtime configs it expects.

pub mod config;
pub mod error;
pub mod util;

pub use config::{BeaconSettings, CommunicationSettings, Settings, TransferSettings};
pub use error::{Error, Result};
pub use util::{file_checksum, file_name, readable_file_size};
