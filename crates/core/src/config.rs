//! Settings file and environment overrides
//!
//! Loading order: built-in defaults, then the first config file that exists
//! (`$MURMUR_CONFIG`, then `murmur.toml` in the platform config directory),
//! then `MURMUR_*_PORT` environment variables.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use murmur_net::{
    BeaconConfig, ConnectionConfig, TransferConfig, DEFAULT_BEACON_PORT,
    DEFAULT_COMMUNICATION_BUFFER_SIZE, DEFAULT_COMMUNICATION_PORT, DEFAULT_DATAGRAM_BUFFER_SIZE,
    DEFAULT_RECEIVE_TIMEOUT, DEFAULT_RESEND_INTERVAL, DEFAULT_TRANSFER_BUFFER_SIZE,
    DEFAULT_TRANSFER_PORT,
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "MURMUR_CONFIG";
pub const BEACON_PORT_ENV: &str = "MURMUR_BEACON_PORT";
pub const COMMUNICATION_PORT_ENV: &str = "MURMUR_COMMUNICATION_PORT";
pub const TRANSFER_PORT_ENV: &str = "MURMUR_TRANSFER_PORT";

const CONFIG_FILE_NAME: &str = "murmur.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub beacon: BeaconSettings,
    pub communication: CommunicationSettings,
    pub transfer: TransferSettings,
}

/// `[beacon]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BeaconSettings {
    pub port: u16,
    pub broadcast_address: IpAddr,
    pub resend_interval_ms: u64,
    pub receive_timeout_ms: u64,
    pub datagram_buffer_bytes: usize,
}

impl Default for BeaconSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_BEACON_PORT,
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            resend_interval_ms: DEFAULT_RESEND_INTERVAL.as_millis() as u64,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT.as_millis() as u64,
            datagram_buffer_bytes: DEFAULT_DATAGRAM_BUFFER_SIZE,
        }
    }
}

/// `[communication]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommunicationSettings {
    pub port: u16,
    pub buffer_size: usize,
}

impl Default for CommunicationSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_COMMUNICATION_PORT,
            buffer_size: DEFAULT_COMMUNICATION_BUFFER_SIZE,
        }
    }
}

/// `[transfer]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferSettings {
    pub port: u16,
    pub buffer_size: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_TRANSFER_PORT,
            buffer_size: DEFAULT_TRANSFER_BUFFER_SIZE,
        }
    }
}

impl Settings {
    /// Defaults, then the first config file found, then environment overrides
    pub fn load() -> Result<Self> {
        let mut settings = match Self::find_config_file() {
            Some(path) => Self::load_from(&path)?,
            None => {
                tracing::debug!("No config file found, using defaults");
                Self::default()
            }
        };
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Load one file without looking at the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&text).map_err(|source| Error::Config {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;

        tracing::info!(path = %path.display(), "Loaded config");
        Ok(settings)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Default location of the config file for this platform
    pub fn default_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "murmur", "murmur").ok_or(Error::NoConfigDir)?;
        Ok(dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    fn find_config_file() -> Option<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(explicit) = std::env::var_os(CONFIG_ENV) {
            candidates.push(PathBuf::from(explicit));
        }
        match Self::default_path() {
            Ok(path) => candidates.push(path),
            Err(e) => tracing::debug!(error = %e, "Skipping platform config file"),
        }
        candidates.into_iter().find(|path| path.is_file())
    }

    /// Replace ports with values from `lookup`; unparseable values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let ports = [
            (BEACON_PORT_ENV, &mut self.beacon.port),
            (COMMUNICATION_PORT_ENV, &mut self.communication.port),
            (TRANSFER_PORT_ENV, &mut self.transfer.port),
        ];
        for (key, port) in ports {
            let Some(value) = lookup(key) else {
                continue;
            };
            match value.trim().parse::<u16>() {
                Ok(parsed) => *port = parsed,
                Err(e) => tracing::warn!(key, value = %value, error = %e, "Ignoring invalid port override"),
            }
        }
    }

    /// Buffer sizes and beacon intervals must be non-zero
    pub fn validate(&self) -> Result<()> {
        let values = [
            ("beacon.resend_interval_ms", self.beacon.resend_interval_ms),
            ("beacon.receive_timeout_ms", self.beacon.receive_timeout_ms),
            ("beacon.datagram_buffer_bytes", self.beacon.datagram_buffer_bytes as u64),
            ("communication.buffer_size", self.communication.buffer_size as u64),
            ("transfer.buffer_size", self.transfer.buffer_size as u64),
        ];
        for (key, value) in values {
            if value == 0 {
                return Err(Error::InvalidSetting {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Beacon runtime config carrying `message` as the initial payload
    pub fn beacon_config(&self, message: impl Into<String>) -> BeaconConfig {
        BeaconConfig::new(self.beacon.broadcast_address, self.beacon.port)
            .with_message(message)
            .with_resend_interval(Duration::from_millis(self.beacon.resend_interval_ms))
            .with_receive_timeout(Duration::from_millis(self.beacon.receive_timeout_ms))
            .with_datagram_buffer_bytes(self.beacon.datagram_buffer_bytes)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            buffer_size: self.communication.buffer_size,
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            buffer_size: self.transfer.buffer_size,
        }
    }
}
