//! Configuration file format.
//!
//! A single JSON document with two optional sections:
//!
//! ```json
//! {
//!   "rekey":  { "rekey_after_time_secs": 120 },
//!   "device": { "listen_port": 51820, "mtu": 1420 }
//! }
//! ```
//!
//! Missing fields fall back to the protocol defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use ferrotun_core::{RekeyConfig, DEFAULT_MTU};

use crate::error::{Error, Result};

/// Handshake messages per second at which the responder starts demanding
/// cookies.
pub const DEFAULT_UNDER_LOAD_THRESHOLD: usize = 4096 / 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// UDP port bound when the interface comes up; 0 picks an ephemeral port.
    pub listen_port: u16,
    pub mtu: i32,
    /// Handshake messages per second before mac2 is required; 0 always requires it.
    pub under_load_threshold: usize,
    /// Hex-encoded static private key.
    pub private_key: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            mtu: DEFAULT_MTU,
            under_load_threshold: DEFAULT_UNDER_LOAD_THRESHOLD,
            private_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rekey: RekeyConfig,
    pub device: DeviceConfig,
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("loading config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.rekey.validate().map_err(Error::config)?;
        if self.device.mtu <= 0 {
            return Err(Error::config(format!("mtu must be positive, got {}", self.device.mtu)));
        }
        if let Some(key) = &self.device.private_key {
            if key.trim().len() != 64 {
                return Err(Error::config("private_key must be 64 hex characters"));
            }
        }
        Ok(())
    }
}
