//! TOML configuration. Every field has a default, so an empty file is valid.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::arbitration::PriorityMode;
use crate::error::Result;
use crate::identity::SensorIdentity;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub arbitration: ArbitrationConfig,
    pub peer: PeerConfig,
    pub sensor: Option<SensorIdentity>,
    /// Where the known sensor address and unlock counter are kept.
    pub state_file: Option<PathBuf>,
}

/// Timeouts and retry policy of the BLE link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    #[serde(with = "humantime_serde")]
    pub scan_timeout: Duration,
    /// Timeout cycles before a scan is given up.
    pub scan_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub scan_retry_backoff: Duration,
    /// Delay before the filtered scan is widened to an unfiltered one.
    #[serde(with = "humantime_serde")]
    pub broad_scan_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reassembly_timeout: Duration,
    /// Weakest signal still worth a tentative connection.
    pub min_candidate_rssi: i16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(60),
            scan_attempts: 3,
            scan_retry_backoff: Duration::from_secs(2),
            broad_scan_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            reassembly_timeout: Duration::from_secs(3),
            min_candidate_rssi: -80,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    pub mode: PriorityMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub listen: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}
