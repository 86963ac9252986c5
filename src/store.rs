//! Persistence of the bound sensor address and the unlock counter.
//!
//! Both values belong to one sensor. The state records that sensor's uid
//! and is emptied when a different sensor is bound.

use std::path::{Path, PathBuf};

use btleplug::api::BDAddr;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::UID_LEN;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    /// Hex uid of the sensor the other fields belong to.
    pub sensor_uid: Option<String>,
    /// Stored as text so the file stays readable.
    pub known_address: Option<String>,
    pub unlock_counter: Option<u16>,
}

impl PersistedState {
    pub fn belongs_to(&self, uid: &[u8; UID_LEN]) -> bool {
        self.sensor_uid.as_deref() == Some(hex::encode(uid).as_str())
    }

    /// Claims the state for `uid`, dropping values kept for another sensor.
    /// Returns whether anything changed.
    fn rebind(&mut self, uid: &[u8; UID_LEN]) -> bool {
        if self.belongs_to(uid) {
            return false;
        }
        if self.known_address.is_some() || self.unlock_counter.is_some() {
            info!(previous = self.sensor_uid.as_deref(), "stored state belongs to another sensor, dropping it");
        }
        *self = PersistedState {
            sensor_uid: Some(hex::encode(uid)),
            ..PersistedState::default()
        };
        true
    }

    pub fn known_address(&self) -> Option<BDAddr> {
        let text = self.known_address.as_deref()?;
        match text.parse() {
            Ok(address) => Some(address),
            Err(error) => {
                warn!(%text, %error, "ignoring unparsable sensor address");
                None
            }
        }
    }
}

pub trait StateStore: Send {
    fn load(&self) -> Result<PersistedState>;
    fn bind_sensor(&mut self, uid: &[u8; UID_LEN]) -> Result<()>;
    fn save_known_address(&mut self, address: Option<BDAddr>) -> Result<()>;
    fn save_unlock_counter(&mut self, counter: u16) -> Result<()>;
}

/// Keeps state in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: PersistedState,
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<PersistedState> {
        Ok(self.state.clone())
    }

    fn bind_sensor(&mut self, uid: &[u8; UID_LEN]) -> Result<()> {
        self.state.rebind(uid);
        Ok(())
    }

    fn save_known_address(&mut self, address: Option<BDAddr>) -> Result<()> {
        self.state.known_address = address.map(|a| a.to_string());
        Ok(())
    }

    fn save_unlock_counter(&mut self, counter: u16) -> Result<()> {
        self.state.unlock_counter = Some(counter);
        Ok(())
    }
}

/// A JSON file rewritten on every change. A missing file reads as empty.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: PersistedState,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = read_state(&path)?;
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.state)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn read_state(path: &Path) -> Result<PersistedState> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
        Err(e) => Err(e.into()),
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<PersistedState> {
        Ok(self.state.clone())
    }

    fn bind_sensor(&mut self, uid: &[u8; UID_LEN]) -> Result<()> {
        if self.state.rebind(uid) {
            self.write()?;
        }
        Ok(())
    }

    fn save_known_address(&mut self, address: Option<BDAddr>) -> Result<()> {
        self.state.known_address = address.map(|a| a.to_string());
        self.write()
    }

    fn save_unlock_counter(&mut self, counter: u16) -> Result<()> {
        self.state.unlock_counter = Some(counter);
        self.write()
    }
}
