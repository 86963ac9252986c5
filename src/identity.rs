use serde::{Deserialize, Serialize};

use crate::crypto::UID_LEN;
use crate::error::Error;

/// Prefix of the name a Libre 2 advertises, followed by its serial.
pub const ADVERTISED_NAME_PREFIX: &str = "ABBOTT";

/// Unlock code the sensor was enabled with when streaming was activated.
pub const DEFAULT_STREAM_UNLOCK_CODE: u32 = 42;

/// Activation secrets of one sensor, supplied by the NFC activation flow.
///
/// Last value wins: a newer identity replaces the held copy wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorIdentity {
    #[serde(with = "hex::serde")]
    uid: [u8; UID_LEN],
    #[serde(with = "hex::serde")]
    patch_info: Vec<u8>,
    serial: String,
    #[serde(default)]
    unlock_counter: u16,
    #[serde(default = "default_unlock_code")]
    stream_unlock_code: u32,
}

fn default_unlock_code() -> u32 {
    DEFAULT_STREAM_UNLOCK_CODE
}

impl SensorIdentity {
    pub fn new(uid: [u8; UID_LEN], patch_info: Vec<u8>, serial: &str, unlock_counter: u16) -> Self {
        Self {
            uid,
            patch_info,
            serial: serial.to_owned(),
            unlock_counter,
            stream_unlock_code: DEFAULT_STREAM_UNLOCK_CODE,
        }
    }

    /// Parses hex-encoded uid and patch info as handed over on the command line.
    pub fn from_hex(uid: &str, patch_info: &str, serial: &str, unlock_counter: u16) -> Result<Self, Error> {
        let uid_bytes = hex::decode(uid)?;
        let uid: [u8; UID_LEN] = uid_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Identity(format!("uid must be {UID_LEN} bytes, got {}", uid_bytes.len())))?;
        let patch_info = hex::decode(patch_info)?;
        if serial.is_empty() {
            return Err(Error::Identity("serial must not be empty".to_owned()));
        }
        Ok(Self::new(uid, patch_info, serial, unlock_counter))
    }

    pub fn with_stream_unlock_code(mut self, code: u32) -> Self {
        self.stream_unlock_code = code;
        self
    }

    pub fn uid(&self) -> &[u8; UID_LEN] {
        &self.uid
    }

    pub fn patch_info(&self) -> &[u8] {
        &self.patch_info
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn unlock_counter(&self) -> u16 {
        self.unlock_counter
    }

    pub fn stream_unlock_code(&self) -> u32 {
        self.stream_unlock_code
    }

    /// Adopts a counter recorded by an earlier run if it is ahead of ours.
    ///
    /// The counter wraps, so "ahead" means less than half the range forward.
    pub fn restore_unlock_counter(&mut self, counter: u16) {
        let ahead = counter.wrapping_sub(self.unlock_counter);
        if ahead != 0 && ahead < 0x8000 {
            self.unlock_counter = counter;
        }
    }

    /// Bumps the counter for a new unlock attempt and returns the new value.
    pub fn next_unlock_counter(&mut self) -> u16 {
        self.unlock_counter = self.unlock_counter.wrapping_add(1);
        self.unlock_counter
    }

    /// The exact local name the sensor advertises.
    pub fn advertised_name(&self) -> String {
        format!("{ADVERTISED_NAME_PREFIX}{}", self.serial)
    }

    /// Whether two identities describe the same physical sensor.
    pub fn same_sensor(&self, other: &SensorIdentity) -> bool {
        self.uid == other.uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_identity() {
        let identity = SensorIdentity::from_hex("aabbccddeeff0011", "9d0830012c1f", "3MH00ABCDEF", 7).unwrap();
        assert_eq!(identity.uid(), &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11]);
        assert_eq!(identity.patch_info(), &[0x9d, 0x08, 0x30, 0x01, 0x2c, 0x1f]);
        assert_eq!(identity.unlock_counter(), 7);
        assert_eq!(identity.stream_unlock_code(), 42);
        assert_eq!(identity.advertised_name(), "ABBOTT3MH00ABCDEF");
    }

    #[test]
    fn rejects_short_uid() {
        assert!(matches!(
            SensorIdentity::from_hex("aabbcc", "9d0830012c1f", "3MH00ABCDEF", 0),
            Err(Error::Identity(_))
        ));
        assert!(matches!(
            SensorIdentity::from_hex("zz", "", "3MH00ABCDEF", 0),
            Err(Error::Hex(_))
        ));
    }

    #[test]
    fn counter_wraps() {
        let mut identity = SensorIdentity::new([0; 8], vec![0; 6], "X", u16::MAX);
        assert_eq!(identity.next_unlock_counter(), 0);
        assert_eq!(identity.next_unlock_counter(), 1);
    }

    #[test]
    fn restored_counter_never_goes_back() {
        let mut identity = SensorIdentity::new([0; 8], vec![0; 6], "X", 5);
        identity.restore_unlock_counter(3);
        assert_eq!(identity.unlock_counter(), 5);
        identity.restore_unlock_counter(8);
        assert_eq!(identity.next_unlock_counter(), 9);
    }

    #[test]
    fn restored_counter_may_have_wrapped() {
        let mut identity = SensorIdentity::new([0; 8], vec![0; 6], "X", u16::MAX - 1);
        identity.restore_unlock_counter(3);
        assert_eq!(identity.unlock_counter(), 3);
        // a stale value from before the wrap stays behind
        identity.restore_unlock_counter(u16::MAX);
        assert_eq!(identity.unlock_counter(), 3);
    }

    #[test]
    fn serde_uses_hex_fields() {
        let identity = SensorIdentity::new([1, 2, 3, 4, 5, 6, 7, 8], vec![0xAB], "S1", 3);
        let json = serde_json::to_string(&identity).unwrap();
        assert!(json.contains("\"uid\":\"0102030405060708\""));
        let back: SensorIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, identity);
    }
}
