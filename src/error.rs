use thiserror::Error;

use crate::link::LinkState;

/// Failures of the frame decryption path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("sensor uid must be 8 bytes, got {0}")]
    InvalidUid(usize),
    #[error("encrypted frame must be 46 bytes, got {0}")]
    InvalidFrameLength(usize),
    #[error("crc mismatch: frame carries {enclosed:#06x}, computed {computed:#06x}")]
    Integrity { enclosed: u16, computed: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("plaintext must be at least 44 bytes, got {0}")]
    TooShort(usize),
}

/// Errors surfaced to the presentation layer as events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("no sensor found before the scan timed out")]
    ScanTimeout,
    #[error("sensor did not finish connecting in time")]
    ConnectionTimeout,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("cannot start scanning: {0}")]
    ScanFailed(String),
    #[error("bluetooth is unavailable")]
    BluetoothUnavailable,
    #[error("frame failed integrity check")]
    IntegrityError,
    #[error("sensor activation data is missing")]
    MissingSensorIdentity,
}

/// A command was issued in a state that does not accept it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("cannot start scanning while {0}")]
    NotIdle(LinkState),
}

/// Runtime errors of the btleplug driver and the binary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no bluetooth adapter found")]
    NoAdapter,
    #[error("characteristic {0} not found")]
    MissingCharacteristic(uuid::Uuid),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Config(#[from] toml::de::Error),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid state file: {0}")]
    State(#[from] serde_json::Error),
    #[error("invalid sensor identity: {0}")]
    Identity(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
