//! Receive glucose readings from a FreeStyle Libre 2 sensor over BLE.
//!
//! The protocol core ([`crypto`], [`glucose`], [`reassembly`]) and the
//! connection logic ([`link`], [`arbitration`], [`session`]) are plain
//! synchronous code. [`driver`] runs a session on a btleplug adapter.

pub mod arbitration;
pub mod config;
pub mod crypto;
pub mod driver;
pub mod error;
pub mod glucose;
pub mod identity;
pub mod link;
pub mod peer;
pub mod peripheral;
pub mod reassembly;
pub mod session;
pub mod store;
pub mod timer;

pub use error::{CommandError, CryptoError, DecodeError, Error, LinkError, Result};
pub use glucose::{GlucoseReading, GlucoseSample};
pub use identity::SensorIdentity;
pub use link::LinkState;
pub use session::{CoreEvent, Session};
