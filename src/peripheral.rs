//! Advertisement model and the rules for picking the sensor out of a scan.

use std::collections::{HashMap, HashSet};

use btleplug::api::BDAddr;
use uuid::{uuid, Uuid};

use crate::identity::ADVERTISED_NAME_PREFIX;

pub const LIBRE2_SERVICE_UUID: Uuid = uuid!("0000fde3-0000-1000-8000-00805f9b34fb");
pub const LIBRE2_WRITE_CHARACTERISTIC_UUID: Uuid = uuid!("0000f001-0000-1000-8000-00805f9b34fb");
pub const LIBRE2_NOTIFY_CHARACTERISTIC_UUID: Uuid = uuid!("0000f002-0000-1000-8000-00805f9b34fb");

/// Company identifier carried in the sensor's manufacturer data.
pub const VENDOR_COMPANY_ID: u16 = 0x0B6A;

/// What the central reported about one advertising peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub address: BDAddr,
    pub local_name: Option<String>,
    pub services: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub rssi: Option<i16>,
}

impl Advertisement {
    fn name(&self) -> Option<&str> {
        self.local_name.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }
}

/// Why a peripheral was accepted as the sensor without connecting first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    ExactName,
    SerialInName,
    ServiceUuid,
    ManufacturerData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Stop the scan and connect.
    Confirmed(MatchKind),
    /// Connect without stopping the scan and check for the sensor service.
    Tentative,
    Ignore,
}

/// Matching rules for one target sensor.
#[derive(Debug, Clone)]
pub struct SensorMatcher {
    expected_name: String,
    serial: String,
    min_rssi: i16,
}

impl SensorMatcher {
    /// An empty serial disables the name rules.
    pub fn new(serial: &str, min_rssi: i16) -> Self {
        let serial = serial.trim().to_ascii_uppercase();
        let expected_name = if serial.is_empty() {
            String::new()
        } else {
            format!("{ADVERTISED_NAME_PREFIX}{serial}")
        };
        Self {
            expected_name,
            serial,
            min_rssi,
        }
    }

    /// First matching rule wins.
    pub fn classify(&self, adv: &Advertisement) -> Verdict {
        let name = adv.name().map(str::to_ascii_uppercase);

        if let Some(name) = &name {
            if !self.expected_name.is_empty() && *name == self.expected_name {
                return Verdict::Confirmed(MatchKind::ExactName);
            }
            if !self.serial.is_empty() && name.contains(&self.serial) {
                return Verdict::Confirmed(MatchKind::SerialInName);
            }
        }
        if adv.services.contains(&LIBRE2_SERVICE_UUID) {
            return Verdict::Confirmed(MatchKind::ServiceUuid);
        }
        if adv
            .manufacturer_data
            .keys()
            .any(|&id| id == VENDOR_COMPANY_ID || id == VENDOR_COMPANY_ID.swap_bytes())
        {
            return Verdict::Confirmed(MatchKind::ManufacturerData);
        }

        // Many sensors advertise no usable identity at all.
        if name.is_none() {
            return Verdict::Tentative;
        }
        match adv.rssi {
            Some(rssi) if rssi >= self.min_rssi => Verdict::Tentative,
            _ => Verdict::Ignore,
        }
    }
}

/// Peripherals connected on suspicion, waiting for their services to be checked.
#[derive(Debug, Default)]
pub struct CandidateSet {
    pending: HashSet<BDAddr>,
    rejected: HashSet<BDAddr>,
}

impl CandidateSet {
    /// Returns false if the address is already pending or was ruled out this scan.
    pub fn try_insert(&mut self, address: BDAddr) -> bool {
        if self.rejected.contains(&address) {
            return false;
        }
        self.pending.insert(address)
    }

    pub fn contains(&self, address: &BDAddr) -> bool {
        self.pending.contains(address)
    }

    /// The candidate turned out to be the sensor.
    pub fn confirm(&mut self, address: &BDAddr) -> bool {
        self.pending.remove(address)
    }

    /// The candidate is something else; do not try it again until the scan restarts.
    pub fn reject(&mut self, address: &BDAddr) -> bool {
        let removed = self.pending.remove(address);
        self.rejected.insert(*address);
        removed
    }

    /// Empties the set, returning the candidates that still hold a connection.
    pub fn drain(&mut self) -> Vec<BDAddr> {
        self.rejected.clear();
        self.pending.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> SensorMatcher {
        SensorMatcher::new("3MH00ABCDEF", -80)
    }

    fn adv(name: Option<&str>, rssi: Option<i16>) -> Advertisement {
        Advertisement {
            address: BDAddr::from([1, 2, 3, 4, 5, 6]),
            local_name: name.map(str::to_owned),
            rssi,
            ..Default::default()
        }
    }

    #[test]
    fn exact_name_wins() {
        assert_eq!(
            matcher().classify(&adv(Some("ABBOTT3MH00ABCDEF"), None)),
            Verdict::Confirmed(MatchKind::ExactName)
        );
        assert_eq!(
            matcher().classify(&adv(Some("abbott3mh00abcdef"), None)),
            Verdict::Confirmed(MatchKind::ExactName)
        );
    }

    #[test]
    fn serial_substring() {
        assert_eq!(
            matcher().classify(&adv(Some("Libre 3MH00ABCDEF x"), None)),
            Verdict::Confirmed(MatchKind::SerialInName)
        );
    }

    #[test]
    fn service_and_manufacturer() {
        let mut a = adv(Some("Other"), Some(-95));
        a.services.push(LIBRE2_SERVICE_UUID);
        assert_eq!(matcher().classify(&a), Verdict::Confirmed(MatchKind::ServiceUuid));

        let mut b = adv(Some("Other"), Some(-95));
        b.manufacturer_data.insert(VENDOR_COMPANY_ID.swap_bytes(), vec![1, 2]);
        assert_eq!(matcher().classify(&b), Verdict::Confirmed(MatchKind::ManufacturerData));
    }

    #[test]
    fn no_serial_only_uses_advertised_identity() {
        let blind = SensorMatcher::new("", -80);
        assert_eq!(blind.classify(&adv(Some("ABBOTT"), Some(-90))), Verdict::Ignore);
        let mut a = adv(None, None);
        a.services.push(LIBRE2_SERVICE_UUID);
        assert_eq!(blind.classify(&a), Verdict::Confirmed(MatchKind::ServiceUuid));
    }

    #[test]
    fn fallback_candidates() {
        assert_eq!(matcher().classify(&adv(None, Some(-100))), Verdict::Tentative);
        assert_eq!(matcher().classify(&adv(Some("  "), None)), Verdict::Tentative);
        assert_eq!(matcher().classify(&adv(Some("Headphones"), Some(-60))), Verdict::Tentative);
        assert_eq!(matcher().classify(&adv(Some("Headphones"), Some(-90))), Verdict::Ignore);
        assert_eq!(matcher().classify(&adv(Some("Headphones"), None)), Verdict::Ignore);
    }

    #[test]
    fn candidate_lifecycle() {
        let a = BDAddr::from([1, 1, 1, 1, 1, 1]);
        let b = BDAddr::from([2, 2, 2, 2, 2, 2]);
        let mut set = CandidateSet::default();
        assert!(set.try_insert(a));
        assert!(!set.try_insert(a));
        assert!(set.try_insert(b));
        assert!(set.reject(&a));
        assert!(!set.try_insert(a));
        assert_eq!(set.drain(), vec![b]);
        assert!(set.is_empty());
        assert!(set.try_insert(a));
    }
}
