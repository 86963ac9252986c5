//! The sensor link as a state machine.
//!
//! Nothing here touches the radio. Every input is a command or a BLE event
//! and every output is a [`LinkOutput`] the runtime carries out: radio
//! commands, timer requests, state changes and decoded samples. Timers are
//! tokened so a late firing after a cancel or re-arm does nothing.

use std::fmt;
use std::time::Instant;

use btleplug::api::BDAddr;
use tracing::{debug, info, warn};

use crate::arbitration::LinkNotice;
use crate::config::LinkConfig;
use crate::crypto::{self, UID_LEN};
use crate::error::{CommandError, CryptoError, LinkError};
use crate::glucose::{self, GlucoseSample};
use crate::identity::SensorIdentity;
use crate::peripheral::{Advertisement, CandidateSet, SensorMatcher, Verdict};
use crate::reassembly::{Frame, ReassemblyBuffer};
use crate::timer::{TimerKind, TimerRequest, TimerToken, Timers};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
    /// Wants the sensor but the peer holds it.
    WaitingForPeer,
    /// Resting state after a failure. Accepts a new scan like `Idle`.
    Error(LinkError),
}

impl LinkState {
    /// States from which a new scan may be started.
    pub fn is_resting(&self) -> bool {
        matches!(self, LinkState::Idle | LinkState::Error(_))
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Idle => f.write_str("idle"),
            LinkState::Scanning => f.write_str("scanning"),
            LinkState::Connecting => f.write_str("connecting"),
            LinkState::Connected => f.write_str("connected"),
            LinkState::Disconnecting => f.write_str("disconnecting"),
            LinkState::WaitingForPeer => f.write_str("waiting for peer"),
            LinkState::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// Only peripherals advertising the sensor service.
    Filtered,
    /// Everything in range, duplicates included.
    Broad,
}

/// Radio work for the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleCommand {
    /// Look up a previously bound peripheral; answered with `KnownPeripheral`.
    RetrieveKnown(BDAddr),
    StartScan(ScanKind),
    StopScan,
    Connect(BDAddr),
    DiscoverServices(BDAddr),
    Write { address: BDAddr, payload: Vec<u8> },
    Subscribe(BDAddr),
    /// Also cancels a pending connect.
    Disconnect(BDAddr),
}

/// What the radio reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    PoweredOn,
    PoweredOff,
    /// The adapter refused to start a scan.
    ScanFailed { reason: String },
    /// `None` when the system no longer knows the address.
    KnownPeripheral { address: BDAddr, connected: Option<bool> },
    Discovered(Advertisement),
    Connected(BDAddr),
    ConnectFailed { address: BDAddr, reason: String },
    /// `has_sensor_service` requires the service and both characteristics.
    ServicesDiscovered { address: BDAddr, has_sensor_service: bool },
    Subscribed(BDAddr),
    /// The unlock write or the subscription of a bound sensor failed.
    SetupFailed { address: BDAddr, reason: String },
    Notification { address: BDAddr, value: Vec<u8> },
    Disconnected(BDAddr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutput {
    Ble(BleCommand),
    Timer(TimerRequest),
    State(LinkState),
    Notice(LinkNotice),
    Sample(GlucoseSample),
    Error(LinkError),
    /// `None` forgets the bound peripheral.
    PersistKnownAddress(Option<BDAddr>),
    PersistUnlockCounter(u16),
    /// Stored state now belongs to this sensor uid; anything kept for
    /// another sensor is dropped.
    PersistSensor([u8; UID_LEN]),
}

#[derive(Debug)]
pub struct LinkMachine {
    config: LinkConfig,
    state: LinkState,
    identity: Option<SensorIdentity>,
    matcher: SensorMatcher,
    known_address: Option<BDAddr>,
    /// The peripheral being connected or bound.
    target: Option<BDAddr>,
    /// The current connect is a reconnect to `known_address`.
    reconnecting: bool,
    known_tried: bool,
    subscribed: bool,
    scan_active: bool,
    scan_attempts: u32,
    peer_holds_link: bool,
    candidates: CandidateSet,
    reassembly: ReassemblyBuffer,
    timers: Timers,
    out: Vec<LinkOutput>,
}

impl LinkMachine {
    pub fn new(config: LinkConfig, identity: Option<SensorIdentity>, known_address: Option<BDAddr>) -> Self {
        let serial = identity.as_ref().map(SensorIdentity::serial).unwrap_or_default();
        let matcher = SensorMatcher::new(serial, config.min_candidate_rssi);
        let reassembly = ReassemblyBuffer::new(config.reassembly_timeout);
        Self {
            config,
            state: LinkState::Idle,
            identity,
            matcher,
            known_address,
            target: None,
            reconnecting: false,
            known_tried: false,
            subscribed: false,
            scan_active: false,
            scan_attempts: 0,
            peer_holds_link: false,
            candidates: CandidateSet::default(),
            reassembly,
            timers: Timers::default(),
            out: Vec::new(),
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn identity(&self) -> Option<&SensorIdentity> {
        self.identity.as_ref()
    }

    pub fn known_address(&self) -> Option<BDAddr> {
        self.known_address
    }

    /// Kept in sync with the arbiter; gates every scan attempt.
    pub fn set_peer_holds_link(&mut self, held: bool) {
        self.peer_holds_link = held;
    }

    /// Replaces the identity. A different sensor invalidates the bound address.
    pub fn set_identity(&mut self, identity: SensorIdentity) -> Vec<LinkOutput> {
        let changed = self.identity.as_ref().map_or(true, |held| !held.same_sensor(&identity));
        if changed {
            info!(serial = identity.serial(), "new sensor identity");
            self.known_address = None;
            self.out.push(LinkOutput::PersistSensor(*identity.uid()));
        }
        self.matcher = SensorMatcher::new(identity.serial(), self.config.min_candidate_rssi);
        self.identity = Some(identity);
        self.flush()
    }

    pub fn start_scanning(&mut self) -> Result<Vec<LinkOutput>, CommandError> {
        if !self.state.is_resting() {
            return Err(CommandError::NotIdle(self.state.clone()));
        }
        info!(serial = self.identity.as_ref().map(SensorIdentity::serial), "start scanning");
        self.scan_attempts = 0;
        self.known_tried = false;
        self.notice(LinkNotice::Acquiring);
        self.begin_attempt();
        Ok(self.flush())
    }

    /// Tears everything down. Safe to call in any state, any number of times.
    pub fn disconnect(&mut self) -> Vec<LinkOutput> {
        match self.state {
            LinkState::Disconnecting => {}
            LinkState::Connecting | LinkState::Connected => {
                self.halt_acquisition();
                self.cancel_timer(TimerKind::Reassembly);
                match self.target {
                    Some(address) => {
                        info!(%address, "disconnecting");
                        self.command(BleCommand::Disconnect(address));
                        self.set_state(LinkState::Disconnecting);
                    }
                    None => self.settle_idle(),
                }
            }
            LinkState::Scanning | LinkState::WaitingForPeer => {
                self.halt_acquisition();
                self.settle_idle();
            }
            LinkState::Idle | LinkState::Error(_) => self.set_state(LinkState::Idle),
        }
        self.flush()
    }

    /// The peer took the link while we were acquiring. Keeps the attempt
    /// alive so a lost grant still ends in a retry.
    pub fn suspend(&mut self) -> Vec<LinkOutput> {
        if matches!(self.state, LinkState::Scanning | LinkState::Connecting) {
            info!("suspending for peer");
            self.halt_acquisition();
            self.arm(TimerKind::Scan, self.config.scan_timeout);
            self.set_state(LinkState::WaitingForPeer);
        }
        self.flush()
    }

    pub fn resume(&mut self) -> Vec<LinkOutput> {
        if self.state == LinkState::WaitingForPeer && !self.peer_holds_link {
            info!("peer released the link, resuming");
            self.cancel_timer(TimerKind::ScanBackoff);
            self.begin_attempt();
        }
        self.flush()
    }

    /// The peer holds the sensor; give up acquiring without reporting a failure.
    pub fn stand_down(&mut self) -> Vec<LinkOutput> {
        if matches!(
            self.state,
            LinkState::Scanning | LinkState::Connecting | LinkState::WaitingForPeer
        ) {
            info!("standing down, peer holds the sensor");
            self.halt_acquisition();
            self.timers_cancel_all();
            self.set_state(LinkState::Idle);
        }
        self.flush()
    }

    pub fn on_timer(&mut self, kind: TimerKind, token: TimerToken) -> Vec<LinkOutput> {
        if !self.timers.fire(kind, token) {
            debug!(?kind, "stale timer");
            return Vec::new();
        }
        match kind {
            TimerKind::Scan => self.scan_timed_out(),
            TimerKind::BroadScan => {
                if self.state == LinkState::Scanning && self.scan_active {
                    debug!("widening scan");
                    self.command(BleCommand::StartScan(ScanKind::Broad));
                }
            }
            TimerKind::ScanBackoff => {
                if matches!(self.state, LinkState::Scanning | LinkState::WaitingForPeer) {
                    self.begin_attempt();
                }
            }
            TimerKind::Connect => self.connect_timed_out(),
            TimerKind::Reassembly => {
                if !self.reassembly.is_empty() {
                    debug!(bytes = self.reassembly.len(), "dropping partial frame");
                }
                self.reassembly.reset();
            }
        }
        self.flush()
    }

    pub fn on_ble(&mut self, event: BleEvent, now: Instant) -> Vec<LinkOutput> {
        match event {
            BleEvent::PoweredOn => {
                if self.state == LinkState::Error(LinkError::BluetoothUnavailable) {
                    self.set_state(LinkState::Idle);
                }
            }
            BleEvent::PoweredOff => self.powered_off(),
            BleEvent::ScanFailed { reason } => {
                if self.state == LinkState::Scanning {
                    self.scan_active = false;
                    self.fail(LinkError::ScanFailed(reason));
                }
            }
            BleEvent::KnownPeripheral { address, connected } => self.known_peripheral(address, connected),
            BleEvent::Discovered(adv) => self.discovered(&adv),
            BleEvent::Connected(address) => self.connected(address),
            BleEvent::ConnectFailed { address, reason } => self.connect_failed(address, reason),
            BleEvent::ServicesDiscovered {
                address,
                has_sensor_service,
            } => self.services_discovered(address, has_sensor_service),
            BleEvent::Subscribed(address) => {
                if self.is_bound(address) {
                    debug!(%address, "subscribed to sensor data");
                    self.subscribed = true;
                    self.reassembly.reset();
                }
            }
            BleEvent::SetupFailed { address, reason } => {
                if self.is_bound(address) {
                    self.fail(LinkError::ConnectionFailed(reason));
                }
            }
            BleEvent::Notification { address, value } => self.notification(address, &value, now),
            BleEvent::Disconnected(address) => self.disconnected(address),
        }
        self.flush()
    }

    fn begin_attempt(&mut self) {
        self.reassembly.reset();
        self.arm(TimerKind::Scan, self.config.scan_timeout);
        if self.peer_holds_link {
            info!("peer holds the link, asking for it");
            self.set_state(LinkState::WaitingForPeer);
            self.notice(LinkNotice::AwaitingPeer);
            return;
        }
        self.set_state(LinkState::Scanning);
        match self.known_address {
            Some(address) if !self.known_tried => {
                self.known_tried = true;
                debug!(%address, "looking up known sensor");
                self.command(BleCommand::RetrieveKnown(address));
            }
            _ => self.start_filtered_scan(),
        }
    }

    fn start_filtered_scan(&mut self) {
        self.command(BleCommand::StartScan(ScanKind::Filtered));
        self.scan_active = true;
        self.arm(TimerKind::BroadScan, self.config.broad_scan_delay);
    }

    fn stop_scan(&mut self) {
        if std::mem::take(&mut self.scan_active) {
            self.command(BleCommand::StopScan);
        }
        self.cancel_timer(TimerKind::BroadScan);
    }

    fn drop_candidates(&mut self) {
        for address in self.candidates.drain() {
            debug!(%address, "dropping candidate");
            self.command(BleCommand::Disconnect(address));
        }
    }

    /// Stops scanning, candidates and any in-flight connect.
    fn halt_acquisition(&mut self) {
        self.stop_scan();
        self.drop_candidates();
        self.cancel_timer(TimerKind::Connect);
        if self.state == LinkState::Connecting {
            if let Some(address) = self.target.take() {
                self.command(BleCommand::Disconnect(address));
            }
        }
        self.reconnecting = false;
    }

    fn settle_idle(&mut self) {
        let was_active = !self.state.is_resting();
        self.timers_cancel_all();
        self.target = None;
        self.subscribed = false;
        self.reassembly.reset();
        self.set_state(LinkState::Idle);
        if was_active {
            self.notice(LinkNotice::Released);
        }
    }

    fn fail(&mut self, error: LinkError) {
        warn!(%error, "link failed");
        self.halt_acquisition();
        if let Some(address) = self.target.take() {
            self.command(BleCommand::Disconnect(address));
        }
        self.timers_cancel_all();
        self.subscribed = false;
        self.reassembly.reset();
        self.set_state(LinkState::Error(error.clone()));
        self.out.push(LinkOutput::Error(error));
        self.notice(LinkNotice::Failed);
    }

    /// Back to scanning after the known peripheral could not be used.
    fn fall_back_to_scan(&mut self) {
        debug!("known sensor unavailable, scanning");
        self.cancel_timer(TimerKind::Connect);
        self.reconnecting = false;
        self.target = None;
        self.set_state(LinkState::Scanning);
        if !self.timers.is_armed(TimerKind::Scan) {
            self.arm(TimerKind::Scan, self.config.scan_timeout);
        }
        self.start_filtered_scan();
    }

    fn scan_timed_out(&mut self) {
        if !matches!(self.state, LinkState::Scanning | LinkState::WaitingForPeer) {
            return;
        }
        self.scan_attempts += 1;
        self.stop_scan();
        self.drop_candidates();
        if self.scan_attempts >= self.config.scan_attempts {
            info!(attempts = self.scan_attempts, "giving up on scan");
            self.timers_cancel_all();
            self.set_state(LinkState::Idle);
            self.out.push(LinkOutput::Error(LinkError::ScanTimeout));
            self.notice(LinkNotice::Failed);
        } else {
            info!(attempt = self.scan_attempts, "scan timed out, retrying");
            self.arm(TimerKind::ScanBackoff, self.config.scan_retry_backoff);
        }
    }

    fn connect_timed_out(&mut self) {
        if self.state != LinkState::Connecting {
            return;
        }
        if self.reconnecting {
            if let Some(address) = self.target {
                self.command(BleCommand::Disconnect(address));
            }
            self.fall_back_to_scan();
        } else {
            self.fail(LinkError::ConnectionTimeout);
        }
    }

    fn powered_off(&mut self) {
        warn!("bluetooth powered off");
        let was_bound = self.state == LinkState::Connected;
        let was_active = !self.state.is_resting();
        // the radio is gone, so nothing is left to stop or disconnect
        self.timers_cancel_all();
        self.candidates.drain();
        self.scan_active = false;
        self.target = None;
        self.reconnecting = false;
        self.subscribed = false;
        self.reassembly.reset();
        self.set_state(LinkState::Error(LinkError::BluetoothUnavailable));
        self.out.push(LinkOutput::Error(LinkError::BluetoothUnavailable));
        if was_bound {
            self.notice(LinkNotice::Released);
        } else if was_active {
            self.notice(LinkNotice::Failed);
        }
    }

    fn known_peripheral(&mut self, address: BDAddr, connected: Option<bool>) {
        if self.state != LinkState::Scanning || self.known_address != Some(address) || self.scan_active {
            return;
        }
        match connected {
            Some(false) => {
                info!(%address, "reconnecting to known sensor");
                self.target = Some(address);
                self.reconnecting = true;
                self.set_state(LinkState::Connecting);
                self.command(BleCommand::Connect(address));
                self.arm(TimerKind::Connect, self.config.connect_timeout);
            }
            _ => self.start_filtered_scan(),
        }
    }

    fn discovered(&mut self, adv: &Advertisement) {
        if self.state != LinkState::Scanning {
            return;
        }
        let address = adv.address;
        if self.candidates.contains(&address) {
            return;
        }
        match self.matcher.classify(adv) {
            Verdict::Confirmed(kind) => {
                info!(%address, ?kind, name = adv.local_name.as_deref(), "found sensor");
                self.stop_scan();
                self.cancel_timer(TimerKind::Scan);
                self.target = Some(address);
                self.reconnecting = false;
                self.set_state(LinkState::Connecting);
                self.command(BleCommand::Connect(address));
                self.arm(TimerKind::Connect, self.config.connect_timeout);
            }
            Verdict::Tentative => {
                if self.candidates.try_insert(address) {
                    debug!(%address, rssi = adv.rssi, "trying candidate");
                    self.command(BleCommand::Connect(address));
                }
            }
            Verdict::Ignore => {}
        }
    }

    fn connected(&mut self, address: BDAddr) {
        if self.state == LinkState::Connecting && self.target == Some(address) {
            debug!(%address, "connected, discovering services");
            self.command(BleCommand::DiscoverServices(address));
        } else if self.candidates.contains(&address) {
            self.command(BleCommand::DiscoverServices(address));
        } else if self.target != Some(address) {
            debug!(%address, "unexpected connection, dropping");
            self.command(BleCommand::Disconnect(address));
        }
    }

    fn connect_failed(&mut self, address: BDAddr, reason: String) {
        if self.candidates.contains(&address) {
            debug!(%address, %reason, "candidate connect failed");
            self.candidates.reject(&address);
            return;
        }
        if self.state != LinkState::Connecting || self.target != Some(address) {
            return;
        }
        if self.reconnecting {
            self.fall_back_to_scan();
        } else {
            self.fail(LinkError::ConnectionFailed(reason));
        }
    }

    fn services_discovered(&mut self, address: BDAddr, has_sensor_service: bool) {
        if self.candidates.contains(&address) {
            if has_sensor_service && self.state == LinkState::Scanning {
                info!(%address, "candidate is the sensor");
                self.candidates.confirm(&address);
                self.target = Some(address);
                self.set_state(LinkState::Connecting);
                self.bind(address);
            } else {
                debug!(%address, "candidate rejected");
                self.candidates.reject(&address);
                self.command(BleCommand::Disconnect(address));
            }
            return;
        }
        if self.state != LinkState::Connecting || self.target != Some(address) {
            return;
        }
        if has_sensor_service {
            self.bind(address);
        } else {
            warn!(%address, "peripheral lacks the sensor service");
            self.command(BleCommand::Disconnect(address));
            self.candidates.reject(&address);
            self.fall_back_to_scan();
        }
    }

    /// The peripheral is the sensor: unlock it and start streaming.
    fn bind(&mut self, address: BDAddr) {
        self.stop_scan();
        self.drop_candidates();
        for kind in [TimerKind::Scan, TimerKind::ScanBackoff, TimerKind::Connect] {
            self.cancel_timer(kind);
        }
        self.reconnecting = false;
        self.scan_attempts = 0;
        if self.known_address != Some(address) {
            self.known_address = Some(address);
            self.out.push(LinkOutput::PersistKnownAddress(Some(address)));
        }
        self.send_unlock(address);
        self.subscribed = false;
        self.reassembly.reset();
        self.command(BleCommand::Subscribe(address));
        self.set_state(LinkState::Connected);
        self.notice(LinkNotice::Established);
    }

    fn send_unlock(&mut self, address: BDAddr) {
        let Some(identity) = self.identity.as_mut() else {
            warn!(%address, "no sensor identity, cannot unlock streaming");
            self.out.push(LinkOutput::Error(LinkError::MissingSensorIdentity));
            return;
        };
        let counter = identity.next_unlock_counter();
        self.out.push(LinkOutput::PersistUnlockCounter(counter));
        match crypto::unlock_payload(identity, counter) {
            Ok(payload) => {
                debug!(%address, counter, "sending unlock");
                self.command(BleCommand::Write {
                    address,
                    payload: payload.to_vec(),
                });
            }
            Err(error) => {
                warn!(%error, "cannot build unlock payload");
                self.out.push(LinkOutput::Error(error));
            }
        }
    }

    fn is_bound(&self, address: BDAddr) -> bool {
        self.state == LinkState::Connected && self.target == Some(address)
    }

    fn notification(&mut self, address: BDAddr, value: &[u8], now: Instant) {
        if !self.is_bound(address) || !self.subscribed {
            return;
        }
        let frames = self.reassembly.append(value, now);
        if self.reassembly.is_empty() {
            self.cancel_timer(TimerKind::Reassembly);
        } else {
            self.arm(TimerKind::Reassembly, self.reassembly.timeout());
        }
        for frame in frames {
            self.process_frame(&frame);
        }
    }

    fn process_frame(&mut self, frame: &Frame) {
        let Some(identity) = self.identity.as_ref() else {
            debug!("frame dropped, no sensor identity");
            return;
        };
        match crypto::decrypt(identity.uid(), frame) {
            Ok(plaintext) => match glucose::decode(&plaintext) {
                Ok(sample) => {
                    debug!(glucose = sample.current_glucose_raw(), age = sample.sensor_age_minutes(), "sample");
                    self.out.push(LinkOutput::Sample(sample));
                }
                Err(error) => debug!(%error, "undecodable frame"),
            },
            Err(error @ CryptoError::Integrity { .. }) => {
                debug!(%error, "dropping frame");
                self.reassembly.reset();
                self.cancel_timer(TimerKind::Reassembly);
                self.out.push(LinkOutput::Error(LinkError::IntegrityError));
            }
            Err(error) => debug!(%error, "dropping frame"),
        }
    }

    fn disconnected(&mut self, address: BDAddr) {
        if self.candidates.contains(&address) {
            self.candidates.reject(&address);
            return;
        }
        if self.target != Some(address) {
            return;
        }
        match self.state {
            LinkState::Connecting if self.reconnecting => self.fall_back_to_scan(),
            LinkState::Connecting => self.fail(LinkError::ConnectionFailed(
                "disconnected during setup".to_owned(),
            )),
            LinkState::Connected | LinkState::Disconnecting => {
                info!(%address, "sensor disconnected");
                self.settle_idle();
            }
            _ => self.target = None,
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "link state");
            self.state = state.clone();
            self.out.push(LinkOutput::State(state));
        }
    }

    fn notice(&mut self, notice: LinkNotice) {
        self.out.push(LinkOutput::Notice(notice));
    }

    fn command(&mut self, command: BleCommand) {
        self.out.push(LinkOutput::Ble(command));
    }

    fn arm(&mut self, kind: TimerKind, after: std::time::Duration) {
        let request = self.timers.arm(kind, after);
        self.out.push(LinkOutput::Timer(request));
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some(request) = self.timers.cancel(kind) {
            self.out.push(LinkOutput::Timer(request));
        }
    }

    fn timers_cancel_all(&mut self) {
        let requests = self.timers.cancel_all();
        self.out.extend(requests.into_iter().map(LinkOutput::Timer));
    }

    fn flush(&mut self) -> Vec<LinkOutput> {
        std::mem::take(&mut self.out)
    }
}
