//! One sensor session: the link machine and the arbiter behind a single
//! input queue.
//!
//! The runtime feeds [`Input`]s in arrival order and carries out the
//! returned [`Effect`]s. Everything in here is synchronous and owns its
//! state, so a session never needs a lock.

use std::time::Instant;

use btleplug::api::BDAddr;
use tracing::{debug, warn};

use crate::arbitration::{ArbiterAction, Arbiter, ArbitrationMessage, ArbitrationState, PriorityMode};
use crate::config::LinkConfig;
use crate::crypto::UID_LEN;
use crate::error::{CommandError, LinkError};
use crate::glucose::GlucoseSample;
use crate::identity::SensorIdentity;
use crate::link::{BleCommand, BleEvent, LinkMachine, LinkOutput, LinkState};
use crate::timer::{TimerKind, TimerRequest, TimerToken};

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    StartScanning,
    Disconnect,
    Ble(BleEvent),
    Peer(ArbitrationMessage),
    Timer(TimerKind, TimerToken),
    SetIdentity(SensorIdentity),
    SetUiActive(bool),
    SetPriorityMode(PriorityMode),
}

/// What the presentation layer observes.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Sample(GlucoseSample),
    LinkState(LinkState),
    ArbitrationState(ArbitrationState),
    Error(LinkError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Ble(BleCommand),
    Timer(TimerRequest),
    Peer(ArbitrationMessage),
    Emit(CoreEvent),
    PersistKnownAddress(Option<BDAddr>),
    PersistUnlockCounter(u16),
    PersistSensor([u8; UID_LEN]),
}

#[derive(Debug)]
pub struct Session {
    link: LinkMachine,
    arbiter: Arbiter,
}

impl Session {
    pub fn new(
        config: LinkConfig,
        mode: PriorityMode,
        identity: Option<SensorIdentity>,
        known_address: Option<BDAddr>,
    ) -> Self {
        Self {
            link: LinkMachine::new(config, identity, known_address),
            arbiter: Arbiter::new(mode),
        }
    }

    pub fn link_state(&self) -> &LinkState {
        self.link.state()
    }

    pub fn arbitration_state(&self) -> ArbitrationState {
        self.arbiter.state()
    }

    pub fn identity(&self) -> Option<&SensorIdentity> {
        self.link.identity()
    }

    pub fn start_scanning(&mut self) -> Result<Vec<Effect>, CommandError> {
        let before = self.arbiter.state();
        self.sync_gate();
        let outputs = self.link.start_scanning()?;
        let mut effects = Vec::new();
        self.route(outputs, &mut effects);
        self.report_arbitration(before, &mut effects);
        Ok(effects)
    }

    /// Applies one input. Commands that are illegal in the current state
    /// are logged and dropped.
    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Effect> {
        if input == Input::StartScanning {
            return self.start_scanning().unwrap_or_else(|error| {
                warn!(%error, "start scanning rejected");
                Vec::new()
            });
        }

        let before = self.arbiter.state();
        let mut effects = Vec::new();
        match input {
            Input::StartScanning => {}
            Input::Disconnect => {
                let outputs = self.link.disconnect();
                self.route(outputs, &mut effects);
            }
            Input::Ble(event) => {
                let outputs = self.link.on_ble(event, now);
                self.route(outputs, &mut effects);
            }
            Input::Timer(kind, token) => {
                let outputs = self.link.on_timer(kind, token);
                self.route(outputs, &mut effects);
            }
            Input::Peer(msg) => {
                let actions = self.arbiter.on_peer_message(msg, self.link.state());
                self.apply(actions, &mut effects);
            }
            Input::SetIdentity(identity) => {
                let outputs = self.link.set_identity(identity);
                self.route(outputs, &mut effects);
            }
            Input::SetUiActive(active) => {
                debug!(active, "ui activity");
                self.arbiter.set_ui_active(active);
            }
            Input::SetPriorityMode(mode) => {
                debug!(?mode, "priority mode");
                self.arbiter.set_mode(mode);
            }
        }
        self.report_arbitration(before, &mut effects);
        effects
    }

    fn sync_gate(&mut self) {
        self.link.set_peer_holds_link(self.arbiter.peer_holds_link());
    }

    fn route(&mut self, outputs: Vec<LinkOutput>, effects: &mut Vec<Effect>) {
        for output in outputs {
            match output {
                LinkOutput::Ble(command) => effects.push(Effect::Ble(command)),
                LinkOutput::Timer(request) => effects.push(Effect::Timer(request)),
                LinkOutput::State(state) => effects.push(Effect::Emit(CoreEvent::LinkState(state))),
                LinkOutput::Sample(sample) => effects.push(Effect::Emit(CoreEvent::Sample(sample))),
                LinkOutput::Error(error) => effects.push(Effect::Emit(CoreEvent::Error(error))),
                LinkOutput::PersistKnownAddress(address) => effects.push(Effect::PersistKnownAddress(address)),
                LinkOutput::PersistUnlockCounter(counter) => effects.push(Effect::PersistUnlockCounter(counter)),
                LinkOutput::PersistSensor(uid) => effects.push(Effect::PersistSensor(uid)),
                LinkOutput::Notice(notice) => {
                    let actions = self.arbiter.on_link_notice(notice);
                    self.apply(actions, effects);
                }
            }
        }
    }

    fn apply(&mut self, actions: Vec<ArbiterAction>, effects: &mut Vec<Effect>) {
        self.sync_gate();
        for action in actions {
            let outputs = match action {
                ArbiterAction::Send(msg) => {
                    effects.push(Effect::Peer(msg));
                    continue;
                }
                ArbiterAction::DisconnectLocal => self.link.disconnect(),
                ArbiterAction::Suspend => self.link.suspend(),
                ArbiterAction::Resume => self.link.resume(),
                ArbiterAction::StandDown => self.link.stand_down(),
            };
            self.route(outputs, effects);
        }
    }

    fn report_arbitration(&self, before: ArbitrationState, effects: &mut Vec<Effect>) {
        let after = self.arbiter.state();
        if after != before {
            effects.push(Effect::Emit(CoreEvent::ArbitrationState(after)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ScanKind;

    fn peer_messages(effects: &[Effect]) -> Vec<ArbitrationMessage> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Peer(m) => Some(*m),
                _ => None,
            })
            .collect()
    }

    fn session(mode: PriorityMode) -> Session {
        let identity = SensorIdentity::new([0; 8], vec![0; 6], "3MH00ABCDEF", 0);
        Session::new(LinkConfig::default(), mode, Some(identity), None)
    }

    #[test]
    fn scanning_announces_to_peer() {
        let mut session = session(PriorityMode::Auto);
        let effects = session.handle(Input::StartScanning, Instant::now());
        assert_eq!(peer_messages(&effects), vec![ArbitrationMessage::LocalConnecting]);
        assert!(effects.contains(&Effect::Ble(BleCommand::StartScan(ScanKind::Filtered))));
        assert!(effects.contains(&Effect::Emit(CoreEvent::LinkState(LinkState::Scanning))));
        assert!(effects.contains(&Effect::Emit(CoreEvent::ArbitrationState(
            ArbitrationState::Transitioning
        ))));
    }

    #[test]
    fn illegal_start_is_dropped() {
        let mut session = session(PriorityMode::Auto);
        session.handle(Input::StartScanning, Instant::now());
        assert!(session.handle(Input::StartScanning, Instant::now()).is_empty());
        assert!(session.start_scanning().is_err());
    }

    #[test]
    fn peer_owned_link_gates_scan() {
        let mut session = session(PriorityMode::PeerAlwaysPriority);
        let now = Instant::now();
        session.handle(Input::Peer(ArbitrationMessage::LocalConnected), now);
        assert_eq!(session.arbitration_state(), ArbitrationState::PeerOwnsLink);

        let effects = session.handle(Input::StartScanning, now);
        assert_eq!(session.link_state(), &LinkState::WaitingForPeer);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Ble(_))));
        assert_eq!(
            peer_messages(&effects),
            vec![
                ArbitrationMessage::LocalConnecting,
                ArbitrationMessage::PeerRequestingConnection
            ]
        );

        let effects = session.handle(Input::Peer(ArbitrationMessage::LocalDisconnected), now);
        assert_eq!(session.link_state(), &LinkState::Scanning);
        assert!(effects.contains(&Effect::Ble(BleCommand::StartScan(ScanKind::Filtered))));
    }

    #[test]
    fn peer_request_while_scanning_without_priority() {
        let mut session = session(PriorityMode::PeerAlwaysPriority);
        let now = Instant::now();
        session.handle(Input::StartScanning, now);
        let effects = session.handle(Input::Peer(ArbitrationMessage::PeerRequestingConnection), now);
        assert_eq!(session.link_state(), &LinkState::WaitingForPeer);
        assert!(effects.contains(&Effect::Ble(BleCommand::StopScan)));
        assert_eq!(peer_messages(&effects), vec![ArbitrationMessage::LocalDisconnected]);
    }

    #[test]
    fn ui_activity_changes_priority() {
        let mut session = session(PriorityMode::Auto);
        let now = Instant::now();
        session.handle(Input::SetUiActive(true), now);
        session.handle(Input::StartScanning, now);
        let effects = session.handle(Input::Peer(ArbitrationMessage::PeerRequestingConnection), now);
        assert_eq!(peer_messages(&effects), vec![ArbitrationMessage::LocalWantsToConnect]);
        assert_eq!(session.link_state(), &LinkState::Scanning);
    }
}
