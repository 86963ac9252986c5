//! Decides whether this device or its peer may hold the sensor link.
//!
//! Both devices run the same policy on their own facts, so no round of
//! agreement is needed. Messages are best effort and may be lost, duplicated
//! or reordered; handling is idempotent and what the local link is doing
//! right now always beats what the peer last said. Lost messages are covered
//! by the link's own scan and connect timeouts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::link::LinkState;

/// Wire messages between the two devices, named from the sender's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArbitrationMessage {
    PeerRequestingConnection,
    LocalWantsToConnect,
    LocalDisconnecting,
    LocalDisconnected,
    LocalConnecting,
    LocalConnected,
    LocalConnectionFailed,
    LocalPriority,
}

impl ArbitrationMessage {
    pub const ALL: [ArbitrationMessage; 8] = [
        ArbitrationMessage::PeerRequestingConnection,
        ArbitrationMessage::LocalWantsToConnect,
        ArbitrationMessage::LocalDisconnecting,
        ArbitrationMessage::LocalDisconnected,
        ArbitrationMessage::LocalConnecting,
        ArbitrationMessage::LocalConnected,
        ArbitrationMessage::LocalConnectionFailed,
        ArbitrationMessage::LocalPriority,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArbitrationMessage::PeerRequestingConnection => "peerRequestingConnection",
            ArbitrationMessage::LocalWantsToConnect => "localWantsToConnect",
            ArbitrationMessage::LocalDisconnecting => "localDisconnecting",
            ArbitrationMessage::LocalDisconnected => "localDisconnected",
            ArbitrationMessage::LocalConnecting => "localConnecting",
            ArbitrationMessage::LocalConnected => "localConnected",
            ArbitrationMessage::LocalConnectionFailed => "localConnectionFailed",
            ArbitrationMessage::LocalPriority => "localPriority",
        }
    }
}

impl fmt::Display for ArbitrationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown arbitration message {0:?}")]
pub struct UnknownMessage(pub String);

impl FromStr for ArbitrationMessage {
    type Err = UnknownMessage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArbitrationMessage::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMessage(s.to_owned()))
    }
}

/// Which device gets the sensor when both want it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorityMode {
    #[serde(rename = "local-always")]
    LocalAlwaysPriority,
    #[serde(rename = "peer-always")]
    PeerAlwaysPriority,
    /// Priority follows whether the local UI is in the foreground.
    #[default]
    #[serde(rename = "auto")]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationState {
    PeerOwnsLink,
    LocalOwnsLink,
    LocalDisconnected,
    Transitioning,
}

impl fmt::Display for ArbitrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArbitrationState::PeerOwnsLink => "peer owns link",
            ArbitrationState::LocalOwnsLink => "local owns link",
            ArbitrationState::LocalDisconnected => "local disconnected",
            ArbitrationState::Transitioning => "transitioning",
        };
        f.write_str(s)
    }
}

/// Lifecycle facts the link reports to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkNotice {
    /// Started looking for the sensor.
    Acquiring,
    /// Wants to scan but the peer holds the link.
    AwaitingPeer,
    Established,
    Released,
    Failed,
}

/// What the coordinator wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterAction {
    Send(ArbitrationMessage),
    /// Tear down the local connection so the peer can take over.
    DisconnectLocal,
    /// Stop scanning or connecting and wait for the peer.
    Suspend,
    /// The peer let go; continue acquiring.
    Resume,
    /// The peer has the sensor; stop trying.
    StandDown,
}

#[derive(Debug)]
pub struct Arbiter {
    mode: PriorityMode,
    ui_active: bool,
    state: ArbitrationState,
    /// Local disconnect started on the peer's behalf.
    yielding: bool,
    /// We asked the peer to let go and have no answer yet.
    awaiting_grant: bool,
}

impl Arbiter {
    pub fn new(mode: PriorityMode) -> Self {
        Self {
            mode,
            ui_active: false,
            state: ArbitrationState::LocalDisconnected,
            yielding: false,
            awaiting_grant: false,
        }
    }

    pub fn state(&self) -> ArbitrationState {
        self.state
    }

    pub fn mode(&self) -> PriorityMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: PriorityMode) {
        self.mode = mode;
    }

    pub fn set_ui_active(&mut self, active: bool) {
        self.ui_active = active;
    }

    pub fn peer_holds_link(&self) -> bool {
        self.state == ArbitrationState::PeerOwnsLink
    }

    pub fn local_has_priority(&self) -> bool {
        match self.mode {
            PriorityMode::LocalAlwaysPriority => true,
            PriorityMode::PeerAlwaysPriority => false,
            PriorityMode::Auto => self.ui_active,
        }
    }

    fn set_state(&mut self, state: ArbitrationState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "arbitration state");
            self.state = state;
        }
    }

    pub fn on_peer_message(&mut self, msg: ArbitrationMessage, link: &LinkState) -> Vec<ArbiterAction> {
        info!(%msg, %link, "peer message");
        match msg {
            ArbitrationMessage::PeerRequestingConnection => self.peer_wants_link(link),
            ArbitrationMessage::LocalConnecting | ArbitrationMessage::LocalConnected => {
                self.peer_claimed(msg, link)
            }
            ArbitrationMessage::LocalWantsToConnect => self.peer_insists(link),
            ArbitrationMessage::LocalDisconnecting => {
                if self.awaiting_grant {
                    self.set_state(ArbitrationState::Transitioning);
                }
                Vec::new()
            }
            ArbitrationMessage::LocalDisconnected
            | ArbitrationMessage::LocalConnectionFailed
            | ArbitrationMessage::LocalPriority => self.peer_released(link),
        }
    }

    pub fn on_link_notice(&mut self, notice: LinkNotice) -> Vec<ArbiterAction> {
        match notice {
            LinkNotice::Acquiring => {
                if self.state != ArbitrationState::PeerOwnsLink {
                    self.set_state(ArbitrationState::Transitioning);
                }
                vec![ArbiterAction::Send(ArbitrationMessage::LocalConnecting)]
            }
            LinkNotice::AwaitingPeer => {
                self.awaiting_grant = true;
                vec![ArbiterAction::Send(ArbitrationMessage::PeerRequestingConnection)]
            }
            LinkNotice::Established => {
                self.awaiting_grant = false;
                self.set_state(ArbitrationState::LocalOwnsLink);
                vec![ArbiterAction::Send(ArbitrationMessage::LocalConnected)]
            }
            LinkNotice::Released => {
                if std::mem::take(&mut self.yielding) {
                    self.set_state(ArbitrationState::PeerOwnsLink);
                } else if self.state != ArbitrationState::PeerOwnsLink {
                    self.set_state(ArbitrationState::LocalDisconnected);
                }
                vec![ArbiterAction::Send(ArbitrationMessage::LocalDisconnected)]
            }
            LinkNotice::Failed => {
                self.awaiting_grant = false;
                if self.state != ArbitrationState::PeerOwnsLink {
                    self.set_state(ArbitrationState::LocalDisconnected);
                }
                vec![ArbiterAction::Send(ArbitrationMessage::LocalConnectionFailed)]
            }
        }
    }

    fn peer_wants_link(&mut self, link: &LinkState) -> Vec<ArbiterAction> {
        let priority = self.local_has_priority();
        match link {
            LinkState::Connected if priority => {
                self.set_state(ArbitrationState::LocalOwnsLink);
                vec![ArbiterAction::Send(ArbitrationMessage::LocalWantsToConnect)]
            }
            LinkState::Connected | LinkState::Disconnecting => self.begin_yield(link),
            LinkState::Scanning | LinkState::Connecting | LinkState::WaitingForPeer => {
                if priority {
                    vec![ArbiterAction::Send(ArbitrationMessage::LocalWantsToConnect)]
                } else {
                    self.awaiting_grant = false;
                    self.set_state(ArbitrationState::PeerOwnsLink);
                    vec![
                        ArbiterAction::Suspend,
                        ArbiterAction::Send(ArbitrationMessage::LocalDisconnected),
                    ]
                }
            }
            LinkState::Idle | LinkState::Error(_) => {
                self.set_state(ArbitrationState::PeerOwnsLink);
                let reply = if priority {
                    ArbitrationMessage::LocalPriority
                } else {
                    ArbitrationMessage::LocalDisconnected
                };
                vec![ArbiterAction::Send(reply)]
            }
        }
    }

    /// Starts handing the link over. Repeated requests during the handover are no-ops.
    fn begin_yield(&mut self, link: &LinkState) -> Vec<ArbiterAction> {
        if self.yielding {
            return Vec::new();
        }
        self.yielding = true;
        self.set_state(ArbitrationState::Transitioning);
        let mut actions = Vec::new();
        if *link == LinkState::Connected {
            actions.push(ArbiterAction::DisconnectLocal);
        }
        actions.push(ArbiterAction::Send(ArbitrationMessage::LocalDisconnecting));
        actions
    }

    fn peer_claimed(&mut self, msg: ArbitrationMessage, link: &LinkState) -> Vec<ArbiterAction> {
        match link {
            LinkState::Connected | LinkState::Disconnecting => self.peer_wants_link(link),
            LinkState::Scanning | LinkState::Connecting | LinkState::WaitingForPeer => {
                if self.local_has_priority() {
                    vec![ArbiterAction::Send(ArbitrationMessage::LocalWantsToConnect)]
                } else {
                    self.awaiting_grant = false;
                    self.set_state(ArbitrationState::PeerOwnsLink);
                    if msg == ArbitrationMessage::LocalConnected {
                        vec![ArbiterAction::StandDown]
                    } else {
                        vec![ArbiterAction::Suspend]
                    }
                }
            }
            // only a finished connection makes the peer the owner
            LinkState::Idle | LinkState::Error(_) => {
                if msg == ArbitrationMessage::LocalConnected {
                    self.set_state(ArbitrationState::PeerOwnsLink);
                }
                Vec::new()
            }
        }
    }

    /// The peer refuses to yield. It does not hold the sensor unless it
    /// said `localConnected`, so a side with priority keeps acquiring and
    /// the sensor itself settles a race between two such sides.
    fn peer_insists(&mut self, link: &LinkState) -> Vec<ArbiterAction> {
        match link {
            LinkState::Connected if self.local_has_priority() => {
                debug!("peer insists but local is connected with priority");
                Vec::new()
            }
            LinkState::Connected | LinkState::Disconnecting => self.begin_yield(link),
            LinkState::Scanning | LinkState::Connecting if self.local_has_priority() => {
                debug!("peer insists but local is acquiring with priority");
                Vec::new()
            }
            LinkState::Scanning | LinkState::Connecting => {
                self.awaiting_grant = false;
                self.set_state(ArbitrationState::LocalDisconnected);
                vec![ArbiterAction::StandDown]
            }
            // already yielded; the peer keeps its turn
            LinkState::WaitingForPeer => {
                self.awaiting_grant = false;
                vec![ArbiterAction::StandDown]
            }
            LinkState::Idle | LinkState::Error(_) => Vec::new(),
        }
    }

    fn peer_released(&mut self, link: &LinkState) -> Vec<ArbiterAction> {
        let was_waiting = std::mem::take(&mut self.awaiting_grant);
        match link {
            LinkState::Connected => {
                self.set_state(ArbitrationState::LocalOwnsLink);
                Vec::new()
            }
            _ if self.yielding => Vec::new(),
            LinkState::WaitingForPeer => {
                self.set_state(ArbitrationState::LocalDisconnected);
                vec![ArbiterAction::Resume]
            }
            LinkState::Scanning | LinkState::Connecting => {
                self.set_state(ArbitrationState::Transitioning);
                Vec::new()
            }
            _ => {
                if was_waiting {
                    debug!("peer released the link after the local attempt ended");
                }
                self.set_state(ArbitrationState::LocalDisconnected);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use ArbitrationMessage::*;

    const ALL_STATES: [ArbitrationState; 4] = [
        ArbitrationState::PeerOwnsLink,
        ArbitrationState::LocalOwnsLink,
        ArbitrationState::LocalDisconnected,
        ArbitrationState::Transitioning,
    ];

    fn sends(actions: &[ArbiterAction]) -> Vec<ArbitrationMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                ArbiterAction::Send(m) => Some(*m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn wire_names_round_trip() {
        for msg in ArbitrationMessage::ALL {
            assert_eq!(msg.as_str().parse::<ArbitrationMessage>(), Ok(msg));
            assert_eq!(serde_json::to_string(&msg).unwrap(), format!("\"{}\"", msg.as_str()));
        }
        assert!("watchConnected".parse::<ArbitrationMessage>().is_err());
    }

    #[test]
    fn local_priority_keeps_connection_in_every_state() {
        for state in ALL_STATES {
            for yielding in [false, true] {
                let mut arbiter = Arbiter::new(PriorityMode::LocalAlwaysPriority);
                arbiter.state = state;
                arbiter.yielding = yielding;
                for _ in 0..2 {
                    let actions = arbiter.on_peer_message(PeerRequestingConnection, &LinkState::Connected);
                    assert_eq!(actions, vec![ArbiterAction::Send(LocalWantsToConnect)], "from {state}");
                }
                assert_eq!(arbiter.state(), ArbitrationState::LocalOwnsLink);
            }
        }
    }

    #[test]
    fn peer_priority_disconnects_exactly_once() {
        let mut arbiter = Arbiter::new(PriorityMode::PeerAlwaysPriority);
        arbiter.on_link_notice(LinkNotice::Established);

        let first = arbiter.on_peer_message(PeerRequestingConnection, &LinkState::Connected);
        assert_eq!(
            first,
            vec![ArbiterAction::DisconnectLocal, ArbiterAction::Send(LocalDisconnecting)]
        );
        assert_eq!(arbiter.state(), ArbitrationState::Transitioning);

        // duplicate delivery, before and after the disconnect started
        assert!(arbiter.on_peer_message(PeerRequestingConnection, &LinkState::Connected).is_empty());
        assert!(arbiter.on_peer_message(PeerRequestingConnection, &LinkState::Disconnecting).is_empty());

        let released = arbiter.on_link_notice(LinkNotice::Released);
        assert_eq!(sends(&released), vec![LocalDisconnected]);
        assert_eq!(arbiter.state(), ArbitrationState::PeerOwnsLink);
        assert!(arbiter.peer_holds_link());
    }

    #[test]
    fn auto_mode_follows_ui() {
        let mut arbiter = Arbiter::new(PriorityMode::Auto);
        arbiter.set_ui_active(true);
        assert_eq!(
            arbiter.on_peer_message(PeerRequestingConnection, &LinkState::Connected),
            vec![ArbiterAction::Send(LocalWantsToConnect)]
        );
        arbiter.set_ui_active(false);
        assert_eq!(
            sends(&arbiter.on_peer_message(PeerRequestingConnection, &LinkState::Connected)),
            vec![LocalDisconnecting]
        );
    }

    #[test]
    fn idle_side_grants_by_mode() {
        let mut local = Arbiter::new(PriorityMode::LocalAlwaysPriority);
        assert_eq!(
            local.on_peer_message(PeerRequestingConnection, &LinkState::Idle),
            vec![ArbiterAction::Send(LocalPriority)]
        );
        assert!(local.peer_holds_link());

        let mut peer = Arbiter::new(PriorityMode::PeerAlwaysPriority);
        assert_eq!(
            peer.on_peer_message(PeerRequestingConnection, &LinkState::Error(LinkError::ScanTimeout)),
            vec![ArbiterAction::Send(LocalDisconnected)]
        );
    }

    #[test]
    fn scanning_without_priority_suspends() {
        let mut arbiter = Arbiter::new(PriorityMode::PeerAlwaysPriority);
        assert_eq!(
            arbiter.on_peer_message(PeerRequestingConnection, &LinkState::Scanning),
            vec![ArbiterAction::Suspend, ArbiterAction::Send(LocalDisconnected)]
        );
        assert_eq!(
            arbiter.on_peer_message(LocalConnected, &LinkState::WaitingForPeer),
            vec![ArbiterAction::StandDown]
        );
    }

    #[test]
    fn request_and_grant() {
        let mut arbiter = Arbiter::new(PriorityMode::Auto);
        arbiter.on_peer_message(LocalConnected, &LinkState::Idle);
        assert!(arbiter.peer_holds_link());

        let ask = arbiter.on_link_notice(LinkNotice::AwaitingPeer);
        assert_eq!(sends(&ask), vec![PeerRequestingConnection]);

        assert!(arbiter.on_peer_message(LocalDisconnecting, &LinkState::WaitingForPeer).is_empty());
        assert_eq!(arbiter.state(), ArbitrationState::Transitioning);

        let granted = arbiter.on_peer_message(LocalDisconnected, &LinkState::WaitingForPeer);
        assert_eq!(granted, vec![ArbiterAction::Resume]);
        // duplicate grant after resuming is harmless
        assert!(arbiter.on_peer_message(LocalDisconnected, &LinkState::Scanning).is_empty());
    }

    #[test]
    fn refused_request_stands_down() {
        let mut arbiter = Arbiter::new(PriorityMode::PeerAlwaysPriority);
        arbiter.on_peer_message(LocalConnected, &LinkState::Idle);
        arbiter.on_link_notice(LinkNotice::AwaitingPeer);
        assert_eq!(
            arbiter.on_peer_message(LocalWantsToConnect, &LinkState::WaitingForPeer),
            vec![ArbiterAction::StandDown]
        );
        assert!(arbiter.peer_holds_link());
    }

    #[test]
    fn priority_keeps_acquiring_when_peer_insists() {
        for link in [LinkState::Scanning, LinkState::Connecting] {
            let mut arbiter = Arbiter::new(PriorityMode::LocalAlwaysPriority);
            arbiter.on_link_notice(LinkNotice::Acquiring);
            assert!(arbiter.on_peer_message(LocalWantsToConnect, &link).is_empty(), "while {link}");
            assert!(!arbiter.peer_holds_link());
        }
    }

    #[test]
    fn insisting_peer_is_not_yet_the_owner() {
        let mut arbiter = Arbiter::new(PriorityMode::PeerAlwaysPriority);
        arbiter.on_link_notice(LinkNotice::Acquiring);
        assert_eq!(
            arbiter.on_peer_message(LocalWantsToConnect, &LinkState::Scanning),
            vec![ArbiterAction::StandDown]
        );
        assert_eq!(arbiter.state(), ArbitrationState::LocalDisconnected);
        assert!(arbiter.on_peer_message(LocalWantsToConnect, &LinkState::Idle).is_empty());
        assert!(!arbiter.peer_holds_link());
    }

    #[test]
    fn only_a_finished_connection_claims_the_link() {
        let mut arbiter = Arbiter::new(PriorityMode::Auto);
        assert!(arbiter.on_peer_message(LocalConnecting, &LinkState::Idle).is_empty());
        assert!(!arbiter.peer_holds_link());
        arbiter.on_peer_message(LocalConnected, &LinkState::Idle);
        assert!(arbiter.peer_holds_link());
    }

    #[test]
    fn local_state_beats_stale_peer_report() {
        let mut arbiter = Arbiter::new(PriorityMode::LocalAlwaysPriority);
        arbiter.on_link_notice(LinkNotice::Established);
        // a stale "peer connected" arrives while we hold the link
        assert_eq!(
            arbiter.on_peer_message(LocalConnected, &LinkState::Connected),
            vec![ArbiterAction::Send(LocalWantsToConnect)]
        );
        assert!(arbiter.on_peer_message(LocalDisconnected, &LinkState::Connected).is_empty());
        assert_eq!(arbiter.state(), ArbitrationState::LocalOwnsLink);
    }

    #[test]
    fn lifecycle_notices_are_forwarded() {
        let mut arbiter = Arbiter::new(PriorityMode::Auto);
        assert_eq!(sends(&arbiter.on_link_notice(LinkNotice::Acquiring)), vec![LocalConnecting]);
        assert_eq!(sends(&arbiter.on_link_notice(LinkNotice::Established)), vec![LocalConnected]);
        assert_eq!(sends(&arbiter.on_link_notice(LinkNotice::Released)), vec![LocalDisconnected]);
        assert_eq!(sends(&arbiter.on_link_notice(LinkNotice::Failed)), vec![LocalConnectionFailed]);
        assert_eq!(arbiter.state(), ArbitrationState::LocalDisconnected);
    }
}
