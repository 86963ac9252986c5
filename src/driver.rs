//! Runs a [`Session`] against a real btleplug adapter.
//!
//! The driver is a single task owning the session. Central events, results
//! of spawned GATT operations, timer firings and API calls all arrive on one
//! mailbox and are applied in order. Observers get [`CoreEvent`]s through a
//! broadcast channel.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use btleplug::api::{BDAddr, Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::arbitration::{ArbitrationMessage, PriorityMode};
use crate::error::{Error, Result};
use crate::identity::SensorIdentity;
use crate::link::{BleCommand, BleEvent, LinkState, ScanKind};
use crate::peer::PeerChannel;
use crate::peripheral::{
    Advertisement, LIBRE2_NOTIFY_CHARACTERISTIC_UUID, LIBRE2_SERVICE_UUID, LIBRE2_WRITE_CHARACTERISTIC_UUID,
};
use crate::session::{CoreEvent, Effect, Input, Session};
use crate::store::StateStore;
use crate::timer::{TimerKind, TimerRequest};

const EVENT_CAPACITY: usize = 64;

/// The first adapter of the platform manager.
pub async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(Error::NoAdapter)
}

/// Cheap, cloneable front end of a running driver.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<CoreEvent>,
}

impl LinkHandle {
    pub fn start_scanning(&self) {
        self.post(Input::StartScanning);
    }

    pub fn disconnect(&self) {
        self.post(Input::Disconnect);
    }

    pub fn set_identity(&self, identity: SensorIdentity) {
        self.post(Input::SetIdentity(identity));
    }

    pub fn set_ui_active(&self, active: bool) {
        self.post(Input::SetUiActive(active));
    }

    pub fn set_priority_mode(&self, mode: PriorityMode) {
        self.post(Input::SetPriorityMode(mode));
    }

    pub fn deliver_peer_message(&self, msg: ArbitrationMessage) {
        self.post(Input::Peer(msg));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    fn post(&self, input: Input) {
        if self.tx.send(input).is_err() {
            warn!("link driver has stopped");
        }
    }
}

pub struct Driver<S, P> {
    adapter: Adapter,
    session: Session,
    store: S,
    peer: P,
    tx: mpsc::UnboundedSender<Input>,
    rx: mpsc::UnboundedReceiver<Input>,
    events: broadcast::Sender<CoreEvent>,
    peripherals: HashMap<BDAddr, Peripheral>,
    timers: HashMap<TimerKind, JoinHandle<()>>,
    streams: HashMap<BDAddr, JoinHandle<()>>,
}

impl<S: StateStore, P: PeerChannel> Driver<S, P> {
    pub fn new(adapter: Adapter, session: Session, store: S, peer: P) -> (Self, LinkHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = LinkHandle {
            tx: tx.clone(),
            events: events.clone(),
        };
        let driver = Self {
            adapter,
            session,
            store,
            peer,
            tx,
            rx,
            events,
            peripherals: HashMap::new(),
            timers: HashMap::new(),
            streams: HashMap::new(),
        };
        (driver, handle)
    }

    /// Runs until the adapter's event stream ends or the task is aborted.
    pub async fn run(mut self) -> Result<()> {
        let mut central_events = self.adapter.events().await?;
        loop {
            tokio::select! {
                event = central_events.next() => match event {
                    Some(event) => self.on_central_event(event).await,
                    None => break,
                },
                Some(input) = self.rx.recv() => self.dispatch(input).await,
            }
        }
        warn!("adapter event stream ended");
        let timers = self.timers.drain().map(|(_, task)| task);
        for task in timers.chain(self.streams.drain().map(|(_, task)| task)) {
            task.abort();
        }
        Ok(())
    }

    async fn dispatch(&mut self, input: Input) {
        for effect in self.session.handle(input, Instant::now()) {
            self.execute(effect).await;
        }
    }

    async fn on_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                if *self.session.link_state() != LinkState::Scanning {
                    return;
                }
                let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                    return;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    return;
                };
                let adv = Advertisement {
                    address: props.address,
                    local_name: props.local_name,
                    services: props.services,
                    manufacturer_data: props.manufacturer_data,
                    rssi: props.rssi,
                };
                self.peripherals.insert(adv.address, peripheral);
                self.dispatch(Input::Ble(BleEvent::Discovered(adv))).await;
            }
            CentralEvent::DeviceDisconnected(id) => {
                if let Ok(peripheral) = self.adapter.peripheral(&id).await {
                    let address = peripheral.address();
                    if let Some(stream) = self.streams.remove(&address) {
                        stream.abort();
                    }
                    self.dispatch(Input::Ble(BleEvent::Disconnected(address))).await;
                }
            }
            CentralEvent::StateUpdate(state) => match power_event(&state) {
                Some(event) => {
                    info!(?state, "adapter state");
                    self.dispatch(Input::Ble(event)).await;
                }
                None => debug!(?state, "adapter state"),
            },
            other => debug!(?other, "central event"),
        }
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Ble(command) => self.execute_ble(command).await,
            Effect::Timer(request) => self.execute_timer(request),
            Effect::Peer(msg) => self.peer.send(msg),
            Effect::Emit(event) => {
                // no subscribers is fine
                let _ = self.events.send(event);
            }
            Effect::PersistKnownAddress(address) => {
                if let Err(error) = self.store.save_known_address(address) {
                    warn!(%error, "cannot persist sensor address");
                }
            }
            Effect::PersistSensor(uid) => {
                if let Err(error) = self.store.bind_sensor(&uid) {
                    warn!(%error, "cannot persist sensor uid");
                }
            }
            Effect::PersistUnlockCounter(counter) => {
                if let Err(error) = self.store.save_unlock_counter(counter) {
                    warn!(%error, "cannot persist unlock counter");
                }
            }
        }
    }

    fn execute_timer(&mut self, request: TimerRequest) {
        match request {
            TimerRequest::Arm { kind, token, after } => {
                let tx = self.tx.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(Input::Timer(kind, token));
                });
                if let Some(previous) = self.timers.insert(kind, task) {
                    previous.abort();
                }
            }
            TimerRequest::Cancel { kind } => {
                if let Some(task) = self.timers.remove(&kind) {
                    task.abort();
                }
            }
        }
    }

    async fn find_peripheral(&mut self, address: BDAddr) -> Option<Peripheral> {
        if let Some(peripheral) = self.peripherals.get(&address) {
            return Some(peripheral.clone());
        }
        let peripherals = self.adapter.peripherals().await.ok()?;
        let peripheral = peripherals.into_iter().find(|p| p.address() == address)?;
        self.peripherals.insert(address, peripheral.clone());
        Some(peripheral)
    }

    async fn execute_ble(&mut self, command: BleCommand) {
        match command {
            BleCommand::StartScan(kind) => {
                let filter = match kind {
                    ScanKind::Filtered => ScanFilter {
                        services: vec![LIBRE2_SERVICE_UUID],
                    },
                    ScanKind::Broad => ScanFilter::default(),
                };
                let _ = self.adapter.stop_scan().await;
                if let Err(error) = self.adapter.start_scan(filter).await {
                    warn!(%error, "cannot start scan");
                    self.post(BleEvent::ScanFailed {
                        reason: error.to_string(),
                    });
                }
            }
            BleCommand::StopScan => {
                if let Err(error) = self.adapter.stop_scan().await {
                    debug!(%error, "stop scan");
                }
            }
            BleCommand::RetrieveKnown(address) => {
                let connected = match self.find_peripheral(address).await {
                    Some(peripheral) => Some(peripheral.is_connected().await.unwrap_or(false)),
                    None => None,
                };
                self.post(BleEvent::KnownPeripheral { address, connected });
            }
            BleCommand::Connect(address) => {
                let Some(peripheral) = self.find_peripheral(address).await else {
                    self.post(BleEvent::ConnectFailed {
                        address,
                        reason: "peripheral no longer known".to_owned(),
                    });
                    return;
                };
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let event = match peripheral.connect().await {
                        Ok(()) => BleEvent::Connected(address),
                        Err(error) => BleEvent::ConnectFailed {
                            address,
                            reason: error.to_string(),
                        },
                    };
                    let _ = tx.send(Input::Ble(event));
                });
            }
            BleCommand::DiscoverServices(address) => {
                let Some(peripheral) = self.find_peripheral(address).await else {
                    return;
                };
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let event = match peripheral.discover_services().await {
                        Ok(()) => {
                            BleEvent::ServicesDiscovered {
                                address,
                                has_sensor_service: exposes_sensor(&peripheral.characteristics()),
                            }
                        }
                        Err(error) => BleEvent::ConnectFailed {
                            address,
                            reason: error.to_string(),
                        },
                    };
                    let _ = tx.send(Input::Ble(event));
                });
            }
            BleCommand::Write { address, payload } => {
                let Some(peripheral) = self.find_peripheral(address).await else {
                    return;
                };
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if let Err(error) = write_unlock(&peripheral, &payload).await {
                        warn!(%address, %error, "unlock write failed");
                        let _ = tx.send(Input::Ble(BleEvent::SetupFailed {
                            address,
                            reason: error.to_string(),
                        }));
                    }
                });
            }
            BleCommand::Subscribe(address) => {
                let Some(peripheral) = self.find_peripheral(address).await else {
                    return;
                };
                let tx = self.tx.clone();
                let task = tokio::spawn(async move {
                    if let Err(error) = stream_notifications(&peripheral, address, &tx).await {
                        warn!(%address, %error, "notification stream failed");
                        let _ = tx.send(Input::Ble(BleEvent::SetupFailed {
                            address,
                            reason: error.to_string(),
                        }));
                    }
                });
                if let Some(previous) = self.streams.insert(address, task) {
                    previous.abort();
                }
            }
            BleCommand::Disconnect(address) => {
                if let Some(stream) = self.streams.remove(&address) {
                    stream.abort();
                }
                let Some(peripheral) = self.find_peripheral(address).await else {
                    return;
                };
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if let Err(error) = peripheral.disconnect().await {
                        debug!(%address, %error, "disconnect");
                    }
                    // some backends report no event for a cancelled connect
                    if !peripheral.is_connected().await.unwrap_or(false) {
                        let _ = tx.send(Input::Ble(BleEvent::Disconnected(address)));
                    }
                });
            }
        }
    }

    fn post(&self, event: BleEvent) {
        let _ = self.tx.send(Input::Ble(event));
    }
}

fn power_event(state: &CentralState) -> Option<BleEvent> {
    match state {
        CentralState::PoweredOn => Some(BleEvent::PoweredOn),
        CentralState::PoweredOff => Some(BleEvent::PoweredOff),
        _ => None,
    }
}

/// The sensor service with both of its characteristics.
fn exposes_sensor(chars: &BTreeSet<Characteristic>) -> bool {
    has_characteristic(chars, LIBRE2_WRITE_CHARACTERISTIC_UUID)
        && has_characteristic(chars, LIBRE2_NOTIFY_CHARACTERISTIC_UUID)
}

fn has_characteristic(chars: &BTreeSet<Characteristic>, uuid: Uuid) -> bool {
    chars
        .iter()
        .any(|c| c.uuid == uuid && c.service_uuid == LIBRE2_SERVICE_UUID)
}

fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

async fn write_unlock(peripheral: &Peripheral, payload: &[u8]) -> Result<()> {
    let write = characteristic(peripheral, LIBRE2_WRITE_CHARACTERISTIC_UUID)
        .ok_or(Error::MissingCharacteristic(LIBRE2_WRITE_CHARACTERISTIC_UUID))?;
    peripheral.write(&write, payload, WriteType::WithResponse).await?;
    Ok(())
}

async fn stream_notifications(
    peripheral: &Peripheral,
    address: BDAddr,
    tx: &mpsc::UnboundedSender<Input>,
) -> Result<()> {
    let notify = characteristic(peripheral, LIBRE2_NOTIFY_CHARACTERISTIC_UUID)
        .ok_or(Error::MissingCharacteristic(LIBRE2_NOTIFY_CHARACTERISTIC_UUID))?;
    let mut notifications = peripheral.notifications().await?;
    peripheral.subscribe(&notify).await?;
    info!(%address, "streaming");
    let _ = tx.send(Input::Ble(BleEvent::Subscribed(address)));
    while let Some(n) = notifications.next().await {
        if n.uuid != LIBRE2_NOTIFY_CHARACTERISTIC_UUID {
            continue;
        }
        if tx
            .send(Input::Ble(BleEvent::Notification { address, value: n.value }))
            .is_err()
        {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use btleplug::api::CharPropFlags;

    use super::*;

    fn chr(service_uuid: Uuid, uuid: Uuid) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid,
            properties: CharPropFlags::empty(),
            descriptors: BTreeSet::new(),
        }
    }

    #[test]
    fn sensor_needs_both_characteristics() {
        let write = chr(LIBRE2_SERVICE_UUID, LIBRE2_WRITE_CHARACTERISTIC_UUID);
        let notify = chr(LIBRE2_SERVICE_UUID, LIBRE2_NOTIFY_CHARACTERISTIC_UUID);

        assert!(exposes_sensor(&BTreeSet::from([write.clone(), notify.clone()])));
        assert!(!exposes_sensor(&BTreeSet::from([write.clone()])));
        assert!(!exposes_sensor(&BTreeSet::from([notify])));
        assert!(!exposes_sensor(&BTreeSet::new()));
    }

    #[test]
    fn characteristic_must_sit_under_the_sensor_service() {
        let elsewhere = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
        let chars = BTreeSet::from([
            chr(LIBRE2_SERVICE_UUID, LIBRE2_WRITE_CHARACTERISTIC_UUID),
            chr(elsewhere, LIBRE2_NOTIFY_CHARACTERISTIC_UUID),
        ]);
        assert!(has_characteristic(&chars, LIBRE2_WRITE_CHARACTERISTIC_UUID));
        assert!(!has_characteristic(&chars, LIBRE2_NOTIFY_CHARACTERISTIC_UUID));
        assert!(!exposes_sensor(&chars));
    }

    #[test]
    fn adapter_power_maps_to_link_events() {
        assert_eq!(power_event(&CentralState::PoweredOn), Some(BleEvent::PoweredOn));
        assert_eq!(power_event(&CentralState::PoweredOff), Some(BleEvent::PoweredOff));
        assert_eq!(power_event(&CentralState::Unknown), None);
    }
}
