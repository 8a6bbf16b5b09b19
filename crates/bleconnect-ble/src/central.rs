//! btleplug-backed central transport
//!
//! Executes consumer effects against a host Bluetooth adapter and turns
//! adapter events, connection results and notifications into
//! [`ConsumerEvent`]s. Slow operations (connecting, service discovery) run on
//! their own tasks so the session loop is never blocked on the radio.

use std::sync::Arc;

use async_trait::async_trait;
use bleconnect_core::{ConsumerEvent, DiscoveryStage, Effect};
use bleconnect_runtime::{CentralTransport, EventSender, TransportError};
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::candidate::CandidateTable;
use crate::config::BleCentralConfig;
use crate::error::BleTransportError;

type Events = EventSender<ConsumerEvent<PeripheralId>>;

/// Scan parameters shared with the adapter event pump
#[derive(Debug, Default)]
struct ScanState {
    capability_id: Option<Uuid>,
    candidates: CandidateTable<PeripheralId>,
}

// ----------------------------------------------------------------------------
// Btleplug Central
// ----------------------------------------------------------------------------

/// Consumer-side transport over a host BLE adapter
pub struct BtleplugCentral {
    config: BleCentralConfig,
    adapter: Adapter,
    events: Events,
    scan: Arc<RwLock<ScanState>>,
    adapter_pump: JoinHandle<()>,
    notifications: Option<JoinHandle<()>>,
}

impl BtleplugCentral {
    /// Open the configured adapter and start listening for its events.
    ///
    /// Reports [`ConsumerEvent::Ready`] once the adapter is usable.
    pub async fn new(config: BleCentralConfig, events: Events) -> Result<Self, BleTransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .nth(config.adapter_index)
            .ok_or(BleTransportError::AdapterNotAvailable)?;

        let stream = adapter
            .events()
            .await
            .map_err(|e| BleTransportError::EventStreamFailed(e.to_string()))?;

        let scan = Arc::new(RwLock::new(ScanState::default()));
        let adapter_pump = tokio::spawn(pump_adapter_events(
            adapter.clone(),
            stream,
            scan.clone(),
            events.clone(),
        ));

        info!(index = config.adapter_index, "BLE adapter initialized");
        let _ = events.send(ConsumerEvent::Ready);

        Ok(Self {
            config,
            adapter,
            events,
            scan,
            adapter_pump,
            notifications: None,
        })
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, BleTransportError> {
        self.adapter
            .peripheral(id)
            .await
            .map_err(|_| BleTransportError::PeripheralNotFound(format!("{:?}", id)))
    }

    fn emit(&self, event: ConsumerEvent<PeripheralId>) {
        if self.events.send(event).is_err() {
            debug!("Session gone, event dropped");
        }
    }

    async fn start_scan(&self, capability_id: Uuid, allow_duplicates: bool) -> Result<(), BleTransportError> {
        {
            let mut scan = self.scan.write().await;
            scan.capability_id = Some(capability_id);
            scan.candidates.restart(allow_duplicates);
        }
        self.adapter
            .start_scan(ScanFilter {
                services: vec![capability_id],
            })
            .await?;
        info!(%capability_id, allow_duplicates, "Started BLE scanning");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleTransportError> {
        self.scan.write().await.capability_id = None;
        self.adapter.stop_scan().await?;
        debug!("Stopped BLE scanning");
        Ok(())
    }

    async fn connect(&self, id: PeripheralId) -> Result<(), BleTransportError> {
        let peripheral = self.peripheral(&id).await?;
        let events = self.events.clone();
        let limit = self.config.connection_timeout;

        tokio::spawn(async move {
            let event = match timeout(limit, peripheral.connect()).await {
                Ok(Ok(())) => {
                    info!(?id, "Connected to peripheral");
                    ConsumerEvent::Connected(id)
                }
                Ok(Err(e)) => ConsumerEvent::ConnectFailed {
                    candidate: id,
                    reason: e.to_string(),
                },
                Err(_) => ConsumerEvent::ConnectFailed {
                    candidate: id,
                    reason: "connection timed out".into(),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn discover_capability(&self, link: PeripheralId, capability_id: Uuid) -> Result<(), BleTransportError> {
        let peripheral = self.peripheral(&link).await?;
        let events = self.events.clone();
        let limit = self.config.discovery_timeout;

        tokio::spawn(async move {
            let result = match timeout(limit, peripheral.discover_services()).await {
                Ok(Ok(())) => {
                    if peripheral.services().iter().any(|s| s.uuid == capability_id) {
                        Ok(())
                    } else {
                        Err(format!("service {} not exposed", capability_id))
                    }
                }
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("service discovery timed out".to_string()),
            };
            let event = match result {
                Ok(()) => ConsumerEvent::CapabilityDiscovered,
                Err(reason) => ConsumerEvent::DiscoveryFailed {
                    stage: DiscoveryStage::Capability,
                    reason,
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn discover_channel(
        &self,
        link: PeripheralId,
        capability_id: Uuid,
        channel_id: Uuid,
    ) -> Result<(), BleTransportError> {
        let peripheral = self.peripheral(&link).await?;
        match find_channel(&peripheral, capability_id, channel_id) {
            Some(_) => self.emit(ConsumerEvent::ChannelDiscovered),
            None => self.emit(ConsumerEvent::DiscoveryFailed {
                stage: DiscoveryStage::Channel,
                reason: format!("notify characteristic {} not exposed", channel_id),
            }),
        }
        Ok(())
    }

    async fn subscribe(&mut self, link: PeripheralId, channel_id: Uuid) -> Result<(), BleTransportError> {
        let peripheral = self.peripheral(&link).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == channel_id)
            .ok_or_else(|| BleTransportError::CharacteristicNotFound(channel_id.to_string()))?;

        let mut notifications = peripheral.notifications().await?;
        // A refusal is reported to the session, which drops the link.
        peripheral.subscribe(&characteristic).await?;

        let events = self.events.clone();
        self.stop_notifications();
        self.notifications = Some(tokio::spawn(async move {
            while let Some(data) = notifications.next().await {
                if data.uuid == channel_id && events.send(ConsumerEvent::ChunkReceived(data.value)).is_err() {
                    break;
                }
            }
            debug!("Notification stream ended");
        }));

        self.emit(ConsumerEvent::NotifyingStateChanged(true));
        Ok(())
    }

    async fn unsubscribe(&mut self, link: PeripheralId, channel_id: Uuid) -> Result<(), BleTransportError> {
        let peripheral = self.peripheral(&link).await?;
        self.stop_notifications();
        if let Some(characteristic) = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == channel_id)
        {
            peripheral.unsubscribe(&characteristic).await?;
        }
        self.emit(ConsumerEvent::NotifyingStateChanged(false));
        Ok(())
    }

    async fn disconnect(&mut self, link: PeripheralId) -> Result<(), BleTransportError> {
        self.stop_notifications();
        let peripheral = self.peripheral(&link).await?;
        // The adapter reports the disconnect through its event stream.
        peripheral.disconnect().await?;
        Ok(())
    }

    fn stop_notifications(&mut self) {
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        self.adapter_pump.abort();
        self.stop_notifications();
    }
}

#[async_trait]
impl CentralTransport<PeripheralId> for BtleplugCentral {
    async fn execute(&mut self, effect: Effect<PeripheralId>) -> Result<(), TransportError> {
        let result = match effect {
            Effect::StartScan {
                capability_id,
                allow_duplicates,
            } => self.start_scan(capability_id, allow_duplicates).await,
            Effect::StopScan => self.stop_scan().await,
            Effect::Connect(id) => self.connect(id).await,
            Effect::DiscoverCapability { link, capability_id } => {
                self.discover_capability(link, capability_id).await
            }
            Effect::DiscoverChannel {
                link,
                capability_id,
                channel_id,
            } => self.discover_channel(link, capability_id, channel_id).await,
            Effect::Subscribe { link, channel_id } => self.subscribe(link, channel_id).await,
            Effect::Unsubscribe { link, channel_id } => self.unsubscribe(link, channel_id).await,
            Effect::Disconnect(link) => self.disconnect(link).await,
            other => {
                debug!(?other, "Not a transport effect");
                Ok(())
            }
        };
        result.map_err(|e| {
            error!("BLE effect failed: {}", e);
            e.into()
        })
    }
}

// ----------------------------------------------------------------------------
// Adapter Event Pump
// ----------------------------------------------------------------------------

fn find_channel(peripheral: &Peripheral, capability_id: Uuid, channel_id: Uuid) -> Option<Characteristic> {
    peripheral
        .services()
        .into_iter()
        .find(|s| s.uuid == capability_id)?
        .characteristics
        .into_iter()
        .find(|c| c.uuid == channel_id && c.properties.contains(CharPropFlags::NOTIFY))
}

async fn pump_adapter_events(
    adapter: Adapter,
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    scan: Arc<RwLock<ScanState>>,
    events: Events,
) {
    while let Some(event) = stream.next().await {
        let forwarded = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                advertisement(&adapter, &scan, id).await
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!(?id, "Peripheral disconnected");
                Some(ConsumerEvent::Disconnected(id))
            }
            CentralEvent::StateUpdate(state) => adapter_state(state),
            _ => None,
        };
        if let Some(event) = forwarded {
            if events.send(event).is_err() {
                break;
            }
        }
    }
    debug!("Adapter event stream ended");
}

fn adapter_state(state: CentralState) -> Option<ConsumerEvent<PeripheralId>> {
    match state {
        CentralState::PoweredOn => {
            info!("BLE adapter powered on");
            Some(ConsumerEvent::Ready)
        }
        CentralState::PoweredOff => {
            info!("BLE adapter powered off");
            Some(ConsumerEvent::PoweredOff)
        }
        _ => None,
    }
}

/// Turn an advertisement into a candidate event when it matches the scan
async fn advertisement(
    adapter: &Adapter,
    scan: &RwLock<ScanState>,
    id: PeripheralId,
) -> Option<ConsumerEvent<PeripheralId>> {
    let peripheral = adapter.peripheral(&id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let rssi = properties.rssi?;

    let mut scan = scan.write().await;
    let wanted = scan.capability_id?;
    if !properties.services.contains(&wanted) {
        return None;
    }
    if !scan.candidates.record(id.clone(), rssi) {
        return None;
    }
    if let Some(seen) = scan.candidates.get(&id) {
        debug!(
            ?id,
            rssi,
            sightings = seen.sightings,
            since_ms = seen.first_seen.elapsed().as_millis() as u64,
            "Advertisement"
        );
    }
    Some(ConsumerEvent::CandidateDiscovered { candidate: id, rssi })
}
