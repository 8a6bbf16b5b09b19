//! In-memory loopback radio
//!
//! Connects one central endpoint and one peripheral endpoint without any
//! hardware. The peripheral's notifications land in a bounded queue; draining
//! the queue delivers chunks to the central and hands credit back to the
//! peripheral once the queue has room again. Faults can be injected to
//! exercise the failure paths of both sessions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bleconnect_core::{
    ChunkSink, ConsumerEvent, DiscoveryStage, Effect, ProducerEffect, ProducerEvent, WriteOutcome,
};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{
    event_channel, CentralTransport, EventReceiver, EventSender, PeripheralTransport,
};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Behaviour of the simulated radio
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Signal strength reported with every advertisement
    pub rssi: i16,
    /// Notifications the queue holds before writes hit backpressure
    pub queue_capacity: usize,
    /// Fail every connection attempt
    pub refuse_connect: bool,
    /// Report the capability as missing during discovery
    pub hide_capability: bool,
    /// Report the channel as missing during discovery
    pub hide_channel: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            rssi: -30,
            queue_capacity: 4,
            refuse_connect: false,
            hide_capability: false,
            hide_channel: false,
        }
    }
}

impl LoopbackConfig {
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_refuse_connect(mut self, refuse: bool) -> Self {
        self.refuse_connect = refuse;
        self
    }

    pub fn with_hidden_capability(mut self, hidden: bool) -> Self {
        self.hide_capability = hidden;
        self
    }

    pub fn with_hidden_channel(mut self, hidden: bool) -> Self {
        self.hide_channel = hidden;
        self
    }
}

/// Counters for what crossed the simulated air
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub advertisements: u64,
    pub connects: u64,
    pub discoveries: u64,
    pub subscribes: u64,
    pub notifications: u64,
    pub backpressure: u64,
    pub delivered: u64,
}

/// Link handle the loopback central hands to its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopbackPeer(pub u32);

// ----------------------------------------------------------------------------
// Shared Radio State
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Air {
    config: LoopbackConfig,
    powered: bool,
    /// Published service and its channel
    capability: Option<(Uuid, Uuid)>,
    advertising: bool,
    scanning: Option<Uuid>,
    link: Option<LoopbackPeer>,
    subscribed: bool,
    queue: VecDeque<Vec<u8>>,
    /// A write was refused since the queue last had room
    starved: bool,
    stats: LoopbackStats,
    central_tx: Option<EventSender<ConsumerEvent<LoopbackPeer>>>,
    peripheral_tx: Option<EventSender<ProducerEvent>>,
}

impl Air {
    fn to_central(&self, event: ConsumerEvent<LoopbackPeer>) {
        if let Some(tx) = &self.central_tx {
            if tx.send(event).is_err() {
                debug!("Central endpoint gone, event dropped");
            }
        }
    }

    fn to_peripheral(&self, event: ProducerEvent) {
        if let Some(tx) = &self.peripheral_tx {
            if tx.send(event).is_err() {
                debug!("Peripheral endpoint gone, event dropped");
            }
        }
    }

    /// Advertise to the central if it scans for what is published
    fn advertise(&mut self) {
        let visible = self.advertising
            && matches!((self.scanning, self.capability), (Some(wanted), Some((id, _))) if wanted == id);
        if visible && self.link.is_none() {
            self.stats.advertisements += 1;
            self.to_central(ConsumerEvent::CandidateDiscovered {
                candidate: LoopbackPeer(1),
                rssi: self.config.rssi,
            });
        }
    }

    /// Drop the link from either side
    fn sever(&mut self) -> Option<LoopbackPeer> {
        let link = self.link.take()?;
        self.queue.clear();
        self.starved = false;
        if self.subscribed {
            self.subscribed = false;
            self.to_peripheral(ProducerEvent::SubscriberRemoved);
        }
        Some(link)
    }

    fn capability_matches(&self, wanted: Uuid) -> bool {
        !self.config.hide_capability && matches!(self.capability, Some((id, _)) if id == wanted)
    }

    fn channel_matches(&self, service: Uuid, channel: Uuid) -> bool {
        !self.config.hide_channel
            && matches!(self.capability, Some((id, ch)) if id == service && ch == channel)
    }
}

// ----------------------------------------------------------------------------
// Loopback Radio
// ----------------------------------------------------------------------------

/// Test radio shared by one central and one peripheral
#[derive(Debug, Clone, Default)]
pub struct LoopbackRadio {
    air: Arc<Mutex<Air>>,
}

impl LoopbackRadio {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            air: Arc::new(Mutex::new(Air {
                config,
                ..Air::default()
            })),
        }
    }

    fn air(&self) -> MutexGuard<'_, Air> {
        self.air.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Central endpoint and the events it reports
    pub fn central(&self) -> (LoopbackCentral, EventReceiver<ConsumerEvent<LoopbackPeer>>) {
        let (tx, rx) = event_channel();
        self.air().central_tx = Some(tx);
        (LoopbackCentral { radio: self.clone() }, rx)
    }

    /// Peripheral endpoint and the events it reports
    pub fn peripheral(&self) -> (LoopbackPeripheral, EventReceiver<ProducerEvent>) {
        let (tx, rx) = event_channel();
        self.air().peripheral_tx = Some(tx);
        (LoopbackPeripheral { radio: self.clone() }, rx)
    }

    /// Power the radio on for both endpoints
    pub fn power_on(&self) {
        let mut air = self.air();
        air.powered = true;
        info!("Loopback radio powered on");
        air.to_central(ConsumerEvent::Ready);
        air.to_peripheral(ProducerEvent::Ready);
    }

    /// Power the radio off; every link and queued notification is lost
    pub fn power_off(&self) {
        let mut air = self.air();
        air.powered = false;
        air.link = None;
        air.subscribed = false;
        air.queue.clear();
        air.scanning = None;
        air.advertising = false;
        air.capability = None;
        info!("Loopback radio powered off");
        air.to_central(ConsumerEvent::PoweredOff);
        air.to_peripheral(ProducerEvent::PoweredOff);
    }

    /// Change the signal strength of future advertisements
    pub fn set_rssi(&self, rssi: i16) {
        self.air().config.rssi = rssi;
    }

    /// Repeat the current advertisement, as a duplicate-reporting scan would
    pub fn readvertise(&self) {
        self.air().advertise();
    }

    /// Inject link loss, as if the peer walked out of range
    pub fn drop_link(&self) {
        let mut air = self.air();
        if let Some(link) = air.sever() {
            info!(?link, "Loopback link dropped");
            air.to_central(ConsumerEvent::Disconnected(link));
        }
    }

    /// Deliver one queued notification. Returns false when the queue was empty.
    pub fn deliver(&self) -> bool {
        let mut air = self.air();
        let Some(chunk) = air.queue.pop_front() else {
            return false;
        };
        air.stats.delivered += 1;
        trace!(bytes = chunk.len(), "Notification delivered");
        air.to_central(ConsumerEvent::ChunkReceived(chunk));
        if air.starved {
            air.starved = false;
            air.to_peripheral(ProducerEvent::CapacityAvailable);
        }
        true
    }

    /// Deliver everything currently queued
    pub fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        while self.deliver() {
            delivered += 1;
        }
        delivered
    }

    /// Deliver queued notifications on a fixed tick until aborted
    pub fn spawn_pump(&self, tick: Duration) -> JoinHandle<()> {
        let radio = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                ticker.tick().await;
                radio.deliver_all();
            }
        })
    }

    pub fn queued(&self) -> usize {
        self.air().queue.len()
    }

    pub fn stats(&self) -> LoopbackStats {
        self.air().stats
    }
}

// ----------------------------------------------------------------------------
// Central Endpoint
// ----------------------------------------------------------------------------

/// Consumer-side endpoint of a [`LoopbackRadio`]
#[derive(Debug, Clone)]
pub struct LoopbackCentral {
    radio: LoopbackRadio,
}

#[async_trait]
impl CentralTransport<LoopbackPeer> for LoopbackCentral {
    async fn execute(&mut self, effect: Effect<LoopbackPeer>) -> Result<(), TransportError> {
        let mut air = self.radio.air();
        if !air.powered {
            return Err(TransportError::PoweredOff);
        }

        match effect {
            Effect::StartScan { capability_id, .. } => {
                air.scanning = Some(capability_id);
                air.advertise();
            }
            Effect::StopScan => air.scanning = None,
            Effect::Connect(peer) => {
                air.stats.connects += 1;
                if air.config.refuse_connect || !air.advertising {
                    air.to_central(ConsumerEvent::ConnectFailed {
                        candidate: peer,
                        reason: "peer refused connection".into(),
                    });
                } else {
                    air.link = Some(peer);
                    air.to_central(ConsumerEvent::Connected(peer));
                }
            }
            Effect::DiscoverCapability { link, capability_id } => {
                check_link(&air, link)?;
                air.stats.discoveries += 1;
                if air.capability_matches(capability_id) {
                    air.to_central(ConsumerEvent::CapabilityDiscovered);
                } else {
                    air.to_central(ConsumerEvent::DiscoveryFailed {
                        stage: DiscoveryStage::Capability,
                        reason: format!("service {} not found", capability_id),
                    });
                }
            }
            Effect::DiscoverChannel {
                link,
                capability_id,
                channel_id,
            } => {
                check_link(&air, link)?;
                air.stats.discoveries += 1;
                if air.channel_matches(capability_id, channel_id) {
                    air.to_central(ConsumerEvent::ChannelDiscovered);
                } else {
                    air.to_central(ConsumerEvent::DiscoveryFailed {
                        stage: DiscoveryStage::Channel,
                        reason: format!("characteristic {} not found", channel_id),
                    });
                }
            }
            Effect::Subscribe { link, .. } => {
                check_link(&air, link)?;
                air.stats.subscribes += 1;
                air.subscribed = true;
                air.to_central(ConsumerEvent::NotifyingStateChanged(true));
                air.to_peripheral(ProducerEvent::SubscriberAdded);
            }
            Effect::Unsubscribe { link, .. } => {
                check_link(&air, link)?;
                if air.subscribed {
                    air.subscribed = false;
                    air.queue.clear();
                    air.to_peripheral(ProducerEvent::SubscriberRemoved);
                }
                air.to_central(ConsumerEvent::NotifyingStateChanged(false));
            }
            Effect::Disconnect(link) => {
                check_link(&air, link)?;
                air.sever();
                air.to_central(ConsumerEvent::Disconnected(link));
            }
            other => debug!(?other, "Not a transport effect"),
        }
        Ok(())
    }
}

fn check_link(air: &Air, link: LoopbackPeer) -> Result<(), TransportError> {
    if air.link == Some(link) {
        Ok(())
    } else {
        Err(TransportError::UnknownLink(format!("{:?}", link)))
    }
}

// ----------------------------------------------------------------------------
// Peripheral Endpoint
// ----------------------------------------------------------------------------

/// Producer-side endpoint of a [`LoopbackRadio`]
#[derive(Debug, Clone)]
pub struct LoopbackPeripheral {
    radio: LoopbackRadio,
}

impl ChunkSink for LoopbackPeripheral {
    fn write(&mut self, chunk: &[u8]) -> WriteOutcome {
        let mut air = self.radio.air();
        if !air.subscribed {
            // Nobody listening; the notification goes nowhere.
            return WriteOutcome::Accepted;
        }
        if air.queue.len() >= air.config.queue_capacity {
            air.stats.backpressure += 1;
            air.starved = true;
            return WriteOutcome::Backpressure;
        }
        air.stats.notifications += 1;
        air.queue.push_back(chunk.to_vec());
        WriteOutcome::Accepted
    }
}

#[async_trait]
impl PeripheralTransport for LoopbackPeripheral {
    async fn execute(&mut self, effect: ProducerEffect) -> Result<(), TransportError> {
        let mut air = self.radio.air();
        if !air.powered {
            return Err(TransportError::PoweredOff);
        }

        match effect {
            ProducerEffect::PublishCapability {
                capability_id,
                channel_id,
            } => air.capability = Some((capability_id, channel_id)),
            ProducerEffect::StartAdvertising { capability_id } => {
                if !matches!(air.capability, Some((id, _)) if id == capability_id) {
                    return Err(TransportError::Rejected(format!(
                        "service {} is not published",
                        capability_id
                    )));
                }
                air.advertising = true;
                air.advertise();
            }
            ProducerEffect::StopAdvertising => air.advertising = false,
            other => debug!(?other, "Not a transport effect"),
        }
        Ok(())
    }
}
