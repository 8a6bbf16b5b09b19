//! Producer role: publishes the transfer capability and streams the current
//! content to subscribers through the flow-controlled sender.
//!
//! Content changes arrive as explicit events. A change never preempts a
//! transfer that is still in flight; it is picked up once that transfer ends.

use smallvec::SmallVec;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::errors::SessionError;
use crate::sender::{ChunkSink, DrainOutcome, FlowControlledSender};

// ----------------------------------------------------------------------------
// Producer State, Events and Effects
// ----------------------------------------------------------------------------

/// Producer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProducerState {
    /// Radio unavailable
    PoweredOff,
    /// Capability published, not advertising
    Ready,
    /// Advertising the capability, no subscriber yet
    Advertising,
    /// At least one consumer is subscribed to the channel
    Subscribed,
}

/// What the peripheral knew before the process was restored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct PriorPeripheralState {
    pub advertising: bool,
    pub subscribers: usize,
}

/// Inputs from the transport and the content source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerEvent {
    /// Radio powered on and usable
    Ready,
    /// Radio went away
    PoweredOff,
    /// A consumer enabled notifications on the channel
    SubscriberAdded,
    /// A consumer disabled notifications or dropped the link
    SubscriberRemoved,
    /// Queued notifications drained; writes may be retried
    CapacityAvailable,
    /// The text to publish changed
    ContentChanged(String),
    /// Process restored with an existing peripheral session
    SessionRestored(PriorPeripheralState),
}

/// Outputs for the transport and the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerEffect {
    /// Register the service with its notify characteristic
    PublishCapability { capability_id: Uuid, channel_id: Uuid },
    StartAdvertising { capability_id: Uuid },
    StopAdvertising,
    TransferStarted { bytes: usize },
    TransferPaused { cursor: usize },
    TransferComplete { bytes: usize },
}

impl ProducerEffect {
    /// True for effects the transport must carry out
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProducerEffect::PublishCapability { .. }
                | ProducerEffect::StartAdvertising { .. }
                | ProducerEffect::StopAdvertising
        )
    }
}

/// Result of processing one producer input
#[derive(Debug, Clone)]
pub struct ProducerStep {
    pub from: ProducerState,
    pub to: ProducerState,
    pub effects: SmallVec<[ProducerEffect; 4]>,
    pub diagnostic: Option<SessionError>,
}

// ----------------------------------------------------------------------------
// Producer Session
// ----------------------------------------------------------------------------

/// Sans-IO producer state machine
#[derive(Debug)]
pub struct ProducerSession {
    config: SessionConfig,
    state: ProducerState,
    sender: FlowControlledSender,
    content: String,
    /// Snapshot captured for the transfer in flight
    in_flight_text: Option<String>,
    last_sent: Option<String>,
    /// A subscriber joined mid-transfer and needs the whole message again
    resend_requested: bool,
    advertising_requested: bool,
    subscribers: usize,
}

impl ProducerSession {
    pub fn new(config: SessionConfig) -> Self {
        let sender = FlowControlledSender::from_config(&config);
        Self {
            config,
            state: ProducerState::PoweredOff,
            sender,
            content: String::new(),
            in_flight_text: None,
            last_sent: None,
            resend_requested: false,
            advertising_requested: false,
            subscribers: 0,
        }
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn subscribers(&self) -> usize {
        self.subscribers
    }

    pub fn sender(&self) -> &FlowControlledSender {
        &self.sender
    }

    /// Single dispatch entry point for producer events
    pub fn handle(&mut self, event: ProducerEvent, sink: &mut impl ChunkSink) -> ProducerStep {
        let mut step = self.step();
        match event {
            ProducerEvent::Ready => self.on_ready(&mut step),
            ProducerEvent::PoweredOff => self.on_powered_off(),
            ProducerEvent::SubscriberAdded => self.on_subscriber_added(sink, &mut step),
            ProducerEvent::SubscriberRemoved => self.on_subscriber_removed(),
            ProducerEvent::CapacityAvailable => {
                let outcome = self.sender.on_capacity_available(sink);
                self.after_drain(outcome, sink, &mut step);
            }
            ProducerEvent::ContentChanged(text) => self.on_content_changed(text, sink, &mut step),
            ProducerEvent::SessionRestored(prior) => self.on_session_restored(prior, &mut step),
        }
        self.finish(step)
    }

    /// Caller switch for advertising
    pub fn set_advertising(&mut self, enabled: bool) -> ProducerStep {
        let mut step = self.step();
        self.advertising_requested = enabled;
        match (self.state, enabled) {
            (ProducerState::Ready, true) => {
                info!(capability = %self.config.capability_id, "Starting advertising");
                step.effects.push(ProducerEffect::StartAdvertising {
                    capability_id: self.config.capability_id,
                });
                self.state = ProducerState::Advertising;
            }
            (ProducerState::Advertising, false) => {
                info!("Stopping advertising");
                step.effects.push(ProducerEffect::StopAdvertising);
                self.state = ProducerState::Ready;
            }
            (ProducerState::Subscribed, true) => {
                step.effects.push(ProducerEffect::StartAdvertising {
                    capability_id: self.config.capability_id,
                });
            }
            (ProducerState::Subscribed, false) => {
                step.effects.push(ProducerEffect::StopAdvertising);
            }
            _ => debug!(enabled, state = ?self.state, "Advertising preference recorded"),
        }
        self.finish(step)
    }

    // ------------------------------------------------------------------------
    // Event Handlers
    // ------------------------------------------------------------------------

    fn on_ready(&mut self, step: &mut ProducerStep) {
        if self.state != ProducerState::PoweredOff {
            debug!(state = ?self.state, "Ready while already powered");
            step.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        }
        step.effects.push(ProducerEffect::PublishCapability {
            capability_id: self.config.capability_id,
            channel_id: self.config.channel_id,
        });
        self.state = ProducerState::Ready;
        if self.advertising_requested {
            step.effects.push(ProducerEffect::StartAdvertising {
                capability_id: self.config.capability_id,
            });
            self.state = ProducerState::Advertising;
        }
    }

    fn on_powered_off(&mut self) {
        self.sender.halt();
        self.in_flight_text = None;
        self.resend_requested = false;
        self.subscribers = 0;
        self.state = ProducerState::PoweredOff;
    }

    fn on_subscriber_added(&mut self, sink: &mut impl ChunkSink, step: &mut ProducerStep) {
        if self.state == ProducerState::PoweredOff {
            step.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        }
        self.subscribers += 1;
        self.state = ProducerState::Subscribed;
        info!(subscribers = self.subscribers, "Consumer subscribed");

        if self.sender.is_in_flight() {
            self.resend_requested = true;
            step.diagnostic = Some(SessionError::AlreadyInFlight);
            return;
        }
        self.start_transfer(sink, step);
    }

    fn on_subscriber_removed(&mut self) {
        if self.subscribers == 0 {
            return;
        }
        self.subscribers -= 1;
        info!(subscribers = self.subscribers, "Consumer unsubscribed");
        if self.subscribers == 0 {
            self.sender.halt();
            self.in_flight_text = None;
            self.resend_requested = false;
            self.state = if self.advertising_requested {
                ProducerState::Advertising
            } else {
                ProducerState::Ready
            };
        }
    }

    fn on_content_changed(
        &mut self,
        text: String,
        sink: &mut impl ChunkSink,
        step: &mut ProducerStep,
    ) {
        self.content = text;
        if self.subscribers == 0 {
            return;
        }
        if self.sender.is_in_flight() {
            debug!("Content changed mid-transfer, deferring");
            return;
        }
        if self.last_sent.as_deref() != Some(self.content.as_str()) {
            self.start_transfer(sink, step);
        }
    }

    fn on_session_restored(&mut self, prior: PriorPeripheralState, step: &mut ProducerStep) {
        if self.state != ProducerState::PoweredOff {
            step.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        }
        // The platform keeps the published service across restoration.
        self.advertising_requested = prior.advertising;
        self.subscribers = prior.subscribers;
        self.state = if prior.subscribers > 0 {
            ProducerState::Subscribed
        } else if prior.advertising {
            ProducerState::Advertising
        } else {
            ProducerState::Ready
        };
        info!(state = ?self.state, "Producer session restored");
    }

    // ------------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------------

    fn start_transfer(&mut self, sink: &mut impl ChunkSink, step: &mut ProducerStep) {
        let snapshot = self.content.clone();
        match self.sender.begin(snapshot.clone().into_bytes(), sink) {
            Ok(outcome) => {
                step.effects.push(ProducerEffect::TransferStarted {
                    bytes: snapshot.len(),
                });
                self.in_flight_text = Some(snapshot);
                self.after_drain(outcome, sink, step);
            }
            Err(e) => {
                warn!("Transfer not started: {}", e);
                step.diagnostic = Some(e.into());
            }
        }
    }

    fn after_drain(&mut self, outcome: DrainOutcome, sink: &mut impl ChunkSink, step: &mut ProducerStep) {
        match outcome {
            DrainOutcome::Idle => {}
            DrainOutcome::Paused { cursor, .. } => {
                step.effects.push(ProducerEffect::TransferPaused { cursor });
            }
            DrainOutcome::Complete { bytes } => {
                step.effects.push(ProducerEffect::TransferComplete { bytes });
                self.last_sent = self.in_flight_text.take();
                let changed = self.last_sent.as_deref() != Some(self.content.as_str());
                if self.subscribers > 0 && (self.resend_requested || changed) {
                    self.resend_requested = false;
                    self.start_transfer(sink, step);
                }
            }
        }
    }

    fn step(&self) -> ProducerStep {
        ProducerStep {
            from: self.state,
            to: self.state,
            effects: SmallVec::new(),
            diagnostic: None,
        }
    }

    fn finish(&self, mut step: ProducerStep) -> ProducerStep {
        step.to = self.state;
        if step.from != step.to {
            debug!(from = ?step.from, to = ?step.to, "Producer state transition");
        }
        step
    }
}
