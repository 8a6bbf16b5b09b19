//! Consumer role: discovery, connection and subscription state machine
//!
//! The session is sans-IO. Every input is a [`ConsumerEvent`] delivered to
//! [`ConsumerSession::handle`], which returns the [`Effect`]s the transport
//! and application must carry out. Callers serialize delivery: one event is
//! processed to completion before the next is handed in.
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Connected -> DiscoveringCapability
//!      -> DiscoveringChannel -> Subscribing -> Active -> Disconnected
//! ```
//!
//! `Disconnected` falls back to `Scanning` when `auto_rescan` is set and the
//! teardown was not requested by the caller, and to `Idle` when it was.

use core::fmt;

use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::codec::matches_marker;
use crate::config::SessionConfig;
use crate::errors::{DiscoveryStage, SessionError};
use crate::protocol::is_within_range;
use crate::reassembly::{ReassemblyBuffer, ReassemblyOutcome};
use crate::resumption::PriorLinkState;

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

/// Consumer session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    DiscoveringCapability,
    DiscoveringChannel,
    Subscribing,
    Active,
    Disconnected,
    /// Discovery kept failing; the session no longer rescans on its own
    Failed,
}

impl SessionState {
    /// True while the session owns a link
    pub fn holds_link(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Connected
                | SessionState::DiscoveringCapability
                | SessionState::DiscoveringChannel
                | SessionState::Subscribing
                | SessionState::Active
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ----------------------------------------------------------------------------
// Events and Effects
// ----------------------------------------------------------------------------

/// Inputs delivered by the transport collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent<C> {
    /// Radio powered on and usable
    Ready,
    /// Radio went away; every link is gone
    PoweredOff,
    /// Advertisement for the capability with its signal strength
    CandidateDiscovered { candidate: C, rssi: i16 },
    Connected(C),
    ConnectFailed { candidate: C, reason: String },
    Disconnected(C),
    CapabilityDiscovered,
    ChannelDiscovered,
    DiscoveryFailed { stage: DiscoveryStage, reason: String },
    ChunkReceived(Vec<u8>),
    /// Notification delivery on the channel started (`true`) or stopped
    NotifyingStateChanged(bool),
    /// Process restored with what the platform still knows about the link
    SessionRestored(PriorLinkState<C>),
}

/// Outputs for the transport and the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect<C> {
    StartScan {
        capability_id: Uuid,
        allow_duplicates: bool,
    },
    StopScan,
    Connect(C),
    DiscoverCapability {
        link: C,
        capability_id: Uuid,
    },
    DiscoverChannel {
        link: C,
        capability_id: Uuid,
        channel_id: Uuid,
    },
    Subscribe {
        link: C,
        channel_id: Uuid,
    },
    Unsubscribe {
        link: C,
        channel_id: Uuid,
    },
    Disconnect(C),
    /// Signal strength of the latest advertisement and the admission verdict
    SignalStrength { rssi: i16, accepted: bool },
    /// Subscription confirmed
    SessionActive,
    MessageComplete(String),
    SessionEnded { intentional: bool },
    /// Discovery failed too often; the session stopped retrying
    SessionFailed(SessionError),
}

impl<C> Effect<C> {
    /// True for effects the transport must carry out
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Effect::StartScan { .. }
                | Effect::StopScan
                | Effect::Connect(_)
                | Effect::DiscoverCapability { .. }
                | Effect::DiscoverChannel { .. }
                | Effect::Subscribe { .. }
                | Effect::Unsubscribe { .. }
                | Effect::Disconnect(_)
        )
    }
}

/// Effects produced by one input, usually no more than a handful
pub type Effects<C> = SmallVec<[Effect<C>; 4]>;

/// Result of processing one input
#[derive(Debug, Clone)]
pub struct Transition<C> {
    pub from: SessionState,
    pub to: SessionState,
    pub effects: Effects<C>,
    /// Diagnostic-only detail; never needs handling by the caller
    pub diagnostic: Option<SessionError>,
}

impl<C> Transition<C> {
    pub(crate) fn new(state: SessionState) -> Self {
        Self {
            from: state,
            to: state,
            effects: SmallVec::new(),
            diagnostic: None,
        }
    }

    pub(crate) fn push(&mut self, effect: Effect<C>) {
        self.effects.push(effect);
    }
}

// ----------------------------------------------------------------------------
// Consumer Session
// ----------------------------------------------------------------------------

/// Sans-IO consumer state machine, generic over the transport's link handle
#[derive(Debug)]
pub struct ConsumerSession<C> {
    pub(crate) config: SessionConfig,
    pub(crate) state: SessionState,
    /// Accepted candidate, then the connected link
    pub(crate) link: Option<C>,
    pub(crate) buffer: ReassemblyBuffer,
    /// The message arriving went over `max_message_bytes`; drop the rest of it
    pub(crate) discarding: bool,
    pub(crate) transport_ready: bool,
    pub(crate) scanning: bool,
    /// Subscription requested or confirmed on the current link
    pub(crate) channel_known: bool,
    /// Teardown requested by the caller
    pub(crate) intentional: bool,
    pub(crate) discovery_failures: u32,
}

impl<C> ConsumerSession<C>
where
    C: Clone + PartialEq + fmt::Debug,
{
    pub fn new(config: SessionConfig) -> Self {
        let buffer = ReassemblyBuffer::with_end_marker(config.end_marker.clone());
        Self {
            config,
            state: SessionState::Idle,
            link: None,
            buffer,
            discarding: false,
            transport_ready: false,
            scanning: false,
            channel_known: false,
            intentional: false,
            discovery_failures: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn link(&self) -> Option<&C> {
        self.link.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Bytes buffered for the message currently arriving
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Single dispatch entry point for transport events
    pub fn handle(&mut self, event: ConsumerEvent<C>) -> Transition<C> {
        let mut t = Transition::new(self.state);
        match event {
            ConsumerEvent::Ready => self.on_ready(&mut t),
            ConsumerEvent::PoweredOff => self.on_powered_off(&mut t),
            ConsumerEvent::CandidateDiscovered { candidate, rssi } => {
                self.on_candidate_discovered(candidate, rssi, &mut t)
            }
            ConsumerEvent::Connected(link) => self.on_connected(link, &mut t),
            ConsumerEvent::ConnectFailed { candidate, reason } => {
                self.on_connect_failed(candidate, reason, &mut t)
            }
            ConsumerEvent::Disconnected(link) => self.on_disconnected(link, &mut t),
            ConsumerEvent::CapabilityDiscovered => self.on_capability_discovered(&mut t),
            ConsumerEvent::ChannelDiscovered => self.on_channel_discovered(&mut t),
            ConsumerEvent::DiscoveryFailed { stage, reason } => {
                self.on_discovery_failed(stage, reason, &mut t)
            }
            ConsumerEvent::ChunkReceived(chunk) => self.on_chunk_received(&chunk, &mut t),
            ConsumerEvent::NotifyingStateChanged(notifying) => {
                self.on_notifying_state_changed(notifying, &mut t)
            }
            ConsumerEvent::SessionRestored(prior) => self.on_session_restored(prior, &mut t),
        }
        self.finish(t)
    }

    /// Caller-initiated teardown.
    ///
    /// With a subscription in place the session unsubscribes first and drops
    /// the link once the transport confirms notifications stopped. Without
    /// one the link is dropped straight away.
    pub fn disconnect(&mut self) -> Transition<C> {
        let mut t = Transition::new(self.state);
        self.intentional = true;

        match (self.state, self.link.clone()) {
            (SessionState::Subscribing | SessionState::Active, Some(link)) if self.channel_known => {
                info!(?link, "Unsubscribing before disconnect");
                t.push(Effect::Unsubscribe {
                    link,
                    channel_id: self.config.channel_id,
                });
            }
            (state, Some(link)) if state.holds_link() => {
                info!(?link, "Disconnecting");
                self.stop_scan(&mut t);
                t.push(Effect::Disconnect(link));
                self.release_link();
                t.push(Effect::SessionEnded { intentional: true });
                self.intentional = false;
                self.state = SessionState::Idle;
            }
            (SessionState::Scanning, _) => {
                self.stop_scan(&mut t);
                self.intentional = false;
                self.state = SessionState::Idle;
            }
            _ => debug!(state = %self.state, "Nothing to tear down"),
        }
        self.finish(t)
    }

    /// Leave a terminal or idle state and start over
    pub fn reset(&mut self) -> Transition<C> {
        let mut t = Transition::new(self.state);
        if self.state.holds_link() {
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return self.finish(t);
        }
        self.discovery_failures = 0;
        self.intentional = false;
        self.release_link();
        self.state = SessionState::Idle;
        if self.transport_ready {
            self.start_scan(&mut t);
        }
        self.finish(t)
    }

    // ------------------------------------------------------------------------
    // Event Handlers
    // ------------------------------------------------------------------------

    fn on_ready(&mut self, t: &mut Transition<C>) {
        self.transport_ready = true;
        if self.state != SessionState::Idle {
            debug!(state = %self.state, "Transport ready outside idle");
            return;
        }
        self.intentional = false;
        self.start_scan(t);
    }

    fn on_powered_off(&mut self, t: &mut Transition<C>) {
        self.transport_ready = false;
        self.scanning = false;
        if self.state.holds_link() {
            t.push(Effect::SessionEnded {
                intentional: self.intentional,
            });
        }
        self.release_link();
        if self.state != SessionState::Failed {
            self.state = SessionState::Idle;
        }
    }

    fn on_candidate_discovered(&mut self, candidate: C, rssi: i16, t: &mut Transition<C>) {
        let accepted = is_within_range(rssi, self.config.proximity_threshold_dbm);
        t.push(Effect::SignalStrength { rssi, accepted });

        if self.state != SessionState::Scanning {
            if self.link.as_ref() == Some(&candidate) {
                debug!(?candidate, "Advertisement from the current link ignored");
            }
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        }
        if !accepted {
            debug!(
                ?candidate,
                rssi,
                threshold = self.config.proximity_threshold_dbm,
                "Candidate out of range"
            );
            return;
        }

        info!(?candidate, rssi, "Candidate in range, connecting");
        self.link = Some(candidate.clone());
        self.state = SessionState::Connecting;
        t.push(Effect::Connect(candidate));
    }

    fn on_connected(&mut self, link: C, t: &mut Transition<C>) {
        if self.state != SessionState::Connecting || self.link.as_ref() != Some(&link) {
            debug!(?link, state = %self.state, "Unexpected connection confirmation");
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        }
        info!(?link, "Connected");
        self.stop_scan(t);
        self.enter_connected(link, t);
    }

    fn on_connect_failed(&mut self, candidate: C, reason: String, t: &mut Transition<C>) {
        if self.state != SessionState::Connecting || self.link.as_ref() != Some(&candidate) {
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        }
        warn!(?candidate, %reason, "Connection attempt failed");
        t.diagnostic = Some(SessionError::ConnectionFailure { reason });
        self.release_link();
        self.state = SessionState::Disconnected;
        self.after_link_loss(t);
    }

    fn on_disconnected(&mut self, link: C, t: &mut Transition<C>) {
        if !self.state.holds_link() || self.link.as_ref() != Some(&link) {
            debug!(?link, state = %self.state, "Disconnect for a link we do not hold");
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        }
        info!(?link, intentional = self.intentional, "Link disconnected");
        self.release_link();
        self.state = SessionState::Disconnected;
        t.push(Effect::SessionEnded {
            intentional: self.intentional,
        });
        self.after_link_loss(t);
    }

    fn on_capability_discovered(&mut self, t: &mut Transition<C>) {
        let Some(link) = self.link.clone() else {
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        };
        if self.state != SessionState::DiscoveringCapability {
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        }
        debug!(capability = %self.config.capability_id, "Capability found, looking for channel");
        t.push(Effect::DiscoverChannel {
            link,
            capability_id: self.config.capability_id,
            channel_id: self.config.channel_id,
        });
        self.state = SessionState::DiscoveringChannel;
    }

    fn on_channel_discovered(&mut self, t: &mut Transition<C>) {
        let Some(link) = self.link.clone() else {
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        };
        if self.state != SessionState::DiscoveringChannel {
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        }
        debug!(channel = %self.config.channel_id, "Channel found, subscribing");
        t.push(Effect::Subscribe {
            link,
            channel_id: self.config.channel_id,
        });
        self.channel_known = true;
        self.state = SessionState::Subscribing;
    }

    fn on_discovery_failed(&mut self, stage: DiscoveryStage, reason: String, t: &mut Transition<C>) {
        let expected = match stage {
            DiscoveryStage::Capability => SessionState::DiscoveringCapability,
            DiscoveryStage::Channel => SessionState::DiscoveringChannel,
            DiscoveryStage::Subscription => SessionState::Subscribing,
        };
        let Some(link) = self.link.clone() else {
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        };
        if self.state != expected {
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        }

        self.discovery_failures += 1;
        warn!(%stage, %reason, failures = self.discovery_failures, "Discovery failed, tearing down");
        let err = SessionError::DiscoveryFailure { stage, reason };

        t.push(Effect::Disconnect(link));
        self.release_link();
        self.state = SessionState::Disconnected;
        t.push(Effect::SessionEnded { intentional: false });

        if self.discovery_failures >= self.config.max_discovery_failures {
            error!(failures = self.discovery_failures, "Giving up on discovery");
            self.state = SessionState::Failed;
            t.push(Effect::SessionFailed(err.clone()));
        } else {
            self.after_link_loss(t);
        }
        t.diagnostic = Some(err);
    }

    fn on_chunk_received(&mut self, chunk: &[u8], t: &mut Transition<C>) {
        if self.state != SessionState::Active {
            debug!(state = %self.state, bytes = chunk.len(), "Chunk outside an active session");
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        }

        if self.discarding {
            if matches_marker(chunk, &self.config.end_marker) {
                debug!("End of oversized message, resuming delivery");
                self.discarding = false;
            } else {
                trace!(bytes = chunk.len(), "Dropping chunk of oversized message");
            }
            return;
        }

        match self.buffer.on_chunk(chunk) {
            Ok(ReassemblyOutcome::MessageInProgress) => {
                if let Some(max_size) = self.config.max_message_bytes {
                    let size = self.buffer.len();
                    if size > max_size {
                        warn!(size, max_size, "Message exceeds limit, discarding");
                        self.reset_buffer();
                        self.discarding = true;
                        t.diagnostic = Some(SessionError::MessageTooLarge { size, max_size });
                    }
                }
            }
            Ok(ReassemblyOutcome::MessageComplete(message)) => {
                info!(bytes = message.len(), "Message complete");
                t.push(Effect::MessageComplete(message));
            }
            Err(e) => {
                warn!("Dropping undecodable chunk: {}", e);
                t.diagnostic = Some(e.into());
            }
        }
    }

    fn on_notifying_state_changed(&mut self, notifying: bool, t: &mut Transition<C>) {
        let Some(link) = self.link.clone() else {
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        };

        if notifying {
            if self.state != SessionState::Subscribing {
                t.diagnostic = Some(SessionError::StaleSignalIgnored);
                return;
            }
            info!(?link, "Notifications started, session active");
            self.reset_buffer();
            self.discovery_failures = 0;
            self.state = SessionState::Active;
            t.push(Effect::SessionActive);
            return;
        }

        if !self.state.holds_link() {
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        }
        // Notifications stopped while connected: drop the link. Whether that
        // ends in a rescan is decided when the disconnect is confirmed.
        info!(?link, intentional = self.intentional, "Notifications stopped, disconnecting");
        self.channel_known = false;
        t.push(Effect::Disconnect(link));
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Enter `Connected` and kick off capability discovery on the link
    pub(crate) fn enter_connected(&mut self, link: C, t: &mut Transition<C>) {
        self.state = SessionState::Connected;
        self.link = Some(link.clone());
        self.reset_buffer();
        self.channel_known = false;
        t.push(Effect::DiscoverCapability {
            link,
            capability_id: self.config.capability_id,
        });
        self.state = SessionState::DiscoveringCapability;
    }

    fn after_link_loss(&mut self, t: &mut Transition<C>) {
        if self.intentional {
            self.intentional = false;
            self.stop_scan(t);
            self.state = SessionState::Idle;
        } else if self.config.auto_rescan && self.transport_ready {
            self.state = SessionState::Scanning;
            self.start_scan(t);
        } else {
            self.stop_scan(t);
        }
    }

    fn start_scan(&mut self, t: &mut Transition<C>) {
        self.state = SessionState::Scanning;
        if !self.scanning {
            self.scanning = true;
            t.push(Effect::StartScan {
                capability_id: self.config.capability_id,
                allow_duplicates: self.config.allow_duplicate_advertisements,
            });
        }
    }

    pub(crate) fn stop_scan(&mut self, t: &mut Transition<C>) {
        if self.scanning {
            self.scanning = false;
            t.push(Effect::StopScan);
        }
    }

    pub(crate) fn release_link(&mut self) {
        self.link = None;
        self.channel_known = false;
        self.reset_buffer();
    }

    /// Forget the message arriving, including an oversized one being skipped
    pub(crate) fn reset_buffer(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    pub(crate) fn finish(&self, mut t: Transition<C>) -> Transition<C> {
        t.to = self.state;
        if t.from != t.to {
            debug!(from = %t.from, to = %t.to, "Session state transition");
        }
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::END_OF_MESSAGE;

    type Session = ConsumerSession<u32>;

    fn scanning_session(config: SessionConfig) -> Session {
        let mut session = Session::new(config);
        session.handle(ConsumerEvent::Ready);
        session
    }

    fn active_session() -> Session {
        active_session_with(SessionConfig::default())
    }

    fn active_session_with(config: SessionConfig) -> Session {
        let mut session = scanning_session(config);
        session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 7,
            rssi: -30,
        });
        session.handle(ConsumerEvent::Connected(7));
        session.handle(ConsumerEvent::CapabilityDiscovered);
        session.handle(ConsumerEvent::ChannelDiscovered);
        session.handle(ConsumerEvent::NotifyingStateChanged(true));
        assert_eq!(session.state(), SessionState::Active);
        session
    }

    fn connects(t: &Transition<u32>) -> usize {
        t.effects
            .iter()
            .filter(|e| matches!(e, Effect::Connect(_)))
            .count()
    }

    #[test]
    fn test_ready_starts_scanning() {
        let mut session = Session::new(SessionConfig::default());
        let t = session.handle(ConsumerEvent::Ready);
        assert_eq!(t.from, SessionState::Idle);
        assert_eq!(t.to, SessionState::Scanning);
        assert!(matches!(t.effects[0], Effect::StartScan { .. }));
    }

    #[test]
    fn test_candidate_below_threshold_is_never_connected() {
        let mut session = scanning_session(SessionConfig::default());
        for _ in 0..3 {
            let t = session.handle(ConsumerEvent::CandidateDiscovered {
                candidate: 1,
                rssi: -60,
            });
            assert_eq!(connects(&t), 0);
            assert_eq!(
                t.effects[0],
                Effect::SignalStrength {
                    rssi: -60,
                    accepted: false
                }
            );
        }
        assert_eq!(session.state(), SessionState::Scanning);
        assert!(session.link().is_none());
    }

    #[test]
    fn test_duplicate_advertisement_issues_one_connect() {
        let mut session = scanning_session(SessionConfig::default());
        let first = session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 1,
            rssi: -30,
        });
        let second = session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 1,
            rssi: -28,
        });
        assert_eq!(connects(&first), 1);
        assert_eq!(connects(&second), 0);
        assert_eq!(second.diagnostic, Some(SessionError::StaleSignalIgnored));
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[test]
    fn test_first_accepted_candidate_wins() {
        let mut session = scanning_session(SessionConfig::default());
        session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 1,
            rssi: -30,
        });
        let t = session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 2,
            rssi: -20,
        });
        assert_eq!(connects(&t), 0);
        assert_eq!(session.link(), Some(&1));
    }

    #[test]
    fn test_connect_stops_scan_and_discovers_capability() {
        let mut session = scanning_session(SessionConfig::default());
        session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 1,
            rssi: -30,
        });
        let t = session.handle(ConsumerEvent::Connected(1));
        assert_eq!(t.to, SessionState::DiscoveringCapability);
        assert_eq!(t.effects[0], Effect::StopScan);
        assert!(matches!(
            t.effects[1],
            Effect::DiscoverCapability { link: 1, .. }
        ));
    }

    #[test]
    fn test_full_flow_to_active_and_message() {
        let mut session = active_session();
        session.handle(ConsumerEvent::ChunkReceived(b"HELLO ".to_vec()));
        let t = session.handle(ConsumerEvent::ChunkReceived(b"WORLD".to_vec()));
        assert!(t.effects.is_empty());
        let t = session.handle(ConsumerEvent::ChunkReceived(END_OF_MESSAGE.to_vec()));
        assert_eq!(
            t.effects.as_slice(),
            &[Effect::MessageComplete("HELLO WORLD".to_string())]
        );
        assert_eq!(session.buffered_bytes(), 0);
    }

    #[test]
    fn test_decode_failure_is_swallowed() {
        let mut session = active_session();
        session.handle(ConsumerEvent::ChunkReceived(b"ok".to_vec()));
        let t = session.handle(ConsumerEvent::ChunkReceived(vec![0xFF, 0xFE]));
        assert!(matches!(t.diagnostic, Some(SessionError::DecodeFailure(_))));
        assert_eq!(t.to, SessionState::Active);
        let t = session.handle(ConsumerEvent::ChunkReceived(END_OF_MESSAGE.to_vec()));
        assert_eq!(
            t.effects.as_slice(),
            &[Effect::MessageComplete("ok".to_string())]
        );
    }

    #[test]
    fn test_link_loss_rescans() {
        let mut session = active_session();
        let t = session.handle(ConsumerEvent::Disconnected(7));
        assert_eq!(t.to, SessionState::Scanning);
        assert!(t
            .effects
            .contains(&Effect::SessionEnded { intentional: false }));
        assert!(t
            .effects
            .iter()
            .any(|e| matches!(e, Effect::StartScan { .. })));
        assert!(session.link().is_none());
    }

    #[test]
    fn test_link_loss_without_auto_rescan_stays_disconnected() {
        let mut session = scanning_session(SessionConfig::default().with_auto_rescan(false));
        session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 3,
            rssi: -10,
        });
        session.handle(ConsumerEvent::Connected(3));
        let t = session.handle(ConsumerEvent::Disconnected(3));
        assert_eq!(t.to, SessionState::Disconnected);
        assert!(!t
            .effects
            .iter()
            .any(|e| matches!(e, Effect::StartScan { .. })));
    }

    #[test]
    fn test_intentional_teardown_unsubscribes_first() {
        let mut session = active_session();
        let t = session.disconnect();
        assert!(matches!(t.effects[0], Effect::Unsubscribe { link: 7, .. }));
        assert_eq!(t.to, SessionState::Active);

        let t = session.handle(ConsumerEvent::NotifyingStateChanged(false));
        assert_eq!(t.effects.as_slice(), &[Effect::Disconnect(7)]);

        let t = session.handle(ConsumerEvent::Disconnected(7));
        assert_eq!(t.to, SessionState::Idle);
        assert_eq!(
            t.effects.as_slice(),
            &[Effect::SessionEnded { intentional: true }]
        );
    }

    #[test]
    fn test_intentional_teardown_without_channel_disconnects_directly() {
        let mut session = scanning_session(SessionConfig::default());
        session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 4,
            rssi: -30,
        });
        session.handle(ConsumerEvent::Connected(4));
        let t = session.disconnect();
        assert_eq!(t.effects[0], Effect::Disconnect(4));
        assert_eq!(t.to, SessionState::Idle);

        let t = session.handle(ConsumerEvent::Disconnected(4));
        assert_eq!(t.diagnostic, Some(SessionError::StaleSignalIgnored));
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_remote_unsubscribe_disconnects_and_rescans() {
        let mut session = active_session();
        let t = session.handle(ConsumerEvent::NotifyingStateChanged(false));
        assert_eq!(t.effects.as_slice(), &[Effect::Disconnect(7)]);
        let t = session.handle(ConsumerEvent::Disconnected(7));
        assert_eq!(t.to, SessionState::Scanning);
    }

    #[test]
    fn test_connect_failure_retries_next_advertisement() {
        let mut session = scanning_session(SessionConfig::default());
        session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 5,
            rssi: -30,
        });
        let t = session.handle(ConsumerEvent::ConnectFailed {
            candidate: 5,
            reason: "timeout".into(),
        });
        assert!(matches!(
            t.diagnostic,
            Some(SessionError::ConnectionFailure { .. })
        ));
        assert_eq!(t.to, SessionState::Scanning);
        // Scanning never stopped while connecting.
        assert!(t.effects.is_empty());

        let t = session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 5,
            rssi: -30,
        });
        assert_eq!(connects(&t), 1);
    }

    #[test]
    fn test_discovery_failure_tears_down_and_rescans() {
        let mut session = scanning_session(SessionConfig::default());
        session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 9,
            rssi: -30,
        });
        session.handle(ConsumerEvent::Connected(9));
        let t = session.handle(ConsumerEvent::DiscoveryFailed {
            stage: DiscoveryStage::Capability,
            reason: "service missing".into(),
        });
        assert_eq!(t.effects[0], Effect::Disconnect(9));
        assert_eq!(t.to, SessionState::Scanning);
        assert!(matches!(
            t.diagnostic,
            Some(SessionError::DiscoveryFailure {
                stage: DiscoveryStage::Capability,
                ..
            })
        ));
    }

    #[test]
    fn test_repeated_discovery_failure_is_terminal() {
        let mut session =
            scanning_session(SessionConfig::default().with_max_discovery_failures(2));
        let mut last = None;
        for _ in 0..2 {
            session.handle(ConsumerEvent::CandidateDiscovered {
                candidate: 9,
                rssi: -30,
            });
            session.handle(ConsumerEvent::Connected(9));
            session.handle(ConsumerEvent::CapabilityDiscovered);
            last = Some(session.handle(ConsumerEvent::DiscoveryFailed {
                stage: DiscoveryStage::Channel,
                reason: "characteristic missing".into(),
            }));
        }
        let t = last.unwrap();
        assert_eq!(t.to, SessionState::Failed);
        assert!(t
            .effects
            .iter()
            .any(|e| matches!(e, Effect::SessionFailed(_))));

        let t = session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 9,
            rssi: -30,
        });
        assert_eq!(connects(&t), 0);

        let t = session.reset();
        assert_eq!(t.to, SessionState::Scanning);
    }

    #[test]
    fn test_chunks_outside_active_are_ignored() {
        let mut session = scanning_session(SessionConfig::default());
        let t = session.handle(ConsumerEvent::ChunkReceived(b"early".to_vec()));
        assert_eq!(t.diagnostic, Some(SessionError::StaleSignalIgnored));
        assert_eq!(session.buffered_bytes(), 0);
    }

    #[test]
    fn test_oversized_message_is_discarded() {
        let mut session = scanning_session(
            SessionConfig::default().with_max_message_bytes(Some(10)),
        );
        session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 1,
            rssi: 0,
        });
        session.handle(ConsumerEvent::Connected(1));
        session.handle(ConsumerEvent::CapabilityDiscovered);
        session.handle(ConsumerEvent::ChannelDiscovered);
        session.handle(ConsumerEvent::NotifyingStateChanged(true));

        session.handle(ConsumerEvent::ChunkReceived(b"0123456789".to_vec()));
        let t = session.handle(ConsumerEvent::ChunkReceived(b"X".to_vec()));
        assert_eq!(
            t.diagnostic,
            Some(SessionError::MessageTooLarge {
                size: 11,
                max_size: 10
            })
        );
        assert_eq!(session.buffered_bytes(), 0);
    }

    #[test]
    fn test_refused_subscription_tears_down_and_rescans() {
        let mut session = scanning_session(SessionConfig::default());
        session.handle(ConsumerEvent::CandidateDiscovered {
            candidate: 3,
            rssi: -20,
        });
        session.handle(ConsumerEvent::Connected(3));
        session.handle(ConsumerEvent::CapabilityDiscovered);
        session.handle(ConsumerEvent::ChannelDiscovered);
        assert_eq!(session.state(), SessionState::Subscribing);

        let t = session.handle(ConsumerEvent::DiscoveryFailed {
            stage: DiscoveryStage::Subscription,
            reason: "not permitted".into(),
        });
        assert!(t.effects.contains(&Effect::Disconnect(3)));
        assert!(t.effects.contains(&Effect::SessionEnded { intentional: false }));
        assert_eq!(t.to, SessionState::Scanning);
        assert!(session.link().is_none());
    }

    #[test]
    fn test_remainder_of_oversized_message_is_not_delivered() {
        let mut session = active_session_with(
            SessionConfig::default().with_max_message_bytes(Some(10)),
        );

        session.handle(ConsumerEvent::ChunkReceived(b"0123456789".to_vec()));
        session.handle(ConsumerEvent::ChunkReceived(b"X".to_vec()));
        let t = session.handle(ConsumerEvent::ChunkReceived(b"tail".to_vec()));
        assert!(t.effects.is_empty());
        assert_eq!(session.buffered_bytes(), 0);

        let t = session.handle(ConsumerEvent::ChunkReceived(END_OF_MESSAGE.to_vec()));
        assert!(t.effects.is_empty());

        session.handle(ConsumerEvent::ChunkReceived(b"next".to_vec()));
        let t = session.handle(ConsumerEvent::ChunkReceived(END_OF_MESSAGE.to_vec()));
        assert_eq!(
            t.effects.as_slice(),
            &[Effect::MessageComplete("next".to_string())]
        );
    }

    #[test]
    fn test_reconnect_stops_skipping_oversized_message() {
        let mut session = active_session_with(
            SessionConfig::default().with_max_message_bytes(Some(4)),
        );
        session.handle(ConsumerEvent::ChunkReceived(b"too long".to_vec()));
        assert!(session.discarding);

        session.handle(ConsumerEvent::Disconnected(7));
        assert!(!session.discarding);
    }

    #[test]
    fn test_powered_off_ends_session() {
        let mut session = active_session();
        let t = session.handle(ConsumerEvent::PoweredOff);
        assert_eq!(t.to, SessionState::Idle);
        assert_eq!(
            t.effects.as_slice(),
            &[Effect::SessionEnded { intentional: false }]
        );
        let t = session.handle(ConsumerEvent::Ready);
        assert_eq!(t.to, SessionState::Scanning);
    }

    #[test]
    fn test_stale_disconnect_for_other_link() {
        let mut session = active_session();
        let t = session.handle(ConsumerEvent::Disconnected(99));
        assert_eq!(t.diagnostic, Some(SessionError::StaleSignalIgnored));
        assert_eq!(t.to, SessionState::Active);
    }
}
