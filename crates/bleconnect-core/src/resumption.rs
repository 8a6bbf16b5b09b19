//! Session resumption after the process is restored
//!
//! The platform may keep a link alive while the application is suspended and
//! hand it back on restore. Restoring must not repeat work the link has
//! already done: a subscribed link goes straight to `Active` without another
//! discovery or subscribe round trip.

use core::fmt;

use tracing::{debug, info};

use crate::consumer::{ConsumerSession, Effect, SessionState, Transition};
use crate::errors::SessionError;

pub use crate::producer::PriorPeripheralState;

/// What the platform still knows about the consumer's link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorLinkState<C> {
    /// Nothing survived; behave like a fresh start
    None,
    /// Link connected but the subscription was never confirmed
    Connected { candidate: C },
    /// Link connected and subscribed to the channel
    Subscribed { candidate: C },
}

impl<C> PriorLinkState<C> {
    pub fn candidate(&self) -> Option<&C> {
        match self {
            PriorLinkState::None => None,
            PriorLinkState::Connected { candidate } | PriorLinkState::Subscribed { candidate } => {
                Some(candidate)
            }
        }
    }
}

impl<C> ConsumerSession<C>
where
    C: Clone + PartialEq + fmt::Debug,
{
    pub(crate) fn on_session_restored(&mut self, prior: PriorLinkState<C>, t: &mut Transition<C>) {
        if !matches!(self.state, SessionState::Idle | SessionState::Scanning) {
            debug!(state = %self.state, "Restore while a session is in progress");
            t.diagnostic = Some(SessionError::StaleSignalIgnored);
            return;
        }

        match prior {
            PriorLinkState::None => {
                debug!("Nothing to restore");
            }
            PriorLinkState::Connected { candidate } => {
                info!(link = ?candidate, "Restored connected link, rediscovering");
                self.stop_scan(t);
                self.intentional = false;
                self.enter_connected(candidate, t);
            }
            PriorLinkState::Subscribed { candidate } => {
                info!(link = ?candidate, "Restored subscribed link");
                self.stop_scan(t);
                self.release_link();
                self.intentional = false;
                self.link = Some(candidate);
                self.channel_known = true;
                self.state = SessionState::Active;
                t.push(Effect::SessionActive);
            }
        }
    }
}
