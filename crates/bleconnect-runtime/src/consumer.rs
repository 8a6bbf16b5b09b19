//! Consumer Task Implementation
//!
//! Owns a [`ConsumerSession`] and feeds it one event at a time, executing the
//! resulting transport effects before the next event is taken. Application
//! signals are fanned out on a broadcast channel.

use core::fmt;
use std::collections::VecDeque;

use bleconnect_core::{
    ConsumerEvent, ConsumerSession, DiscoveryStage, Effect, PriorLinkState, SessionConfig, SessionError,
    SessionState, Transition,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::config::TaskConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::transport::{CentralTransport, EventReceiver};

// ----------------------------------------------------------------------------
// Commands and Application Events
// ----------------------------------------------------------------------------

/// Requests from the application to the consumer task
#[derive(Debug, Clone)]
pub enum ConsumerCommand<C> {
    /// Tear the session down on purpose
    Disconnect,
    /// Hand back what the platform kept across a restore
    Restore(PriorLinkState<C>),
    /// Leave `Failed`/`Disconnected` and scan again
    Reset,
    Shutdown,
}

/// Signals for the application layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    SessionActive,
    MessageComplete(String),
    Disconnected { intentional: bool },
    SessionFailed(SessionError),
    SignalStrength { rssi: i16, accepted: bool },
}

impl AppEvent {
    fn from_effect<C>(effect: Effect<C>) -> Option<Self> {
        match effect {
            Effect::SessionActive => Some(AppEvent::SessionActive),
            Effect::MessageComplete(message) => Some(AppEvent::MessageComplete(message)),
            Effect::SessionEnded { intentional } => Some(AppEvent::Disconnected { intentional }),
            Effect::SessionFailed(err) => Some(AppEvent::SessionFailed(err)),
            Effect::SignalStrength { rssi, accepted } => {
                Some(AppEvent::SignalStrength { rssi, accepted })
            }
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Consumer Task
// ----------------------------------------------------------------------------

/// Async driver for the consumer role
pub struct ConsumerTask<C, T> {
    session: ConsumerSession<C>,
    transport: T,
    events: EventReceiver<ConsumerEvent<C>>,
    commands: mpsc::Receiver<ConsumerCommand<C>>,
    app_events: broadcast::Sender<AppEvent>,
    state: watch::Sender<SessionState>,
    effect_timeout: Duration,
    running: bool,
}

impl<C, T> ConsumerTask<C, T>
where
    C: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
    T: CentralTransport<C> + 'static,
{
    /// Build the task and the handle that controls it
    pub fn new(
        config: SessionConfig,
        task_config: &TaskConfig,
        transport: T,
        events: EventReceiver<ConsumerEvent<C>>,
    ) -> (Self, ConsumerHandle<C>) {
        let (command_tx, commands) = mpsc::channel(task_config.command_buffer_size);
        let (app_events, _) = broadcast::channel(task_config.app_event_buffer_size);
        let (state, state_rx) = watch::channel(SessionState::Idle);

        let handle = ConsumerHandle {
            commands: command_tx,
            app_events: app_events.clone(),
            state: state_rx,
            task: None,
        };
        let task = Self {
            session: ConsumerSession::new(config),
            transport,
            events,
            commands,
            app_events,
            state,
            effect_timeout: task_config.effect_timeout,
            running: true,
        };
        (task, handle)
    }

    /// Build the task and run it on the tokio runtime
    pub fn spawn(
        config: SessionConfig,
        task_config: &TaskConfig,
        transport: T,
        events: EventReceiver<ConsumerEvent<C>>,
    ) -> ConsumerHandle<C> {
        let (task, mut handle) = Self::new(config, task_config, transport, events);
        handle.task = Some(tokio::spawn(task.run()));
        handle
    }

    /// Run the task loop until shutdown or until a channel closes
    pub async fn run(mut self) -> RuntimeResult<()> {
        info!("Consumer task starting");

        while self.running {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(cmd) => self.process_command(cmd).await,
                    None => {
                        info!("Command channel closed, shutting down");
                        break;
                    }
                },

                event = self.events.recv() => match event {
                    Some(evt) => {
                        let transition = self.session.handle(evt);
                        self.apply(transition).await;
                    }
                    None => {
                        info!("Transport event channel closed, shutting down");
                        break;
                    }
                },
            }
        }

        info!(state = %self.session.state(), "Consumer task stopped");
        Ok(())
    }

    async fn process_command(&mut self, command: ConsumerCommand<C>) {
        debug!(?command, "Consumer command");
        let transition = match command {
            ConsumerCommand::Disconnect => self.session.disconnect(),
            ConsumerCommand::Restore(prior) => {
                self.session.handle(ConsumerEvent::SessionRestored(prior))
            }
            ConsumerCommand::Reset => self.session.reset(),
            ConsumerCommand::Shutdown => {
                self.shutdown_link().await;
                self.running = false;
                return;
            }
        };
        self.apply(transition).await;
    }

    /// Tear the session down without waiting for the transport's replies
    async fn shutdown_link(&mut self) {
        let transition = self.session.disconnect();
        self.apply(transition).await;
        // An unsubscribe is still pending; nobody will be left to finish it.
        if let Some(link) = self.session.link().cloned() {
            let disconnect = self.transport.execute(Effect::Disconnect(link));
            match timeout(self.effect_timeout, disconnect).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Disconnect on shutdown failed: {}", e),
                Err(_) => warn!("Disconnect on shutdown timed out"),
            }
        }
    }

    /// Apply a transition, feeding failed transport effects back into the
    /// session until nothing is left to report
    async fn apply(&mut self, transition: Transition<C>) {
        let mut failures = VecDeque::new();
        let mut transition = transition;
        loop {
            self.apply_one(transition, &mut failures).await;
            match failures.pop_front() {
                Some(event) => transition = self.session.handle(event),
                None => break,
            }
        }
    }

    async fn apply_one(
        &mut self,
        transition: Transition<C>,
        failures: &mut VecDeque<ConsumerEvent<C>>,
    ) {
        let Transition {
            to,
            effects,
            diagnostic,
            ..
        } = transition;

        self.state.send_replace(to);
        if let Some(diagnostic) = diagnostic {
            debug!(%diagnostic, "Session diagnostic");
        }

        for effect in effects {
            if effect.is_transport() {
                let attempted = effect.clone();
                let reason = match timeout(self.effect_timeout, self.transport.execute(effect)).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => {
                        warn!("Transport effect failed: {}", e);
                        e.to_string()
                    }
                    Err(_) => {
                        error!("Transport effect timed out");
                        format!("timed out after {:?}", self.effect_timeout)
                    }
                };
                if let Some(event) = failure_event(attempted, reason) {
                    failures.push_back(event);
                }
            } else if let Some(app_event) = AppEvent::from_effect(effect) {
                // No subscribers is not an error.
                let _ = self.app_events.send(app_event);
            }
        }
    }
}

/// Event reporting that the transport could not carry out `effect`
fn failure_event<C>(effect: Effect<C>, reason: String) -> Option<ConsumerEvent<C>> {
    match effect {
        Effect::Connect(candidate) => Some(ConsumerEvent::ConnectFailed { candidate, reason }),
        Effect::DiscoverCapability { .. } => Some(ConsumerEvent::DiscoveryFailed {
            stage: DiscoveryStage::Capability,
            reason,
        }),
        Effect::DiscoverChannel { .. } => Some(ConsumerEvent::DiscoveryFailed {
            stage: DiscoveryStage::Channel,
            reason,
        }),
        Effect::Subscribe { .. } => Some(ConsumerEvent::DiscoveryFailed {
            stage: DiscoveryStage::Subscription,
            reason,
        }),
        // Skip the handshake and drop the link.
        Effect::Unsubscribe { .. } => Some(ConsumerEvent::NotifyingStateChanged(false)),
        // The link is treated as gone either way.
        Effect::Disconnect(link) => Some(ConsumerEvent::Disconnected(link)),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// Consumer Handle
// ----------------------------------------------------------------------------

/// Application-side handle to a running consumer task
pub struct ConsumerHandle<C> {
    commands: mpsc::Sender<ConsumerCommand<C>>,
    app_events: broadcast::Sender<AppEvent>,
    state: watch::Receiver<SessionState>,
    task: Option<JoinHandle<RuntimeResult<()>>>,
}

impl<C> ConsumerHandle<C>
where
    C: Send + 'static,
{
    /// Receive application events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.app_events.subscribe()
    }

    /// Latest session state published by the task
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `target`
    pub async fn wait_for_state(
        &self,
        target: SessionState,
        limit: Duration,
    ) -> RuntimeResult<()> {
        let mut state = self.state.clone();
        let wait = async {
            loop {
                if *state.borrow_and_update() == target {
                    return Ok(());
                }
                if state.changed().await.is_err() {
                    return Err(RuntimeError::ChannelClosed);
                }
            }
        };
        timeout(limit, wait)
            .await
            .map_err(|_| RuntimeError::Timeout(format!("session state {}", target)))?
    }

    pub async fn disconnect(&self) -> RuntimeResult<()> {
        self.send(ConsumerCommand::Disconnect).await
    }

    pub async fn restore(&self, prior: PriorLinkState<C>) -> RuntimeResult<()> {
        self.send(ConsumerCommand::Restore(prior)).await
    }

    pub async fn reset(&self) -> RuntimeResult<()> {
        self.send(ConsumerCommand::Reset).await
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(mut self) -> RuntimeResult<()> {
        // The task may already have stopped on its own.
        let _ = self.commands.send(ConsumerCommand::Shutdown).await;
        match self.task.take() {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }

    async fn send(&self, command: ConsumerCommand<C>) -> RuntimeResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }
}
