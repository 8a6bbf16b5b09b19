//! Producer Task Implementation
//!
//! Owns a [`ProducerSession`] together with the peripheral transport. Chunk
//! writes happen inline while an event is handled; capability and advertising
//! effects are executed afterwards, in order.

use bleconnect_core::{
    PriorPeripheralState, ProducerEffect, ProducerEvent, ProducerSession, ProducerState,
    ProducerStep, SessionConfig,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::config::TaskConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::transport::{EventReceiver, PeripheralTransport};

/// Requests from the application to the producer task
#[derive(Debug, Clone)]
pub enum ProducerCommand {
    SetContent(String),
    SetAdvertising(bool),
    Restore(PriorPeripheralState),
    Shutdown,
}

/// Transfer progress reported to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    Started { bytes: usize },
    Paused { cursor: usize },
    Complete { bytes: usize },
}

impl TransferEvent {
    fn from_effect(effect: &ProducerEffect) -> Option<Self> {
        match *effect {
            ProducerEffect::TransferStarted { bytes } => Some(TransferEvent::Started { bytes }),
            ProducerEffect::TransferPaused { cursor } => Some(TransferEvent::Paused { cursor }),
            ProducerEffect::TransferComplete { bytes } => Some(TransferEvent::Complete { bytes }),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Producer Task
// ----------------------------------------------------------------------------

/// Async driver for the producer role
pub struct ProducerTask<T> {
    session: ProducerSession,
    transport: T,
    events: EventReceiver<ProducerEvent>,
    commands: mpsc::Receiver<ProducerCommand>,
    transfers: broadcast::Sender<TransferEvent>,
    state: watch::Sender<ProducerState>,
    effect_timeout: Duration,
    running: bool,
}

impl<T> ProducerTask<T>
where
    T: PeripheralTransport + 'static,
{
    pub fn new(
        config: SessionConfig,
        task_config: &TaskConfig,
        transport: T,
        events: EventReceiver<ProducerEvent>,
    ) -> (Self, ProducerHandle) {
        let (command_tx, commands) = mpsc::channel(task_config.command_buffer_size);
        let (transfers, _) = broadcast::channel(task_config.app_event_buffer_size);
        let (state, state_rx) = watch::channel(ProducerState::PoweredOff);

        let handle = ProducerHandle {
            commands: command_tx,
            transfers: transfers.clone(),
            state: state_rx,
            task: None,
        };
        let task = Self {
            session: ProducerSession::new(config),
            transport,
            events,
            commands,
            transfers,
            state,
            effect_timeout: task_config.effect_timeout,
            running: true,
        };
        (task, handle)
    }

    pub fn spawn(
        config: SessionConfig,
        task_config: &TaskConfig,
        transport: T,
        events: EventReceiver<ProducerEvent>,
    ) -> ProducerHandle {
        let (task, mut handle) = Self::new(config, task_config, transport, events);
        handle.task = Some(tokio::spawn(task.run()));
        handle
    }

    pub async fn run(mut self) -> RuntimeResult<()> {
        info!("Producer task starting");

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
                        let step = self.session.handle(evt, &mut self.transport);
                        self.apply(step).await;
                    }
                    None => {
                        info!("Transport event channel closed, shutting down");
                        break;
                    }
                },
            }
        }

        info!(state = ?self.session.state(), "Producer task stopped");
        Ok(())
    }

    async fn process_command(&mut self, command: ProducerCommand) {
        let step = match command {
            ProducerCommand::SetContent(text) => self
                .session
                .handle(ProducerEvent::ContentChanged(text), &mut self.transport),
            ProducerCommand::SetAdvertising(enabled) => self.session.set_advertising(enabled),
            ProducerCommand::Restore(prior) => self
                .session
                .handle(ProducerEvent::SessionRestored(prior), &mut self.transport),
            ProducerCommand::Shutdown => {
                self.running = false;
                return;
            }
        };
        self.apply(step).await;
    }

    async fn apply(&mut self, step: ProducerStep) {
        self.state.send_replace(step.to);
        if let Some(diagnostic) = &step.diagnostic {
            debug!(%diagnostic, "Producer diagnostic");
        }

        for effect in step.effects {
            if let Some(event) = TransferEvent::from_effect(&effect) {
                let _ = self.transfers.send(event);
                continue;
            }
            match timeout(self.effect_timeout, self.transport.execute(effect)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Peripheral effect failed: {}", e),
                Err(_) => error!("Peripheral effect timed out"),
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Producer Handle
// ----------------------------------------------------------------------------

/// Application-side handle to a running producer task
pub struct ProducerHandle {
    commands: mpsc::Sender<ProducerCommand>,
    transfers: broadcast::Sender<TransferEvent>,
    state: watch::Receiver<ProducerState>,
    task: Option<JoinHandle<RuntimeResult<()>>>,
}

impl ProducerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.transfers.subscribe()
    }

    pub fn state(&self) -> ProducerState {
        *self.state.borrow()
    }

    /// Replace the published text
    pub async fn set_content(&self, text: impl Into<String>) -> RuntimeResult<()> {
        self.send(ProducerCommand::SetContent(text.into())).await
    }

    pub async fn set_advertising(&self, enabled: bool) -> RuntimeResult<()> {
        self.send(ProducerCommand::SetAdvertising(enabled)).await
    }

    pub async fn restore(&self, prior: PriorPeripheralState) -> RuntimeResult<()> {
        self.send(ProducerCommand::Restore(prior)).await
    }

    /// Wait until the producer reaches `target`
    pub async fn wait_for_state(&self, target: ProducerState, limit: Duration) -> RuntimeResult<()> {
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
            .map_err(|_| RuntimeError::Timeout(format!("producer state {:?}", target)))?
    }

    pub async fn shutdown(mut self) -> RuntimeResult<()> {
        let _ = self.commands.send(ProducerCommand::Shutdown).await;
        match self.task.take() {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }

    async fn send(&self, command: ProducerCommand) -> RuntimeResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }
}
