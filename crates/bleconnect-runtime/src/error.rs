//! Runtime and transport error types

/// Failures reported by a transport while carrying out an effect
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("No link to {0}")]
    UnknownLink(String),

    #[error("Radio is not powered")]
    PoweredOff,

    #[error("Operation rejected: {0}")]
    Rejected(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Event channel closed")]
    ChannelClosed,
}

/// Errors surfaced by the async drivers
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Task command channel closed")]
    ChannelClosed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
