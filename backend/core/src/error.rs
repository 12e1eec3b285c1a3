use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the Armada runtime.
#[derive(Debug, Error)]
pub enum ArmadaError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("agent '{0}' not found")]
    AgentNotFound(Uuid),

    #[error("agent is already connected")]
    AgentAlreadyConnected,

    #[error("you need to log in first")]
    LoginRequired,

    #[error("software '{0}' not found")]
    SoftwareNotFound(Uuid),

    #[error("this software isn't installed on this agent")]
    ForeignSoftware,

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
