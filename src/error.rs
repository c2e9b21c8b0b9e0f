use thiserror::Error;

use crate::gateway::GatewayError;
use crate::registry::RegistryError;

/// Session-scoped failures surfaced to callers of start/stop
///
/// Failures local to one track (a single encoder) never reach this type;
/// they are logged and the session carries on.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Nothing was started and no state was left behind
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("encoder failure: {0}")]
    Encoder(String),

    #[error("call {call_id} is already being recorded by live process {owner_pid}")]
    RegistryConflict { call_id: String, owner_pid: u32 },

    #[error("session for call {call_id} (pid {owner_pid}) did not stop in time")]
    RemoteStopTimeout { call_id: String, owner_pid: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CaptureError {
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_) | Self::RegistryConflict { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<GatewayError> for CaptureError {
    fn from(e: GatewayError) -> Self {
        if e.is_precondition() {
            Self::Precondition(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<RegistryError> for CaptureError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Conflict { call_id, owner_pid } => Self::RegistryConflict { call_id, owner_pid },
            RegistryError::Io(e) => Self::Other(e),
        }
    }
}
