//! Boundary to the real-time voice session layer
//!
//! The transport that joins a group call is not part of this crate. It is
//! consumed through these traits:
//! - `VoiceGateway` joins a call/channel and yields a `Connection`
//! - `VoiceConnection` exposes members, per-speaker live audio and reconnection
//! - `ConnectionEvent` carries readiness, connectivity, presence and speaker signals
//!
//! `ScriptedGateway` is an in-process implementation driven by a JSON script.

mod scripted;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use scripted::{JoinFailure, Script, ScriptAction, ScriptedGateway, TimedAction};

/// A member of the call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub is_bot: bool,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            is_bot: false,
        }
    }

    pub fn bot(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            is_bot: true,
            ..Self::new(id, display_name)
        }
    }

    /// File name stem: `<id>_<display name reduced to safe characters>`
    pub fn file_stem(&self) -> String {
        let safe_name: String = self
            .display_name
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
            .collect::<String>()
            .trim()
            .replace(' ', "_");

        let safe_id = crate::registry::safe_component(&self.id);
        if safe_name.is_empty() {
            safe_id
        } else {
            format!("{}_{}", safe_id, safe_name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    Joined,
    Left,
}

/// Notifications delivered by a live connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection can receive audio
    Ready,
    /// Transport dropped; reconnection may succeed
    Disconnected,
    /// Connection is gone for good
    Destroyed,
    Presence {
        participant: Participant,
        change: PresenceChange,
    },
    SpeakerStart {
        participant: Participant,
    },
    SpeakerStop {
        participant_id: String,
    },
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("missing permission to join channel {0}")]
    PermissionDenied(String),

    #[error("channel {0} is full")]
    ChannelFull(String),

    #[error("unknown call or channel: {0}")]
    NotFound(String),

    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("voice stream error: {0}")]
    Stream(String),
}

impl GatewayError {
    /// Errors that mean the target cannot be recorded at all
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::ChannelFull(_) | Self::NotFound(_))
    }
}

/// Compressed voice packets of one speaker; ends after trailing silence
pub type LiveAudioSource = BoxStream<'static, Result<Vec<u8>, GatewayError>>;

/// Result of a successful join
pub struct Connection {
    pub handle: Box<dyn VoiceConnection>,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Join a channel of a call
    async fn join(&self, call_id: &str, channel_id: &str) -> Result<Connection, GatewayError>;

    /// Gateway name for logging
    fn name(&self) -> &str;
}

#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Identity of the recorder itself inside the call
    fn self_id(&self) -> &str;

    /// Participants currently in the channel
    async fn members(&self) -> Result<Vec<Participant>, GatewayError>;

    /// Live audio of one speaker, ending after `trailing_silence` of quiet
    async fn subscribe_speaker(
        &self,
        participant_id: &str,
        trailing_silence: Duration,
    ) -> Result<LiveAudioSource, GatewayError>;

    /// Re-establish a dropped transport; resolves once ready again
    async fn reconnect(&self) -> Result<(), GatewayError>;

    async fn disconnect(&self);
}
