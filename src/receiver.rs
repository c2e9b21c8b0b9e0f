//! Speaker notifications to track source switches

use std::time::Duration;
use tracing::debug;

use crate::audio::DecoderFactory;
use crate::error::CaptureError;
use crate::gateway::{Participant, VoiceConnection};
use crate::session::Session;

/// Attaches live voice to tracks on speaker-start and detaches on speaker-stop
pub struct CaptureReceiver {
    trailing_silence: Duration,
    decoders: DecoderFactory,
}

impl CaptureReceiver {
    pub fn new(trailing_silence: Duration, decoders: DecoderFactory) -> Self {
        Self {
            trailing_silence,
            decoders,
        }
    }

    /// Humans other than the recorder itself
    pub fn accepts(&self, participant: &Participant, self_id: &str) -> bool {
        !participant.is_bot && participant.id != self_id
    }

    /// Route a participant's live voice into their track
    ///
    /// Creates the track on first observation. Returns whether a new source
    /// was attached; an already-speaking track is left alone.
    pub async fn speaker_started(
        &self,
        connection: &dyn VoiceConnection,
        session: &mut Session,
        participant: &Participant,
    ) -> Result<bool, CaptureError> {
        if !self.accepts(participant, connection.self_id()) {
            debug!("Ignoring speech from {}", participant.id);
            return Ok(false);
        }

        let track = session.ensure_track(participant)?;
        if track.is_speaking() {
            debug!("{} is already attached", participant.id);
            return Ok(false);
        }

        let source = connection
            .subscribe_speaker(&participant.id, self.trailing_silence)
            .await?;
        let attached = track.attach(source, (self.decoders)()).await?;
        Ok(attached)
    }

    /// Revert a participant's track to silence
    pub async fn speaker_stopped(&self, session: &mut Session, participant_id: &str) -> Result<(), CaptureError> {
        if let Some(track) = session.track_mut(participant_id) {
            track.detach().await?;
        }
        Ok(())
    }
}
