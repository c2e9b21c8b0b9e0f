use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::config::SessionInfo;
use super::stats::{ParticipantRecord, SessionMetadata, StopReason};
use crate::audio::PcmFormat;
use crate::config::EncoderConfig;
use crate::error::CaptureError;
use crate::gateway::Participant;
use crate::sink::TrackSink;
use crate::track::{ParticipantTrack, TrackSummary};

/// The one active recording of a controller
///
/// Owns every participant track. Track time zero is `started`, the moment
/// the connection became ready.
pub struct Session {
    info: SessionInfo,
    started: Instant,
    pcm: PcmFormat,
    frame_duration: Duration,
    encoder: EncoderConfig,
    tracks: HashMap<String, ParticipantTrack>,
}

impl Session {
    pub fn new(info: SessionInfo, pcm: PcmFormat, frame_duration: Duration, encoder: EncoderConfig) -> Self {
        Self {
            info,
            started: Instant::now(),
            pcm,
            frame_duration,
            encoder,
            tracks: HashMap::new(),
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Track for `participant`, spawning its encoder on first observation
    ///
    /// A spawn failure only affects this participant.
    pub fn ensure_track(&mut self, participant: &Participant) -> Result<&mut ParticipantTrack, CaptureError> {
        match self.tracks.entry(participant.id.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let path = self.info.output_path.join(format!(
                    "{}.{}",
                    participant.file_stem(),
                    self.info.format.extension()
                ));

                let sink = TrackSink::open(
                    path,
                    self.pcm,
                    self.info.format,
                    self.info.bitrate_kbps,
                    &self.encoder,
                )
                .map_err(|e| CaptureError::Encoder(format!("{:#}", e)))?;

                let track = ParticipantTrack::spawn(
                    participant.clone(),
                    Box::new(sink),
                    self.pcm,
                    self.frame_duration,
                    self.started,
                );
                Ok(entry.insert(track))
            }
        }
    }

    pub fn track(&self, participant_id: &str) -> Option<&ParticipantTrack> {
        self.tracks.get(participant_id)
    }

    pub fn track_mut(&mut self, participant_id: &str) -> Option<&mut ParticipantTrack> {
        self.tracks.get_mut(participant_id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &ParticipantTrack> {
        self.tracks.values()
    }

    pub fn tracks_mut(&mut self) -> impl Iterator<Item = &mut ParticipantTrack> {
        self.tracks.values_mut()
    }

    /// Participants with a track who are currently in the channel
    pub fn present_count(&self) -> usize {
        self.tracks.values().filter(|t| t.is_present()).count()
    }

    /// Close every track concurrently
    pub async fn cleanup(&mut self) -> Vec<TrackSummary> {
        info!("Closing {} tracks of session {}", self.tracks.len(), self.info.session_id);

        let mut summaries = join_all(self.tracks.values_mut().map(|track| track.cleanup())).await;
        summaries.sort_by_key(|s| s.created_at_ms);
        summaries
    }

    pub fn metadata(&self, tracks: &[TrackSummary], ended_at: DateTime<Utc>, reason: StopReason) -> SessionMetadata {
        SessionMetadata {
            session_id: self.info.session_id.clone(),
            call_id: self.info.call_id.clone(),
            channel_id: self.info.channel_id.clone(),
            format: self.info.format,
            bitrate_kbps: self.info.bitrate_kbps,
            sample_rate: self.pcm.sample_rate,
            channels: self.pcm.channels,
            started_at: self.info.started_at,
            ended_at,
            duration_secs: self.elapsed().as_secs_f64(),
            stop_reason: reason,
            participants: tracks.iter().map(ParticipantRecord::from_summary).collect(),
        }
    }
}
