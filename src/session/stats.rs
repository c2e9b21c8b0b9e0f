use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::audio::OutputFormat;
use crate::sink::{EncoderExit, SinkVerdict};
use crate::track::{TrackSummary, Window};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Stop requested in this process (Ctrl-C, API call)
    Local,
    /// Stop marker written by another process
    RemoteRequest,
    /// Last human participant left
    ChannelEmpty,
    ReconnectFailed,
    ConnectionDestroyed,
    /// Event stream of the connection ended
    ConnectionClosed,
}

/// One participant's entry in `session.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: String,
    pub display_name: String,

    /// Track creation, ms after session start
    pub offset_ms: u64,

    /// Track length in seconds
    pub duration_secs: f64,

    /// Presence windows, ms after session start
    pub presence: Vec<Window>,

    /// Speaking windows, ms after session start
    pub voice: Vec<Window>,

    pub voice_frames: u64,
    pub silence_frames: u64,

    /// Output file name inside the session directory, if kept
    pub file: Option<String>,

    /// Why the output file was discarded
    pub discarded: Option<String>,

    pub encoder_exit: Option<EncoderExit>,
}

impl ParticipantRecord {
    pub fn from_summary(summary: &TrackSummary) -> Self {
        let sink = summary.sink.as_ref();
        let file = sink
            .filter(|outcome| outcome.is_kept())
            .and_then(|outcome| outcome.path.file_name())
            .map(|name| name.to_string_lossy().into_owned());
        let discarded = match sink.map(|outcome| &outcome.verdict) {
            Some(SinkVerdict::Discarded { reason }) => Some(reason.clone()),
            Some(SinkVerdict::Kept) => None,
            None => Some("track pump failed".to_string()),
        };

        Self {
            id: summary.participant.id.clone(),
            display_name: summary.participant.display_name.clone(),
            offset_ms: summary.created_at_ms,
            duration_secs: summary.closed_at_ms.saturating_sub(summary.created_at_ms) as f64 / 1000.0,
            presence: summary.presence.clone(),
            voice: summary.voice.clone(),
            voice_frames: summary.voice_frames,
            silence_frames: summary.silence_frames,
            file,
            discarded,
            encoder_exit: sink.map(|outcome| outcome.exit.clone()),
        }
    }
}

/// Contents of `session.json`, written into the session directory on stop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub call_id: String,
    pub channel_id: String,
    pub format: OutputFormat,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub stop_reason: StopReason,
    pub participants: Vec<ParticipantRecord>,
}

impl SessionMetadata {
    pub const FILE_NAME: &'static str = "session.json";

    /// Write `session.json` into `dir`
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(Self::FILE_NAME);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize session metadata")?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("Invalid session metadata {}", path.display()))
    }

    /// Past sessions under an output directory, newest first
    pub fn list(output_dir: &Path) -> Result<Vec<(PathBuf, SessionMetadata)>> {
        let mut sessions = Vec::new();

        let entries =
            fs::read_dir(output_dir).with_context(|| format!("Failed to list {}", output_dir.display()))?;
        for entry in entries {
            let dir = entry?.path();
            let path = dir.join(Self::FILE_NAME);
            if !path.is_file() {
                continue;
            }
            match Self::load(&path) {
                Ok(metadata) => sessions.push((dir, metadata)),
                Err(e) => warn!("Skipping {}: {:#}", path.display(), e),
            }
        }

        sessions.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));
        Ok(sessions)
    }

    pub fn kept_files(&self) -> usize {
        self.participants.iter().filter(|p| p.file.is_some()).count()
    }
}

/// Result of a completed session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub metadata: SessionMetadata,
    /// Where `session.json` was written, if it could be
    pub metadata_path: Option<PathBuf>,
    pub tracks: Vec<TrackSummary>,
}

impl SessionReport {
    pub fn track(&self, participant_id: &str) -> Option<&TrackSummary> {
        self.tracks.iter().find(|t| t.participant.id == participant_id)
    }
}
