use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::audio::OutputFormat;

/// Parameters of a capture request
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Call (server/guild) to record
    pub call_id: String,

    /// Voice channel inside the call
    pub channel_id: String,

    /// Parent directory; each session gets its own subdirectory
    pub output_dir: PathBuf,

    pub format: OutputFormat,

    pub bitrate_kbps: u32,
}

impl StartRequest {
    pub fn new(call_id: impl Into<String>, channel_id: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            call_id: call_id.into(),
            channel_id: channel_id.into(),
            output_dir: output_dir.into(),
            format: OutputFormat::default(),
            bitrate_kbps: 96,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_bitrate(mut self, bitrate_kbps: u32) -> Self {
        self.bitrate_kbps = bitrate_kbps;
        self
    }
}

/// Identity of a started session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// `<call_id>_<YYYYmmdd_HHMMSS>`
    pub session_id: String,
    pub call_id: String,
    pub channel_id: String,
    /// Directory holding the session's track files
    pub output_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub format: OutputFormat,
    pub bitrate_kbps: u32,
}
