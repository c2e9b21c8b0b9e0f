//! Encoder-backed track output
//!
//! A sink turns the continuous frame stream of one participant into one
//! file on disk:
//! - `TrackSink` drives one external encoder process per track
//! - `EncoderCommand` builds the encoder invocation
//! - `SinkOutcome` reports how the file ended up after close

mod encoder;
mod track_sink;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::AudioFrame;

pub use encoder::{ensure_encoder_available, EncoderCommand};
pub use track_sink::TrackSink;

/// Destination of a track's frame stream
#[async_trait]
pub trait FrameSink: Send {
    /// Queue one frame; never blocks the caller and never drops
    fn write(&mut self, frame: &AudioFrame);

    /// End input, wait for the output to settle and validate it
    async fn close(self: Box<Self>) -> SinkOutcome;

    /// Output file this sink produces
    fn path(&self) -> &Path;
}

/// How the encoder process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncoderExit {
    /// Exited with status 0
    Clean,
    /// Exited on its own with a failure status (None = killed by a signal)
    Failed { code: Option<i32> },
    /// Did not finish within the grace period and was killed
    Killed,
}

/// What happened to the output file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum SinkVerdict {
    Kept,
    Discarded { reason: String },
}

/// Result of closing a sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkOutcome {
    pub path: PathBuf,
    /// Frames handed to the sink
    pub frames_written: u64,
    /// Bytes handed to the sink
    pub bytes_written: u64,
    /// Bytes the encoder actually accepted on its input
    pub bytes_delivered: u64,
    pub exit: EncoderExit,
    pub verdict: SinkVerdict,
    /// Duration read back from the output file, if it could be estimated
    pub estimated_duration_secs: Option<f64>,
}

impl SinkOutcome {
    pub fn is_kept(&self) -> bool {
        self.verdict == SinkVerdict::Kept
    }
}
