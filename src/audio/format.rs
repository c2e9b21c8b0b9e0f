use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Raw PCM layout fed to every encoder in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels (samples are interleaved)
    pub channels: u16,
    /// Bytes per sample (only 2 = signed 16-bit little endian is produced)
    pub sample_width: u16,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000, // Voice gateway decode rate
            channels: 2,        // Stereo
            sample_width: 2,    // s16le
        }
    }
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_width: 2,
        }
    }

    /// Interleaved sample count of one frame of the given duration
    pub fn samples_per_frame(&self, frame: Duration) -> usize {
        let per_channel = (self.sample_rate as u128 * frame.as_micros()) / 1_000_000;
        per_channel as usize * self.channels as usize
    }

    pub fn bytes_per_frame(&self, frame: Duration) -> usize {
        self.samples_per_frame(frame) * self.sample_width as usize
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * self.sample_width as u64
    }

    /// Playback duration of `bytes` of raw PCM in this format
    pub fn duration_of_bytes(&self, bytes: u64) -> Duration {
        let per_second = self.bytes_per_second();
        if per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes as f64 / per_second as f64)
    }

    /// Raw demuxer name understood by the encoder
    pub fn sample_format_name(&self) -> &'static str {
        "s16le"
    }
}

/// Origin of a frame written to a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameSource {
    /// Generated filler
    Silence,
    /// Decoded live voice
    Voice,
}

/// One fixed-duration block of audio (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Offset in milliseconds since the producing track started
    pub timestamp_ms: u64,
    /// Whether this frame carries silence or voice
    pub source: FrameSource,
}

impl AudioFrame {
    pub fn silence(sample_count: usize, timestamp_ms: u64) -> Self {
        Self {
            samples: vec![0; sample_count],
            timestamp_ms,
            source: FrameSource::Silence,
        }
    }

    pub fn voice(samples: Vec<i16>, timestamp_ms: u64) -> Self {
        Self {
            samples,
            timestamp_ms,
            source: FrameSource::Voice,
        }
    }

    /// Encoder input bytes (s16le)
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Container/codec written for each track
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Uncompressed PCM in a WAV container
    Wav,
    /// Lossless FLAC
    Flac,
    /// MP3 (libmp3lame)
    Mp3,
    /// Opus in an Ogg container
    #[default]
    Opus,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Flac => "flac",
            Self::Mp3 => "mp3",
            Self::Opus => "ogg",
        }
    }

    pub fn is_lossless(&self) -> bool {
        matches!(self, Self::Wav | Self::Flac)
    }

    /// Encoder codec name
    pub fn codec(&self) -> &'static str {
        match self {
            Self::Wav => "pcm_s16le",
            Self::Flac => "flac",
            Self::Mp3 => "libmp3lame",
            Self::Opus => "libopus",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Wav => "wav",
            Self::Flac => "flac",
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes_for_default_format() {
        let format = PcmFormat::default();
        let frame = Duration::from_millis(20);

        // 48kHz stereo, 20ms = 960 samples per channel
        assert_eq!(format.samples_per_frame(frame), 1920);
        assert_eq!(format.bytes_per_frame(frame), 3840);
        assert_eq!(format.bytes_per_second(), 192_000);
    }

    #[test]
    fn test_duration_of_bytes() {
        let format = PcmFormat::new(16000, 1);
        let duration = format.duration_of_bytes(32_000);
        assert!((duration.as_secs_f64() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_silence_frame_is_zeroed() {
        let frame = AudioFrame::silence(4, 40);
        assert_eq!(frame.samples, vec![0; 4]);
        assert_eq!(frame.source, FrameSource::Silence);
        assert_eq!(frame.to_le_bytes(), vec![0; 8]);
    }

    #[test]
    fn test_output_format_properties() {
        assert_eq!(OutputFormat::default(), OutputFormat::Opus);
        assert!(OutputFormat::Wav.is_lossless());
        assert!(!OutputFormat::Opus.is_lossless());
        assert_eq!(OutputFormat::Opus.extension(), "ogg");
    }
}
