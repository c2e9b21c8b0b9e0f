use anyhow::{bail, Context, Result};
use hound::WavReader;
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use super::format::OutputFormat;

/// Estimate the playable duration of an encoded track file
///
/// WAV files are read from their header. Other containers are probed for a
/// frame count; when the container does not carry one the size is divided
/// by the nominal bitrate.
pub fn estimate_duration(path: impl AsRef<Path>, format: OutputFormat, bitrate_kbps: u32) -> Result<Duration> {
    let path = path.as_ref();

    if format == OutputFormat::Wav {
        return wav_duration(path);
    }

    match container_duration(path, format) {
        Ok(Some(duration)) => Ok(duration),
        Ok(None) => bitrate_duration(path, bitrate_kbps),
        Err(e) => {
            debug!("Container probe failed for {}: {:#}", path.display(), e);
            bitrate_duration(path, bitrate_kbps)
        }
    }
}

fn wav_duration(path: &Path) -> Result<Duration> {
    let reader = WavReader::open(path).context("Failed to open WAV file")?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        bail!("WAV header reports a zero sample rate");
    }

    // duration() counts samples per channel
    Ok(Duration::from_secs_f64(reader.duration() as f64 / spec.sample_rate as f64))
}

fn container_duration(path: &Path, format: OutputFormat) -> Result<Option<Duration>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let stream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    hint.with_extension(format.extension());

    let probed = symphonia::default::get_probe()
        .format(&hint, stream, &FormatOptions::default(), &MetadataOptions::default())
        .context("Unrecognised container")?;

    let Some(track) = probed.format.default_track() else {
        return Ok(None);
    };

    let params = &track.codec_params;
    match (params.n_frames, params.sample_rate) {
        (Some(frames), Some(rate)) if rate > 0 => {
            Ok(Some(Duration::from_secs_f64(frames as f64 / rate as f64)))
        }
        _ => Ok(None),
    }
}

fn bitrate_duration(path: &Path, bitrate_kbps: u32) -> Result<Duration> {
    if bitrate_kbps == 0 {
        bail!("Cannot estimate duration without a bitrate");
    }
    let size = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    let bytes_per_second = bitrate_kbps as f64 * 1000.0 / 8.0;
    Ok(Duration::from_secs_f64(size as f64 / bytes_per_second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_wav_duration_from_header() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("one-second.wav");

        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec)?;
        for _ in 0..(8000 * 2) {
            writer.write_sample(0i16)?;
        }
        writer.finalize()?;

        let duration = estimate_duration(&path, OutputFormat::Wav, 0)?;
        assert!((duration.as_secs_f64() - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_falls_back_to_bitrate() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("opaque.ogg");
        // 64kbps = 8000 bytes per second
        std::fs::write(&path, vec![0u8; 16_000])?;

        let duration = estimate_duration(&path, OutputFormat::Opus, 64)?;
        assert!((duration.as_secs_f64() - 2.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(estimate_duration("/nonexistent/track.wav", OutputFormat::Wav, 0).is_err());
        assert!(estimate_duration("/nonexistent/track.mp3", OutputFormat::Mp3, 128).is_err());
    }
}
