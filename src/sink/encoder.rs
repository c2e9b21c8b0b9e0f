use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::audio::{OutputFormat, PcmFormat};
use crate::config::EncoderConfig;

/// Resolve the encoder binary once, before any session starts
pub fn ensure_encoder_available(program: &str) -> Result<PathBuf> {
    which::which(program).with_context(|| format!("Encoder binary '{}' was not found on PATH", program))
}

/// Fully rendered encoder invocation for one track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    program: String,
    args: Vec<String>,
}

impl EncoderCommand {
    pub fn build(
        config: &EncoderConfig,
        pcm: PcmFormat,
        output: OutputFormat,
        bitrate_kbps: u32,
        path: &Path,
    ) -> Self {
        let args = match &config.args {
            Some(template) => template
                .iter()
                .map(|arg| render(arg, pcm, output, bitrate_kbps, path))
                .collect(),
            None => ffmpeg_args(pcm, output, bitrate_kbps, path),
        };

        Self {
            program: config.program.clone(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

fn render(arg: &str, pcm: PcmFormat, output: OutputFormat, bitrate_kbps: u32, path: &Path) -> String {
    arg.replace("{sample_rate}", &pcm.sample_rate.to_string())
        .replace("{channels}", &pcm.channels.to_string())
        .replace("{sample_format}", pcm.sample_format_name())
        .replace("{codec}", output.codec())
        .replace("{bitrate}", &bitrate_kbps.to_string())
        .replace("{output}", &path.to_string_lossy())
}

/// Raw PCM on stdin, one encoded file out
fn ffmpeg_args(pcm: PcmFormat, output: OutputFormat, bitrate_kbps: u32, path: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        pcm.sample_format_name().into(),
        "-ar".into(),
        pcm.sample_rate.to_string(),
        "-ac".into(),
        pcm.channels.to_string(),
        "-i".into(),
        "pipe:0".into(),
        "-c:a".into(),
        output.codec().into(),
    ];

    // Lossless codecs ignore a target bitrate
    if !output.is_lossless() {
        args.push("-b:a".into());
        args.push(format!("{}k", bitrate_kbps));
    }

    args.push("-y".into());
    args.push(path.to_string_lossy().into_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ffmpeg_arguments() {
        let config = EncoderConfig::default();
        let command = EncoderCommand::build(
            &config,
            PcmFormat::default(),
            OutputFormat::Opus,
            96,
            Path::new("/tmp/alice.ogg"),
        );

        assert_eq!(command.program(), "ffmpeg");
        let args = command.args().join(" ");
        assert!(args.contains("-f s16le -ar 48000 -ac 2 -i pipe:0"));
        assert!(args.contains("-c:a libopus -b:a 96k"));
        assert!(args.ends_with("-y /tmp/alice.ogg"));
    }

    #[test]
    fn test_lossless_has_no_bitrate() {
        let command = EncoderCommand::build(
            &EncoderConfig::default(),
            PcmFormat::default(),
            OutputFormat::Flac,
            96,
            Path::new("/tmp/bob.flac"),
        );
        assert!(!command.args().iter().any(|a| a == "-b:a"));
        assert!(command.args().iter().any(|a| a == "flac"));
    }

    #[test]
    fn test_template_placeholders() {
        let config = EncoderConfig {
            program: "sh".into(),
            args: Some(vec![
                "-c".into(),
                "cat > \"$0\"".into(),
                "{output}".into(),
                "{sample_rate}/{channels}/{codec}/{bitrate}".into(),
            ]),
            ..EncoderConfig::default()
        };
        let command = EncoderCommand::build(
            &config,
            PcmFormat::new(16000, 1),
            OutputFormat::Mp3,
            128,
            Path::new("/out/track.mp3"),
        );

        assert_eq!(
            command.args(),
            &["-c", "cat > \"$0\"", "/out/track.mp3", "16000/1/libmp3lame/128"]
        );
    }

    #[test]
    fn test_missing_encoder_is_reported() {
        let err = ensure_encoder_available("loqa-no-such-encoder-binary").unwrap_err();
        assert!(err.to_string().contains("loqa-no-such-encoder-binary"));
    }
}
