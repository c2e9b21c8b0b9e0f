use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::encoder::EncoderCommand;
use super::{EncoderExit, FrameSink, SinkOutcome, SinkVerdict};
use crate::audio::{estimate_duration, AudioFrame, OutputFormat, PcmFormat};
use crate::config::EncoderConfig;

/// Relative drift between written and encoded duration worth a warning
const DURATION_DRIFT_WARN: f64 = 0.10;

/// One encoder process writing one track file
///
/// Frames are queued on an unbounded channel and fed to the encoder's stdin
/// by a dedicated writer task, so `write` never blocks and a slow encoder
/// grows memory instead of losing audio.
pub struct TrackSink {
    path: PathBuf,
    pcm: PcmFormat,
    output: OutputFormat,
    bitrate_kbps: u32,
    close_grace: Duration,
    min_output_bytes: u64,
    queue: Option<mpsc::UnboundedSender<Vec<u8>>>,
    writer: Option<JoinHandle<u64>>,
    child: Option<Child>,
    frames_written: u64,
    bytes_written: u64,
}

impl TrackSink {
    /// Spawn the encoder for `path`
    pub fn open(
        path: impl Into<PathBuf>,
        pcm: PcmFormat,
        output: OutputFormat,
        bitrate_kbps: u32,
        encoder: &EncoderConfig,
    ) -> Result<Self> {
        let path = path.into();
        let command = EncoderCommand::build(encoder, pcm, output, bitrate_kbps, &path);

        let mut child = command
            .to_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to spawn encoder '{}' for {}",
                    command.program(),
                    path.display()
                )
            })?;

        let stdin = child.stdin.take().context("Encoder stdin was not captured")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_encoder_stderr(stderr, path.clone()));
        }

        let (queue, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(feed_encoder(stdin, rx, path.clone()));

        info!(
            "Track sink opened: {} ({}, {}Hz, {} channels, pid {:?})",
            path.display(),
            output,
            pcm.sample_rate,
            pcm.channels,
            child.id()
        );

        Ok(Self {
            path,
            pcm,
            output,
            bitrate_kbps,
            close_grace: encoder.close_grace(),
            min_output_bytes: encoder.min_output_bytes,
            queue: Some(queue),
            writer: Some(writer),
            child: Some(child),
            frames_written: 0,
            bytes_written: 0,
        })
    }

    /// Close input, then wait for the encoder to exit or kill it at the deadline
    async fn finish_encoder(&mut self) -> (EncoderExit, u64) {
        let deadline = Instant::now() + self.close_grace;

        // Dropping the sender lets the writer drain and close stdin
        self.queue.take();

        let delivered = match self.writer.take() {
            Some(mut writer) => match time::timeout_at(deadline, &mut writer).await {
                Ok(Ok(delivered)) => delivered,
                Ok(Err(e)) => {
                    warn!("Encoder input task for {} failed: {}", self.path.display(), e);
                    0
                }
                Err(_) => {
                    warn!(
                        "Encoder for {} stopped accepting input; abandoning queued audio",
                        self.path.display()
                    );
                    writer.abort();
                    0
                }
            },
            None => 0,
        };

        let Some(mut child) = self.child.take() else {
            return (EncoderExit::Killed, delivered);
        };

        let exit = match time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) if status.success() => EncoderExit::Clean,
            Ok(Ok(status)) => {
                warn!("Encoder for {} exited with {}", self.path.display(), status);
                EncoderExit::Failed { code: status.code() }
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for encoder of {}: {}", self.path.display(), e);
                kill_child(&mut child, &self.path).await;
                EncoderExit::Killed
            }
            Err(_) => {
                warn!(
                    "Encoder for {} did not exit within {:?}; killing it",
                    self.path.display(),
                    self.close_grace
                );
                kill_child(&mut child, &self.path).await;
                EncoderExit::Killed
            }
        };

        (exit, delivered)
    }

    /// Keep or delete the output depending on what the encoder left behind
    fn validate(&self) -> (SinkVerdict, Option<f64>) {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                return (
                    SinkVerdict::Discarded {
                        reason: "output file missing".to_string(),
                    },
                    None,
                )
            }
        };

        if size < self.min_output_bytes {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to delete invalid output {}: {}", self.path.display(), e);
            }
            return (
                SinkVerdict::Discarded {
                    reason: format!(
                        "output of {} bytes is below the {} byte minimum",
                        size, self.min_output_bytes
                    ),
                },
                None,
            );
        }

        let written = self.pcm.duration_of_bytes(self.bytes_written).as_secs_f64();
        let estimated = match estimate_duration(&self.path, self.output, self.bitrate_kbps) {
            Ok(duration) => Some(duration.as_secs_f64()),
            Err(e) => {
                debug!("No duration estimate for {}: {:#}", self.path.display(), e);
                None
            }
        };

        if let Some(estimated) = estimated {
            if written > 0.0 && ((estimated - written).abs() / written) > DURATION_DRIFT_WARN {
                warn!(
                    "Output {} looks {:.1}s long but {:.1}s was written; keeping it",
                    self.path.display(),
                    estimated,
                    written
                );
            }
        }

        (SinkVerdict::Kept, estimated)
    }
}

#[async_trait]
impl FrameSink for TrackSink {
    fn write(&mut self, frame: &AudioFrame) {
        let bytes = frame.to_le_bytes();
        self.frames_written += 1;
        self.bytes_written += bytes.len() as u64;

        if let Some(queue) = &self.queue {
            // Only fails once the writer task is gone, i.e. while shutting down
            let _ = queue.send(bytes);
        }
    }

    async fn close(mut self: Box<Self>) -> SinkOutcome {
        let (exit, bytes_delivered) = self.finish_encoder().await;
        let (verdict, estimated_duration_secs) = self.validate();

        match &verdict {
            SinkVerdict::Kept => info!(
                "Track sink closed: {} ({} frames, {:.1}s)",
                self.path.display(),
                self.frames_written,
                self.pcm.duration_of_bytes(self.bytes_written).as_secs_f64()
            ),
            SinkVerdict::Discarded { reason } => {
                warn!("Discarded {}: {}", self.path.display(), reason)
            }
        }

        SinkOutcome {
            path: self.path.clone(),
            frames_written: self.frames_written,
            bytes_written: self.bytes_written,
            bytes_delivered,
            exit,
            verdict,
            estimated_duration_secs,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TrackSink {
    fn drop(&mut self) {
        if self.child.is_some() {
            warn!(
                "Track sink for {} dropped without close; encoder will be killed",
                self.path.display()
            );
        }
    }
}

async fn kill_child(child: &mut Child, path: &Path) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill encoder for {}: {}", path.display(), e);
    }
}

/// Drain queued frames into the encoder; returns bytes accepted
///
/// Write errors mean the encoder has exited. The queue is still drained so
/// producers never notice.
async fn feed_encoder(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Vec<u8>>, path: PathBuf) -> u64 {
    let mut delivered = 0u64;
    let mut broken = false;

    while let Some(chunk) = rx.recv().await {
        if broken {
            continue;
        }
        match stdin.write_all(&chunk).await {
            Ok(()) => delivered += chunk.len() as u64,
            Err(e) => {
                debug!("Encoder input for {} closed: {}", path.display(), e);
                broken = true;
            }
        }
    }

    if !broken {
        let _ = stdin.flush().await;
        let _ = stdin.shutdown().await;
    }

    delivered
}

async fn log_encoder_stderr(stderr: ChildStderr, path: PathBuf) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!("Encoder [{}]: {}", name, line);
    }
}
