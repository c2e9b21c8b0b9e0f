//! Participant tracks
//!
//! A track is one participant's continuous output. From creation until
//! cleanup its sink receives one frame per frame period: silence, or live
//! voice while a source is attached. Output duration therefore equals the
//! wall-clock lifetime of the track no matter how often the participant
//! spoke, left or rejoined.

mod pump;
mod state;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::{FrameDecoder, PcmFormat, Reframer, SilenceGenerator};
use crate::gateway::{LiveAudioSource, Participant};
use crate::sink::{FrameSink, SinkOutcome};
use pump::{Pump, PumpReport, TrackCommand};

pub use state::{Timeline, TrackState, Window};

/// Decoded frames buffered between a live source and the pump
const VOICE_QUEUE_FRAMES: usize = 256;

/// Final account of a track
#[derive(Debug, Clone, Serialize)]
pub struct TrackSummary {
    pub participant: Participant,
    /// Track creation, relative to session start
    pub created_at_ms: u64,
    /// Cleanup, relative to session start
    pub closed_at_ms: u64,
    pub presence: Vec<Window>,
    pub voice: Vec<Window>,
    pub voice_frames: u64,
    pub silence_frames: u64,
    /// None if the pump task was lost and the sink could not be closed
    pub sink: Option<SinkOutcome>,
}

impl TrackSummary {
    pub fn total_frames(&self) -> u64 {
        self.voice_frames + self.silence_frames
    }
}

pub struct ParticipantTrack {
    participant: Participant,
    path: PathBuf,
    session_start: Instant,
    created_at_ms: u64,
    frame_samples: usize,
    present: bool,
    presence: Timeline,
    commands: mpsc::UnboundedSender<TrackCommand>,
    speaking: watch::Receiver<bool>,
    generator: SilenceGenerator,
    pump: Option<JoinHandle<PumpReport>>,
    forwarder: Option<JoinHandle<()>>,
    summary: Option<TrackSummary>,
}

impl ParticipantTrack {
    /// Start streaming silence into `sink` immediately
    ///
    /// The track starts `PresentSilent`.
    pub fn spawn(
        participant: Participant,
        sink: Box<dyn FrameSink>,
        format: PcmFormat,
        frame_duration: Duration,
        session_start: Instant,
    ) -> Self {
        let created_at_ms = session_start.elapsed().as_millis() as u64;
        let path = sink.path().to_path_buf();

        let mut generator = SilenceGenerator::start(format, frame_duration);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (speaking_tx, speaking) = watch::channel(false);

        let pump = match generator.take_frames() {
            Some(clock) => {
                let pump = Pump::new(
                    participant.id.clone(),
                    sink,
                    clock,
                    command_rx,
                    speaking_tx,
                    created_at_ms,
                    frame_duration.as_millis() as u64,
                );
                Some(tokio::spawn(pump.run()))
            }
            None => None,
        };

        let mut presence = Timeline::default();
        presence.begin(created_at_ms);

        info!(
            "Track started for {} ({}) at {}ms -> {}",
            participant.display_name,
            participant.id,
            created_at_ms,
            path.display()
        );

        Self {
            participant,
            path,
            session_start,
            created_at_ms,
            frame_samples: format.samples_per_frame(frame_duration),
            present: true,
            presence,
            commands,
            speaking,
            generator,
            pump,
            forwarder: None,
            summary: None,
        }
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn state(&self) -> TrackState {
        if !self.present {
            TrackState::Absent
        } else if self.is_speaking() {
            TrackState::PresentSpeaking
        } else {
            TrackState::PresentSilent
        }
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.summary.is_some()
    }

    pub fn presence(&self) -> &[Window] {
        self.presence.windows()
    }

    fn now_ms(&self) -> u64 {
        self.session_start.elapsed().as_millis() as u64
    }

    pub fn mark_present(&mut self) {
        if self.present || self.is_closed() {
            return;
        }
        self.present = true;
        let now = self.now_ms();
        self.presence.begin(now);
        info!("{} rejoined at {}ms", self.participant.display_name, now);
    }

    /// Leave the channel: the live source is released but silence continues
    pub async fn mark_absent(&mut self) -> Result<()> {
        if !self.present {
            return Ok(());
        }
        self.detach().await?;
        self.present = false;
        let now = self.now_ms();
        self.presence.end(now);
        info!("{} left at {}ms", self.participant.display_name, now);
        Ok(())
    }

    /// Switch the sink to a live voice source
    ///
    /// Returns false when a source is already attached. Any previous source
    /// is fully released before the new one is wired in.
    pub async fn attach(&mut self, source: LiveAudioSource, decoder: Box<dyn FrameDecoder>) -> Result<bool> {
        if self.is_closed() {
            bail!("Track for {} is already closed", self.participant.id);
        }
        if self.is_speaking() {
            debug!("Ignoring duplicate attach for {}", self.participant.id);
            return Ok(false);
        }

        self.mark_present();
        self.stop_forwarder().await;

        let (voice_tx, voice_rx) = mpsc::channel(VOICE_QUEUE_FRAMES);
        let (ack, acked) = oneshot::channel();
        self.commands
            .send(TrackCommand::Attach { voice: voice_rx, ack })
            .map_err(|_| anyhow::anyhow!("Track pump for {} is gone", self.participant.id))?;
        acked
            .await
            .with_context(|| format!("Track pump for {} stopped during attach", self.participant.id))?;

        self.forwarder = Some(tokio::spawn(forward_voice(
            self.participant.id.clone(),
            source,
            decoder,
            Reframer::new(self.frame_samples),
            voice_tx,
        )));

        info!("{} speaking at {}ms", self.participant.display_name, self.now_ms());
        Ok(true)
    }

    /// Revert the sink to silence; a no-op if nothing is attached
    pub async fn detach(&mut self) -> Result<()> {
        if self.pump.is_none() {
            return Ok(());
        }

        let (ack, acked) = oneshot::channel();
        if self.commands.send(TrackCommand::Detach { ack }).is_ok() {
            acked
                .await
                .with_context(|| format!("Track pump for {} stopped during detach", self.participant.id))?;
        }
        self.stop_forwarder().await;
        Ok(())
    }

    async fn stop_forwarder(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
            let _ = forwarder.await;
        }
    }

    /// Detach, stop the silence clock and close the sink
    ///
    /// Safe to call more than once; later calls return the first summary.
    pub async fn cleanup(&mut self) -> TrackSummary {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }

        self.stop_forwarder().await;
        self.generator.stop();
        let _ = self.commands.send(TrackCommand::Close);

        let closed_at_ms = self.now_ms();
        self.presence.end(closed_at_ms);
        self.present = false;

        let report = match self.pump.take() {
            Some(pump) => match pump.await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("Track pump for {} failed: {}", self.participant.id, e);
                    None
                }
            },
            None => None,
        };

        let summary = match report {
            Some(report) => {
                let sink = report.sink.close().await;
                TrackSummary {
                    participant: self.participant.clone(),
                    created_at_ms: self.created_at_ms,
                    closed_at_ms,
                    presence: self.presence.windows().to_vec(),
                    voice: report.voice,
                    voice_frames: report.voice_frames,
                    silence_frames: report.silence_frames,
                    sink: Some(sink),
                }
            }
            None => TrackSummary {
                participant: self.participant.clone(),
                created_at_ms: self.created_at_ms,
                closed_at_ms,
                presence: self.presence.windows().to_vec(),
                voice: Vec::new(),
                voice_frames: 0,
                silence_frames: 0,
                sink: None,
            },
        };

        info!(
            "Track closed for {}: {} voice / {} silence frames",
            self.participant.display_name, summary.voice_frames, summary.silence_frames
        );

        self.summary = Some(summary.clone());
        summary
    }
}

/// Decode a live source into frame-sized blocks for the pump
///
/// Returning drops the sender, which the pump sees as end of stream.
async fn forward_voice(
    participant_id: String,
    mut source: LiveAudioSource,
    mut decoder: Box<dyn FrameDecoder>,
    mut reframer: Reframer,
    voice: mpsc::Sender<Vec<i16>>,
) {
    let mut packets = 0u64;

    while let Some(packet) = source.next().await {
        match packet {
            Ok(bytes) => {
                packets += 1;
                match decoder.decode(&bytes) {
                    Ok(samples) => {
                        for frame in reframer.push(&samples) {
                            if voice.send(frame).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Dropping undecodable packet from {}: {:#}", participant_id, e),
                }
            }
            Err(e) => {
                warn!("Voice stream for {} failed: {}", participant_id, e);
                break;
            }
        }
    }

    if let Some(frame) = reframer.flush() {
        let _ = voice.send(frame).await;
    }

    debug!("Voice stream for {} ended after {} packets", participant_id, packets);
}
