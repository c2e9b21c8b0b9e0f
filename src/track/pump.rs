// Single writer of a track's sink
//
// Every silence frame from the generator is one slot on the track's timeline.
// For each slot the pump writes exactly one frame: the next decoded voice
// frame when a live source is attached and has one ready, otherwise the
// silence frame itself. Attach and detach arrive on the same command queue
// and are applied between slots, so sources never overlap.

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use super::state::{Timeline, Window};
use crate::audio::{AudioFrame, FrameSource};
use crate::sink::FrameSink;

pub(crate) enum TrackCommand {
    Attach {
        voice: mpsc::Receiver<Vec<i16>>,
        ack: oneshot::Sender<()>,
    },
    Detach {
        ack: oneshot::Sender<()>,
    },
    /// Write out already-ticked slots, then stop
    Close,
}

pub(crate) struct PumpReport {
    pub sink: Box<dyn FrameSink>,
    pub silence_frames: u64,
    pub voice_frames: u64,
    pub voice: Vec<Window>,
}

pub(crate) struct Pump {
    participant_id: String,
    sink: Box<dyn FrameSink>,
    clock: mpsc::UnboundedReceiver<AudioFrame>,
    commands: mpsc::UnboundedReceiver<TrackCommand>,
    speaking: watch::Sender<bool>,
    live: Option<mpsc::Receiver<Vec<i16>>>,
    offset_ms: u64,
    frame_ms: u64,
    slots: u64,
    silence_frames: u64,
    voice_frames: u64,
    voice: Timeline,
}

impl Pump {
    pub(crate) fn new(
        participant_id: String,
        sink: Box<dyn FrameSink>,
        clock: mpsc::UnboundedReceiver<AudioFrame>,
        commands: mpsc::UnboundedReceiver<TrackCommand>,
        speaking: watch::Sender<bool>,
        offset_ms: u64,
        frame_ms: u64,
    ) -> Self {
        Self {
            participant_id,
            sink,
            clock,
            commands,
            speaking,
            live: None,
            offset_ms,
            frame_ms,
            slots: 0,
            silence_frames: 0,
            voice_frames: 0,
            voice: Timeline::default(),
        }
    }

    pub(crate) async fn run(mut self) -> PumpReport {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(TrackCommand::Attach { voice, ack }) => {
                        self.begin_voice(voice);
                        let _ = ack.send(());
                    }
                    Some(TrackCommand::Detach { ack }) => {
                        self.end_voice("detached");
                        let _ = ack.send(());
                    }
                    Some(TrackCommand::Close) | None => {
                        while let Ok(silence) = self.clock.try_recv() {
                            self.fill_slot(silence);
                        }
                        break;
                    }
                },

                slot = self.clock.recv() => match slot {
                    Some(silence) => self.fill_slot(silence),
                    None => break,
                },
            }
        }

        self.end_voice("track closed");

        PumpReport {
            sink: self.sink,
            silence_frames: self.silence_frames,
            voice_frames: self.voice_frames,
            voice: self.voice.into_windows(),
        }
    }

    fn position_ms(&self) -> u64 {
        self.offset_ms + self.slots * self.frame_ms
    }

    fn begin_voice(&mut self, voice: mpsc::Receiver<Vec<i16>>) {
        // Replacing a source closes its window first
        self.end_voice("replaced");
        self.live = Some(voice);
        self.voice.begin(self.position_ms());
        self.speaking.send_replace(true);
        debug!("{}: live voice attached at {}ms", self.participant_id, self.position_ms());
    }

    /// Release the live source; anything still queued from it is discarded
    fn end_voice(&mut self, why: &str) {
        let Some(mut live) = self.live.take() else {
            return;
        };

        let mut discarded = 0;
        while live.try_recv().is_ok() {
            discarded += 1;
        }

        self.voice.end(self.position_ms());
        self.speaking.send_replace(false);
        debug!(
            "{}: live voice {} at {}ms ({} queued frames discarded)",
            self.participant_id,
            why,
            self.position_ms(),
            discarded
        );
    }

    fn fill_slot(&mut self, silence: AudioFrame) {
        let mut ended = false;
        let voice = match self.live.as_mut() {
            Some(live) => match live.try_recv() {
                Ok(samples) => Some(samples),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => {
                    ended = true;
                    None
                }
            },
            None => None,
        };

        if ended {
            self.end_voice("ended");
        }

        let frame = match voice {
            Some(samples) => AudioFrame::voice(samples, silence.timestamp_ms),
            None => silence,
        };

        match frame.source {
            FrameSource::Silence => self.silence_frames += 1,
            FrameSource::Voice => self.voice_frames += 1,
        }

        self.sink.write(&frame);
        self.slots += 1;
    }
}
