// Timer-driven silence source
//
// The generator is the frame clock of a track: it emits one zeroed frame per
// frame period whether or not anything is reading, so a track's output keeps
// pace with wall-clock time. Missed ticks are delivered in a burst to catch up.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use super::format::{AudioFrame, PcmFormat};

pub struct SilenceGenerator {
    frames: Option<mpsc::UnboundedReceiver<AudioFrame>>,
    task: Option<JoinHandle<()>>,
}

impl SilenceGenerator {
    /// Start emitting silent frames at real-time cadence
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(format: PcmFormat, frame_duration: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sample_count = format.samples_per_frame(frame_duration);
        let frame_ms = frame_duration.as_millis() as u64;

        let task = tokio::spawn(async move {
            let mut clock = time::interval(frame_duration);
            clock.set_missed_tick_behavior(MissedTickBehavior::Burst);

            let mut sequence: u64 = 0;
            loop {
                clock.tick().await;
                if tx.send(AudioFrame::silence(sample_count, sequence * frame_ms)).is_err() {
                    break;
                }
                sequence += 1;
            }

            debug!("Silence generator released after {} frames", sequence);
        });

        Self {
            frames: Some(rx),
            task: Some(task),
        }
    }

    /// Take the frame receiver (only the first call returns it)
    pub fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<AudioFrame>> {
        self.frames.take()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel the timer; safe to call repeatedly
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SilenceGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FrameSource;

    fn format() -> PcmFormat {
        PcmFormat::new(16000, 1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_one_frame_per_period() {
        let mut generator = SilenceGenerator::start(format(), Duration::from_millis(20));
        let mut frames = generator.take_frames().unwrap();

        time::sleep(Duration::from_millis(1000)).await;
        generator.stop();

        let mut count = 0;
        while let Some(frame) = frames.recv().await {
            assert_eq!(frame.samples.len(), 320); // 20ms at 16kHz mono
            assert_eq!(frame.source, FrameSource::Silence);
            assert!(frame.samples.iter().all(|&s| s == 0));
            count += 1;
        }

        // First tick fires immediately, then one every 20ms
        assert!((50..=51).contains(&count), "unexpected frame count {}", count);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_emitting_without_a_reader() {
        let mut generator = SilenceGenerator::start(format(), Duration::from_millis(20));
        let mut frames = generator.take_frames().unwrap();

        // Nobody reads for 400ms; frames queue instead of being skipped
        time::sleep(Duration::from_millis(400)).await;
        generator.stop();

        let mut timestamps = Vec::new();
        while let Some(frame) = frames.recv().await {
            timestamps.push(frame.timestamp_ms);
        }

        assert!(timestamps.len() >= 20);
        for (i, ts) in timestamps.iter().enumerate() {
            assert_eq!(*ts, i as u64 * 20);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let mut generator = SilenceGenerator::start(format(), Duration::from_millis(20));
        assert!(generator.is_running());

        generator.stop();
        generator.stop();
        assert!(!generator.is_running());
        assert!(generator.take_frames().is_some());
        assert!(generator.take_frames().is_none());
    }
}
