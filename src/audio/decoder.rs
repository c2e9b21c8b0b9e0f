use anyhow::Result;
use std::sync::Arc;

/// Compressed-frame to PCM transform supplied by the voice transport
///
/// Implementations produce interleaved i16 samples at the session's
/// fixed sample rate and channel count.
pub trait FrameDecoder: Send {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>>;
}

/// Builds one decoder per attached live source
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn FrameDecoder> + Send + Sync>;

/// Factory for sources that already carry raw s16le PCM
pub fn pcm_decoder_factory() -> DecoderFactory {
    Arc::new(|| Box::new(PcmDecoder::default()) as Box<dyn FrameDecoder>)
}

/// Passthrough decoder for s16le payloads
///
/// A trailing odd byte is carried into the next packet.
#[derive(Debug, Default)]
pub struct PcmDecoder {
    carry: Option<u8>,
}

impl FrameDecoder for PcmDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        let mut bytes = Vec::with_capacity(packet.len() + 1);
        if let Some(byte) = self.carry.take() {
            bytes.push(byte);
        }
        bytes.extend_from_slice(packet);

        if bytes.len() % 2 == 1 {
            self.carry = bytes.pop();
        }

        Ok(bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }
}

/// Regroups decoded samples into exact frame-sized blocks
#[derive(Debug)]
pub struct Reframer {
    frame_samples: usize,
    pending: Vec<i16>,
}

impl Reframer {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Append samples and return every complete frame
    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    /// Remaining partial frame, zero-padded to full length
    pub fn flush(&mut self) -> Option<Vec<i16>> {
        if self.pending.is_empty() {
            return None;
        }
        let mut frame = std::mem::take(&mut self.pending);
        frame.resize(self.frame_samples, 0);
        Some(frame)
    }
}
