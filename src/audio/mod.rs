pub mod decoder;
pub mod format;
pub mod probe;
pub mod silence;

pub use decoder::{pcm_decoder_factory, DecoderFactory, FrameDecoder, PcmDecoder, Reframer};
pub use format::{AudioFrame, FrameSource, OutputFormat, PcmFormat};
pub use probe::estimate_duration;
pub use silence::SilenceGenerator;
