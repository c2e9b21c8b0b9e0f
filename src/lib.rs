pub mod audio;
pub mod config;
pub mod error;
pub mod gateway;
pub mod load;
pub mod receiver;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod sink;
pub mod track;

pub use audio::{
    pcm_decoder_factory, AudioFrame, DecoderFactory, FrameDecoder, FrameSource, OutputFormat, PcmDecoder, PcmFormat,
    SilenceGenerator,
};
pub use config::Config;
pub use error::CaptureError;
pub use gateway::{
    Connection, ConnectionEvent, GatewayError, LiveAudioSource, Participant, PresenceChange, Script, ScriptedGateway,
    VoiceConnection, VoiceGateway,
};
pub use load::{LoadLimits, SystemLoad};
pub use receiver::CaptureReceiver;
pub use registry::{
    request_stop, ProcessProbe, RegistryError, RegistryRecord, SessionRegistry, StopOutcome, StopTimeouts,
    SysinfoProbe,
};
pub use session::{
    Session, SessionController, SessionInfo, SessionMetadata, SessionReport, SessionState, StartRequest, StopReason,
};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use sink::{EncoderExit, FrameSink, SinkOutcome, SinkVerdict, TrackSink};
pub use track::{ParticipantTrack, TrackState, TrackSummary};
