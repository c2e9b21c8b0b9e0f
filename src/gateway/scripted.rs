// Deterministic in-process voice gateway
//
// Replays a JSON script of presence, speaking and connectivity events against
// the real capture pipeline. Speaking participants produce a sine tone as
// raw s16le packets at frame cadence.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::f32::consts::PI;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval};
use tracing::{debug, info, warn};

use super::{
    Connection, ConnectionEvent, GatewayError, LiveAudioSource, Participant, PresenceChange, VoiceConnection,
    VoiceGateway,
};
use crate::audio::PcmFormat;

const TONE_AMPLITUDE: f32 = 8000.0;

fn default_self_id() -> String {
    "loqa-tracks".to_string()
}

fn default_ready_after_ms() -> u64 {
    50
}

fn default_frequency() -> f32 {
    440.0
}

/// Scripted call: who is there, and what happens when
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    #[serde(default = "default_self_id")]
    pub self_id: String,
    /// Members present when the connection becomes ready
    #[serde(default)]
    pub members: Vec<Participant>,
    #[serde(default = "default_ready_after_ms")]
    pub ready_after_ms: u64,
    /// Never report readiness (exercises the join timeout)
    #[serde(default)]
    pub never_ready: bool,
    /// Refuse the join outright
    #[serde(default)]
    pub join_error: Option<JoinFailure>,
    /// Number of reconnect attempts that fail before one succeeds
    #[serde(default)]
    pub reconnect_failures: u32,
    #[serde(default)]
    pub events: Vec<TimedAction>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            self_id: default_self_id(),
            members: Vec::new(),
            ready_after_ms: default_ready_after_ms(),
            never_ready: false,
            join_error: None,
            reconnect_failures: 0,
            events: Vec::new(),
        }
    }
}

impl Script {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read script {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("Invalid script {}", path.display()))
    }

    pub fn at(mut self, at_ms: u64, action: ScriptAction) -> Self {
        self.events.push(TimedAction { at_ms, action });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinFailure {
    PermissionDenied,
    ChannelFull,
    NotFound,
    Unreachable,
}

impl JoinFailure {
    fn into_error(self, channel_id: &str) -> GatewayError {
        match self {
            Self::PermissionDenied => GatewayError::PermissionDenied(channel_id.to_string()),
            Self::ChannelFull => GatewayError::ChannelFull(channel_id.to_string()),
            Self::NotFound => GatewayError::NotFound(channel_id.to_string()),
            Self::Unreachable => GatewayError::Disconnected("voice server unreachable".to_string()),
        }
    }
}

/// One scripted action, `at_ms` after the join
#[derive(Debug, Clone, Deserialize)]
pub struct TimedAction {
    pub at_ms: u64,
    #[serde(flatten)]
    pub action: ScriptAction,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScriptAction {
    Join {
        participant: Participant,
    },
    Leave {
        participant_id: String,
    },
    Speak {
        participant_id: String,
        duration_ms: u64,
        #[serde(default = "default_frequency")]
        frequency_hz: f32,
    },
    Disconnect,
    Destroy,
}

pub struct ScriptedGateway {
    script: Script,
    format: PcmFormat,
    frame_duration: Duration,
}

impl ScriptedGateway {
    pub fn new(script: Script, format: PcmFormat, frame_duration: Duration) -> Self {
        Self {
            script,
            format,
            frame_duration,
        }
    }

    pub fn from_file(path: impl AsRef<Path>, format: PcmFormat, frame_duration: Duration) -> Result<Self> {
        Ok(Self::new(Script::from_file(path)?, format, frame_duration))
    }
}

#[async_trait]
impl VoiceGateway for ScriptedGateway {
    async fn join(&self, call_id: &str, channel_id: &str) -> Result<Connection, GatewayError> {
        if let Some(failure) = self.script.join_error {
            return Err(failure.into_error(channel_id));
        }

        info!("Scripted join: call {} channel {}", call_id, channel_id);

        let (events_tx, events_rx) = mpsc::channel(64);
        let shared = Arc::new(Mutex::new(CallState {
            members: self.script.members.clone(),
            speech: HashMap::new(),
            reconnect_failures: self.script.reconnect_failures,
        }));

        let driver = tokio::spawn(drive(self.script.clone(), Arc::clone(&shared), events_tx.clone()));

        let handle = ScriptedConnection {
            self_id: self.script.self_id.clone(),
            shared,
            events: events_tx,
            driver: Mutex::new(Some(driver)),
            format: self.format,
            frame_duration: self.frame_duration,
            reconnect_delay: Duration::from_millis(self.script.ready_after_ms),
        };

        Ok(Connection {
            handle: Box::new(handle),
            events: events_rx,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[derive(Debug, Clone, Copy)]
struct Speech {
    duration_ms: u64,
    frequency_hz: f32,
}

struct CallState {
    members: Vec<Participant>,
    speech: HashMap<String, Speech>,
    reconnect_failures: u32,
}

fn lock(shared: &Mutex<CallState>) -> MutexGuard<'_, CallState> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

async fn drive(script: Script, shared: Arc<Mutex<CallState>>, events: mpsc::Sender<ConnectionEvent>) {
    let start = Instant::now();

    if !script.never_ready {
        time::sleep(Duration::from_millis(script.ready_after_ms)).await;
        if events.send(ConnectionEvent::Ready).await.is_err() {
            return;
        }
    }

    let mut actions = script.events;
    actions.sort_by_key(|a| a.at_ms);

    for timed in actions {
        time::sleep_until(start + Duration::from_millis(timed.at_ms)).await;

        let event = match timed.action {
            ScriptAction::Join { participant } => {
                let mut state = lock(&shared);
                state.members.retain(|m| m.id != participant.id);
                state.members.push(participant.clone());
                Some(ConnectionEvent::Presence {
                    participant,
                    change: PresenceChange::Joined,
                })
            }
            ScriptAction::Leave { participant_id } => {
                let mut state = lock(&shared);
                let position = state.members.iter().position(|m| m.id == participant_id);
                position.map(|index| ConnectionEvent::Presence {
                    participant: state.members.remove(index),
                    change: PresenceChange::Left,
                })
            }
            ScriptAction::Speak {
                participant_id,
                duration_ms,
                frequency_hz,
            } => {
                let mut state = lock(&shared);
                match state.members.iter().find(|m| m.id == participant_id).cloned() {
                    Some(participant) => {
                        state.speech.insert(
                            participant_id,
                            Speech {
                                duration_ms,
                                frequency_hz,
                            },
                        );
                        Some(ConnectionEvent::SpeakerStart { participant })
                    }
                    None => {
                        warn!("Script speaks for absent participant {}", participant_id);
                        None
                    }
                }
            }
            ScriptAction::Disconnect => Some(ConnectionEvent::Disconnected),
            ScriptAction::Destroy => {
                let _ = events.send(ConnectionEvent::Destroyed).await;
                return;
            }
        };

        if let Some(event) = event {
            debug!("Scripted event at {}ms: {:?}", timed.at_ms, event);
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

struct ScriptedConnection {
    self_id: String,
    shared: Arc<Mutex<CallState>>,
    events: mpsc::Sender<ConnectionEvent>,
    driver: Mutex<Option<JoinHandle<()>>>,
    format: PcmFormat,
    frame_duration: Duration,
    reconnect_delay: Duration,
}

#[async_trait]
impl VoiceConnection for ScriptedConnection {
    fn self_id(&self) -> &str {
        &self.self_id
    }

    async fn members(&self) -> Result<Vec<Participant>, GatewayError> {
        Ok(lock(&self.shared).members.clone())
    }

    async fn subscribe_speaker(
        &self,
        participant_id: &str,
        trailing_silence: Duration,
    ) -> Result<LiveAudioSource, GatewayError> {
        let speech = lock(&self.shared)
            .speech
            .remove(participant_id)
            .ok_or_else(|| GatewayError::Stream(format!("{} is not speaking", participant_id)))?;

        let frame_ms = self.frame_duration.as_millis().max(1) as u64;
        let state = SpeechStream {
            participant_id: participant_id.to_string(),
            index: 0,
            frames: (speech.duration_ms / frame_ms).max(1),
            clock: time::interval(self.frame_duration),
            trailing_silence,
            tone: Tone::new(self.format, self.frame_duration, speech.frequency_hz),
            events: self.events.clone(),
        };

        let source = stream::unfold(state, |mut state| async move {
            if state.index < state.frames {
                state.clock.tick().await;
                let packet = state.tone.packet(state.index);
                state.index += 1;
                return Some((Ok(packet), state));
            }

            time::sleep(state.trailing_silence).await;
            let _ = state
                .events
                .send(ConnectionEvent::SpeakerStop {
                    participant_id: state.participant_id.clone(),
                })
                .await;
            None
        });

        Ok(source.boxed())
    }

    async fn reconnect(&self) -> Result<(), GatewayError> {
        time::sleep(self.reconnect_delay).await;

        let mut state = lock(&self.shared);
        if state.reconnect_failures > 0 {
            state.reconnect_failures -= 1;
            return Err(GatewayError::Disconnected("scripted reconnect failure".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let driver = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(driver) = driver {
            driver.abort();
        }
    }
}

struct SpeechStream {
    participant_id: String,
    index: u64,
    frames: u64,
    clock: Interval,
    trailing_silence: Duration,
    tone: Tone,
    events: mpsc::Sender<ConnectionEvent>,
}

/// Sine tone rendered frame by frame as s16le
struct Tone {
    format: PcmFormat,
    samples_per_channel: usize,
    frequency_hz: f32,
}

impl Tone {
    fn new(format: PcmFormat, frame_duration: Duration, frequency_hz: f32) -> Self {
        Self {
            format,
            samples_per_channel: format.samples_per_frame(frame_duration) / format.channels.max(1) as usize,
            frequency_hz,
        }
    }

    fn packet(&self, index: u64) -> Vec<u8> {
        let channels = self.format.channels as usize;
        let mut bytes = Vec::with_capacity(self.samples_per_channel * channels * 2);
        let offset = index as usize * self.samples_per_channel;

        for n in 0..self.samples_per_channel {
            let t = (offset + n) as f32 / self.format.sample_rate as f32;
            let sample = ((2.0 * PI * self.frequency_hz * t).sin() * TONE_AMPLITUDE) as i16;
            for _ in 0..channels {
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(script: Script) -> ScriptedGateway {
        ScriptedGateway::new(script, PcmFormat::new(16000, 1), Duration::from_millis(20))
    }

    #[test]
    fn test_script_parses_from_json() {
        let json = r#"{
            "members": [{"id": "a", "display_name": "Alice"}],
            "reconnect_failures": 1,
            "events": [
                {"at_ms": 500, "action": "speak", "participant_id": "a", "duration_ms": 1000},
                {"at_ms": 2000, "action": "leave", "participant_id": "a"},
                {"at_ms": 2500, "action": "disconnect"}
            ]
        }"#;

        let script: Script = serde_json::from_str(json).unwrap();
        assert_eq!(script.members.len(), 1);
        assert_eq!(script.ready_after_ms, 50);
        assert_eq!(script.reconnect_failures, 1);
        assert!(matches!(
            script.events[0].action,
            ScriptAction::Speak { duration_ms: 1000, .. }
        ));
        assert!(matches!(script.events[2].action, ScriptAction::Disconnect));
    }

    #[tokio::test]
    async fn test_join_failure_is_reported() {
        let script = Script {
            join_error: Some(JoinFailure::PermissionDenied),
            ..Script::default()
        };
        let err = gateway(script).join("call", "general").await.err().unwrap();
        assert!(err.is_precondition());
    }

    #[tokio::test(start_paused = true)]
    async fn test_speech_stream_and_events() {
        let script = Script {
            members: vec![Participant::new("a", "Alice")],
            ..Script::default()
        }
        .at(100, ScriptAction::Speak {
            participant_id: "a".into(),
            duration_ms: 200,
            frequency_hz: 440.0,
        });

        let Connection { handle, mut events } = gateway(script).join("call", "general").await.unwrap();
        assert!(matches!(events.recv().await, Some(ConnectionEvent::Ready)));
        assert!(matches!(events.recv().await, Some(ConnectionEvent::SpeakerStart { .. })));

        let packets: Vec<_> = handle
            .subscribe_speaker("a", Duration::from_millis(50))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(packets.len(), 10);
        assert!(packets.iter().all(|p| p.as_ref().map(|b| b.len() == 640).unwrap_or(false)));

        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::SpeakerStop { participant_id }) if participant_id == "a"
        ));

        // Speech is consumed by the first subscription
        assert!(handle.subscribe_speaker("a", Duration::ZERO).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_failures_are_counted() {
        let script = Script {
            reconnect_failures: 2,
            ..Script::default()
        };
        let connection = gateway(script).join("call", "general").await.unwrap();

        assert!(connection.handle.reconnect().await.is_err());
        assert!(connection.handle.reconnect().await.is_err());
        assert!(connection.handle.reconnect().await.is_ok());
    }
}
