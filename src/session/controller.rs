use anyhow::Context;
use chrono::Utc;
use std::collections::VecDeque;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::config::{SessionInfo, StartRequest};
use super::session::Session;
use super::stats::{SessionReport, StopReason};
use crate::audio::DecoderFactory;
use crate::config::Config;
use crate::error::CaptureError;
use crate::gateway::{ConnectionEvent, Participant, PresenceChange, VoiceConnection, VoiceGateway};
use crate::load::SystemLoad;
use crate::receiver::CaptureReceiver;
use crate::registry::{safe_component, ProcessProbe, RegistryRecord, SessionRegistry};
use crate::sink::ensure_encoder_available;

/// Lifecycle of the controller's session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Active,
    /// Transport dropped, reconnecting
    Recovering,
    Stopping,
    Stopped,
}

/// Everything held while a session is running
struct ActiveSession {
    session: Session,
    connection: Box<dyn VoiceConnection>,
    events: mpsc::Receiver<ConnectionEvent>,
    /// Events that arrived while waiting for readiness
    pending: VecDeque<ConnectionEvent>,
    owner_pid: u32,
    marker: PathBuf,
}

/// Orchestrates one session at a time: join, react to events, stop
pub struct SessionController {
    config: Config,
    gateway: Arc<dyn VoiceGateway>,
    receiver: CaptureReceiver,
    registry: SessionRegistry,
    probe: Arc<dyn ProcessProbe>,
    state: SessionState,
    active: Option<ActiveSession>,
}

impl SessionController {
    pub fn new(
        config: Config,
        gateway: Arc<dyn VoiceGateway>,
        decoders: DecoderFactory,
        registry: SessionRegistry,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        let receiver = CaptureReceiver::new(config.session.trailing_silence(), decoders);
        Self {
            config,
            gateway,
            receiver,
            registry,
            probe,
            state: SessionState::Idle,
            active: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn info(&self) -> Option<&SessionInfo> {
        self.active.as_ref().map(|a| a.session.info())
    }

    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref().map(|a| &a.session)
    }

    /// Join the call and start a track for everyone already present
    ///
    /// Nothing is left behind on failure: no registry record, no session
    /// directory, no connection.
    pub async fn start(&mut self, request: StartRequest) -> Result<SessionInfo, CaptureError> {
        if self.active.is_some() {
            return Err(CaptureError::Precondition("a session is already active in this process".into()));
        }
        if request.call_id.trim().is_empty() || request.channel_id.trim().is_empty() {
            return Err(CaptureError::Precondition("call and channel ids are required".into()));
        }

        ensure_encoder_available(&self.config.encoder.program)
            .map_err(|e| CaptureError::Precondition(format!("{:#}", e)))?;
        self.check_system_load().await?;

        self.state = SessionState::Joining;
        info!(
            "Starting session for call {} channel {} via {} gateway",
            request.call_id,
            request.channel_id,
            self.gateway.name()
        );

        let started_at = Utc::now();
        let session_id = unused_session_id(
            &request.output_dir,
            &format!("{}_{}", safe_component(&request.call_id), started_at.format("%Y%m%d_%H%M%S")),
        );
        let info = SessionInfo {
            output_path: request.output_dir.join(&session_id),
            session_id,
            call_id: request.call_id.clone(),
            channel_id: request.channel_id.clone(),
            started_at,
            format: request.format,
            bitrate_kbps: request.bitrate_kbps,
        };
        let owner_pid = std::process::id();

        let record = RegistryRecord {
            session_id: info.session_id.clone(),
            call_id: info.call_id.clone(),
            channel_id: info.channel_id.clone(),
            output_path: info.output_path.clone(),
            start_time: started_at,
            owner_pid,
            format: info.format,
            bitrate_kbps: info.bitrate_kbps,
        };

        match self.registry.claim(&record, self.probe.as_ref()) {
            Ok(Some(stale)) => info!("Replaced stale session {} of pid {}", stale.session_id, stale.owner_pid),
            Ok(None) => {}
            Err(e) => {
                self.state = SessionState::Idle;
                return Err(e.into());
            }
        }

        match self.connect(&info, owner_pid).await {
            Ok(active) => {
                self.active = Some(active);
                self.state = SessionState::Active;
                info!("Session {} active -> {}", info.session_id, info.output_path.display());
                Ok(info)
            }
            Err(e) => {
                error!("Failed to start session for call {}: {}", info.call_id, e);
                if let Err(release) = self.registry.release(&info.call_id, owner_pid) {
                    warn!("Failed to release registry record: {:#}", release);
                }
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    async fn check_system_load(&self) -> Result<(), CaptureError> {
        let limits = self.config.session.load_limits();
        if !limits.is_enabled() {
            return Ok(());
        }

        let Some(load) = SystemLoad::sample().await else {
            warn!("System load unavailable; skipping load check");
            return Ok(());
        };
        match load.exceeded(&limits) {
            Some(reason) => Err(CaptureError::Precondition(format!("system too busy to record: {}", reason))),
            None => {
                debug!("System load {}", load);
                Ok(())
            }
        }
    }

    /// Join, wait for readiness, create the session directory and initial tracks
    async fn connect(&self, info: &SessionInfo, owner_pid: u32) -> Result<ActiveSession, CaptureError> {
        let ready_timeout = self.config.session.ready_timeout();
        let deadline = Instant::now() + ready_timeout;

        let connection = time::timeout_at(deadline, self.gateway.join(&info.call_id, &info.channel_id))
            .await
            .map_err(|_| CaptureError::Transport(format!("join did not complete within {:?}", ready_timeout)))??;
        let handle = connection.handle;
        let mut events = connection.events;

        let mut pending = VecDeque::new();
        let ready = loop {
            match time::timeout_at(deadline, events.recv()).await {
                Ok(Some(ConnectionEvent::Ready)) => break Ok(()),
                Ok(Some(ConnectionEvent::Destroyed)) => {
                    break Err(CaptureError::Transport("connection destroyed before it was ready".into()))
                }
                Ok(Some(event)) => pending.push_back(event),
                Ok(None) => break Err(CaptureError::Transport("connection closed before it was ready".into())),
                Err(_) => {
                    break Err(CaptureError::Transport(format!(
                        "connection not ready within {:?}",
                        ready_timeout
                    )))
                }
            }
        };

        let prepared = ready.and_then(|()| create_session_dir(&info.output_path));
        if let Err(e) = prepared {
            handle.disconnect().await;
            return Err(e);
        }

        let mut session = Session::new(
            info.clone(),
            self.config.pcm_format(),
            self.config.frame_duration(),
            self.config.encoder.clone(),
        );

        match handle.members().await {
            Ok(members) => {
                for participant in members {
                    if self.receiver.accepts(&participant, handle.self_id()) {
                        if let Err(e) = session.ensure_track(&participant) {
                            warn!("No track for {}: {}", participant.id, e);
                        }
                    }
                }
            }
            Err(e) => warn!("Could not list channel members: {}", e),
        }

        Ok(ActiveSession {
            session,
            connection: handle,
            events,
            pending,
            owner_pid,
            marker: info.output_path.join(&self.config.session.stop_marker),
        })
    }

    /// Drive the session until it stops
    ///
    /// Ends on `shutdown`, a stop marker from another process, a lost
    /// connection, or an empty channel when auto-stop is enabled.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<SessionReport, CaptureError>
    where
        F: Future<Output = ()>,
    {
        let Some(mut active) = self.active.take() else {
            return Err(CaptureError::Precondition("no active session".into()));
        };
        tokio::pin!(shutdown);

        let mut poll = time::interval(self.config.session.stop_poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut reason = None;
        while let Some(event) = active.pending.pop_front() {
            reason = self.handle_event(&mut active, event).await;
            if reason.is_some() {
                break;
            }
        }

        let reason = match reason {
            Some(reason) => reason,
            None => loop {
                tokio::select! {
                    _ = &mut shutdown => break StopReason::Local,

                    _ = poll.tick() => {
                        if active.marker.exists() {
                            info!("Stop marker found at {}", active.marker.display());
                            break StopReason::RemoteRequest;
                        }
                    }

                    event = active.events.recv() => match event {
                        Some(event) => {
                            if let Some(reason) = self.handle_event(&mut active, event).await {
                                break reason;
                            }
                        }
                        None => break StopReason::ConnectionClosed,
                    },
                }
            },
        };

        self.finish(active, reason).await
    }

    /// Stop the active session from this process
    pub async fn stop(&mut self) -> Result<SessionReport, CaptureError> {
        match self.active.take() {
            Some(active) => self.finish(active, StopReason::Local).await,
            None => Err(CaptureError::Precondition("no active session".into())),
        }
    }

    async fn handle_event(&mut self, active: &mut ActiveSession, event: ConnectionEvent) -> Option<StopReason> {
        match event {
            ConnectionEvent::Ready => debug!("Connection ready"),

            ConnectionEvent::Disconnected => return self.recover(active).await,

            ConnectionEvent::Destroyed => {
                warn!("Connection destroyed");
                return Some(StopReason::ConnectionDestroyed);
            }

            ConnectionEvent::Presence {
                participant,
                change: PresenceChange::Joined,
            } => self.participant_joined(active, &participant),

            ConnectionEvent::Presence {
                participant,
                change: PresenceChange::Left,
            } => {
                if let Some(track) = active.session.track_mut(&participant.id) {
                    if let Err(e) = track.mark_absent().await {
                        warn!("Failed to release {}: {:#}", participant.id, e);
                    }
                }
                if self.config.session.auto_stop_when_empty && active.session.present_count() == 0 {
                    info!("Channel is empty; stopping");
                    return Some(StopReason::ChannelEmpty);
                }
            }

            ConnectionEvent::SpeakerStart { participant } => {
                match self
                    .receiver
                    .speaker_started(active.connection.as_ref(), &mut active.session, &participant)
                    .await
                {
                    Ok(true) => debug!("Attached live voice for {}", participant.id),
                    Ok(false) => {}
                    Err(e) => warn!("Could not attach voice for {}: {}", participant.id, e),
                }
            }

            ConnectionEvent::SpeakerStop { participant_id } => {
                if let Err(e) = self.receiver.speaker_stopped(&mut active.session, &participant_id).await {
                    warn!("Could not detach voice for {}: {}", participant_id, e);
                }
            }
        }
        None
    }

    fn participant_joined(&self, active: &mut ActiveSession, participant: &Participant) {
        if !self.receiver.accepts(participant, active.connection.self_id()) {
            return;
        }
        match active.session.ensure_track(participant) {
            Ok(track) => track.mark_present(),
            Err(e) => warn!("No track for {}: {}", participant.id, e),
        }
    }

    /// Bounded reconnection; tracks keep streaming silence meanwhile
    async fn recover(&mut self, active: &mut ActiveSession) -> Option<StopReason> {
        self.state = SessionState::Recovering;
        warn!("Connection lost; reconnecting");

        // Live sources belong to the dropped transport
        for track in active.session.tracks_mut() {
            if let Err(e) = track.detach().await {
                warn!("Failed to detach {}: {:#}", track.participant().id, e);
            }
        }

        let attempts = self.config.session.reconnect_attempts;
        let timeout = self.config.session.reconnect_timeout();
        for attempt in 1..=attempts {
            match time::timeout(timeout, active.connection.reconnect()).await {
                Ok(Ok(())) => {
                    info!("Reconnected on attempt {}/{}", attempt, attempts);
                    self.state = SessionState::Active;
                    self.resync_presence(active).await;
                    return None;
                }
                Ok(Err(e)) => warn!("Reconnect attempt {}/{} failed: {}", attempt, attempts, e),
                Err(_) => warn!("Reconnect attempt {}/{} timed out after {:?}", attempt, attempts, timeout),
            }
        }

        error!("Giving up after {} reconnect attempts", attempts);
        Some(StopReason::ReconnectFailed)
    }

    /// Reconcile track presence with the channel after a reconnect
    async fn resync_presence(&self, active: &mut ActiveSession) {
        let members = match active.connection.members().await {
            Ok(members) => members,
            Err(e) => {
                warn!("Could not list members after reconnect: {}", e);
                return;
            }
        };

        for track in active.session.tracks_mut() {
            let present = members.iter().any(|m| m.id == track.participant().id);
            if present {
                track.mark_present();
            } else if let Err(e) = track.mark_absent().await {
                warn!("Failed to mark {} absent: {:#}", track.participant().id, e);
            }
        }
        for participant in &members {
            self.participant_joined(active, participant);
        }
    }

    /// Stopping sequence: close tracks, release the connection, record metadata, clear the registry
    async fn finish(&mut self, mut active: ActiveSession, reason: StopReason) -> Result<SessionReport, CaptureError> {
        self.state = SessionState::Stopping;
        let info = active.session.info().clone();
        info!("Stopping session {} ({:?})", info.session_id, reason);

        let tracks = active.session.cleanup().await;
        active.connection.disconnect().await;

        let metadata = active.session.metadata(&tracks, Utc::now(), reason);
        let metadata_path = match metadata.write(&info.output_path) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("{:#}", e);
                None
            }
        };

        match fs::remove_file(&active.marker) {
            Ok(()) => debug!("Removed stop marker"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove stop marker {}: {}", active.marker.display(), e),
        }

        let released = self.registry.release(&info.call_id, active.owner_pid);
        self.state = SessionState::Stopped;
        released?;

        info!(
            "Session {} stopped after {:.1}s: {} of {} tracks kept",
            info.session_id,
            metadata.duration_secs,
            metadata.kept_files(),
            tracks.len()
        );

        Ok(SessionReport {
            metadata,
            metadata_path,
            tracks,
        })
    }
}

/// `base`, or `base_2`, `base_3`, ... if an earlier session already used it
fn unused_session_id(output_dir: &Path, base: &str) -> String {
    let mut session_id = base.to_string();
    let mut n = 1;
    while output_dir.join(&session_id).exists() {
        n += 1;
        session_id = format!("{}_{}", base, n);
    }
    session_id
}

/// Create the session directory, refusing one that already exists
fn create_session_dir(path: &Path) -> Result<(), CaptureError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory {}", parent.display()))?;
    }
    fs::create_dir(path)
        .with_context(|| format!("Failed to create session directory {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_skips_existing_directories() {
        let root = tempfile::TempDir::new().unwrap();
        let base = "guild-1_20250101_120000";
        assert_eq!(unused_session_id(root.path(), base), base);

        fs::create_dir(root.path().join(base)).unwrap();
        assert_eq!(unused_session_id(root.path(), base), format!("{}_2", base));

        fs::create_dir(root.path().join(format!("{}_2", base))).unwrap();
        assert_eq!(unused_session_id(root.path(), base), format!("{}_3", base));
    }

    #[test]
    fn test_existing_session_directory_is_refused() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("recordings").join("guild-1_20250101_120000");

        assert!(create_session_dir(&path).is_ok());
        assert!(create_session_dir(&path).is_err());
    }
}
