// Shared fixtures for integration tests
//
// Encoders are replaced by `sh -c 'cat > "$0"'` so track files hold the exact
// raw PCM the sink was fed, and owner processes are simulated by FakeProbe.

#![allow(dead_code)]

use anyhow::Result;
use loqa_tracks::config::EncoderConfig;
use loqa_tracks::{
    pcm_decoder_factory, Config, OutputFormat, ProcessProbe, RegistryRecord, Script, ScriptedGateway,
    SessionController, SessionRegistry, SysinfoProbe,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// 8kHz mono, 20ms frames
pub const FRAME_MS: u64 = 20;
pub const BYTES_PER_FRAME: u64 = 320;

pub fn raw_pcm_encoder() -> EncoderConfig {
    EncoderConfig {
        program: "sh".to_string(),
        args: Some(vec!["-c".into(), "cat > \"$0\"".into(), "{output}".into()]),
        close_grace_ms: 2000,
        min_output_bytes: 1024,
    }
}

pub fn test_config(registry_dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.audio.sample_rate = 8000;
    cfg.audio.channels = 1;
    cfg.audio.frame_duration_ms = FRAME_MS;
    cfg.audio.format = OutputFormat::Wav;
    cfg.encoder = raw_pcm_encoder();
    cfg.session.ready_timeout_ms = 1000;
    cfg.session.reconnect_timeout_ms = 500;
    cfg.session.reconnect_attempts = 2;
    cfg.session.stop_poll_interval_ms = 50;
    cfg.session.trailing_silence_ms = 100;
    cfg.session.max_cpu_percent = 100.0;
    cfg.session.max_memory_percent = 100.0;
    cfg.registry.dir = Some(registry_dir.to_path_buf());
    cfg.registry.remote_stop_timeout_ms = 2000;
    cfg.registry.terminate_timeout_ms = 500;
    cfg
}

pub fn controller(cfg: Config, script: Script, probe: Arc<dyn ProcessProbe>) -> Result<SessionController> {
    let registry = SessionRegistry::open(cfg.registry.dir())?;
    let gateway = ScriptedGateway::new(script, cfg.pcm_format(), cfg.frame_duration());
    Ok(SessionController::new(
        cfg,
        Arc::new(gateway),
        pcm_decoder_factory(),
        registry,
        probe,
    ))
}

pub fn real_probe() -> Arc<dyn ProcessProbe> {
    Arc::new(SysinfoProbe::new())
}

/// Scripted process table, keyed by pid
#[derive(Default)]
pub struct FakeProbe {
    alive: Mutex<HashSet<u32>>,
    dies_on_terminate: bool,
    dies_on_kill: bool,
    signals: Mutex<Vec<(u32, &'static str)>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alive(self, pid: u32) -> Self {
        self.alive.lock().unwrap().insert(pid);
        self
    }

    pub fn dies_on_terminate(mut self) -> Self {
        self.dies_on_terminate = true;
        self
    }

    pub fn dies_on_kill(mut self) -> Self {
        self.dies_on_kill = true;
        self
    }

    pub fn set_alive(&self, pid: u32, alive: bool) {
        let mut set = self.alive.lock().unwrap();
        if alive {
            set.insert(pid);
        } else {
            set.remove(&pid);
        }
    }

    pub fn signals(&self) -> Vec<(u32, &'static str)> {
        self.signals.lock().unwrap().clone()
    }
}

impl ProcessProbe for FakeProbe {
    fn is_owner(&self, record: &RegistryRecord) -> bool {
        self.alive.lock().unwrap().contains(&record.owner_pid)
    }

    fn terminate(&self, record: &RegistryRecord) -> Result<()> {
        let pid = record.owner_pid;
        self.signals.lock().unwrap().push((pid, "term"));
        if self.dies_on_terminate {
            self.set_alive(pid, false);
        }
        Ok(())
    }

    fn kill(&self, record: &RegistryRecord) -> Result<()> {
        let pid = record.owner_pid;
        self.signals.lock().unwrap().push((pid, "kill"));
        if self.dies_on_kill {
            self.set_alive(pid, false);
        }
        Ok(())
    }
}

/// Frames implied by a track's lifetime, within scheduling slack
pub fn assert_continuous(total_frames: u64, created_at_ms: u64, closed_at_ms: u64) {
    let expected = (closed_at_ms - created_at_ms) / FRAME_MS;
    let slack = 4;
    assert!(
        total_frames + slack >= expected && total_frames <= expected + slack,
        "track wrote {} frames over {}ms, expected about {}",
        total_frames,
        closed_at_ms - created_at_ms,
        expected
    );
}
