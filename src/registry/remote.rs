// Stopping a session owned by another process
//
// The owner polls its session directory for a marker file. A requester writes
// the marker, then waits for the owner to remove its registry record. If the
// owner does not react in time it is sent SIGTERM, then SIGKILL, each with its
// own wait, and the record is cleared on its behalf.

use std::fs;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{info, warn};

use super::{ProcessProbe, RegistryRecord, SessionRegistry};
use crate::config::Config;
use crate::error::CaptureError;

/// How a stop request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No record for the call
    NotRunning,
    /// A record existed but its owner was already dead
    StaleCleared,
    /// The owner stopped gracefully after seeing the marker
    Stopped,
    /// The owner had to be terminated
    Terminated,
}

#[derive(Debug, Clone, Copy)]
pub struct StopTimeouts {
    /// Wait for a graceful stop after the marker is written
    pub graceful: Duration,
    /// Wait after each termination signal
    pub terminate: Duration,
    pub poll: Duration,
}

impl StopTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            graceful: Duration::from_millis(config.registry.remote_stop_timeout_ms),
            terminate: Duration::from_millis(config.registry.terminate_timeout_ms),
            poll: Duration::from_millis(200),
        }
    }
}

/// Stop whichever process owns `call_id`
pub async fn request_stop(
    registry: &SessionRegistry,
    probe: &dyn ProcessProbe,
    call_id: &str,
    marker_name: &str,
    timeouts: StopTimeouts,
) -> Result<StopOutcome, CaptureError> {
    let Some(record) = registry.load(call_id)? else {
        info!("No session registered for call {}", call_id);
        return Ok(StopOutcome::NotRunning);
    };
    let pid = record.owner_pid;

    if !probe.is_owner(&record) {
        info!("Owner {} of call {} is gone; clearing record", pid, call_id);
        registry.clear(call_id)?;
        return Ok(StopOutcome::StaleCleared);
    }

    let marker = record.output_path.join(marker_name);
    match fs::write(&marker, record.session_id.as_bytes()) {
        Ok(()) => {
            info!("Stop requested for call {} (pid {}) via {}", call_id, pid, marker.display());
            if wait_for_release(registry, probe, &record, timeouts.graceful, timeouts.poll).await? {
                return Ok(StopOutcome::Stopped);
            }
            warn!("Call {} did not stop within {:?}; terminating pid {}", call_id, timeouts.graceful, pid);
        }
        Err(e) => warn!(
            "Cannot write stop marker {}: {}; terminating pid {}",
            marker.display(),
            e,
            pid
        ),
    }

    if let Err(e) = probe.terminate(&record) {
        warn!("{:#}", e);
    }
    if wait_for_exit(registry, probe, &record, timeouts.terminate, timeouts.poll).await? {
        return Ok(StopOutcome::Terminated);
    }

    warn!("pid {} survived SIGTERM; killing", pid);
    if let Err(e) = probe.kill(&record) {
        warn!("{:#}", e);
    }
    if wait_for_exit(registry, probe, &record, timeouts.terminate, timeouts.poll).await? {
        return Ok(StopOutcome::Terminated);
    }

    Err(CaptureError::RemoteStopTimeout {
        call_id: call_id.to_string(),
        owner_pid: pid,
    })
}

/// Whether the registry no longer holds this exact record
fn released(registry: &SessionRegistry, record: &RegistryRecord) -> Result<bool, CaptureError> {
    Ok(registry
        .load(&record.call_id)?
        .map_or(true, |current| current.session_id != record.session_id))
}

/// Poll until the owner removes its record
///
/// An owner that dies without cleaning up also counts; its record is cleared.
async fn wait_for_release(
    registry: &SessionRegistry,
    probe: &dyn ProcessProbe,
    record: &RegistryRecord,
    timeout: Duration,
    poll: Duration,
) -> Result<bool, CaptureError> {
    let deadline = Instant::now() + timeout;
    loop {
        if released(registry, record)? {
            return Ok(true);
        }
        if !probe.is_owner(record) {
            registry.release(&record.call_id, record.owner_pid)?;
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        time::sleep(poll).await;
    }
}

/// Poll until the owner is gone, then clear its record
async fn wait_for_exit(
    registry: &SessionRegistry,
    probe: &dyn ProcessProbe,
    record: &RegistryRecord,
    timeout: Duration,
    poll: Duration,
) -> Result<bool, CaptureError> {
    let deadline = Instant::now() + timeout;
    loop {
        if !probe.is_owner(record) {
            registry.release(&record.call_id, record.owner_pid)?;
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        time::sleep(poll).await;
    }
}
