// Integration tests for the cross-process session registry
//
// Owner processes are simulated with FakeProbe, so no real process is ever
// signalled. Timer-driven waits run on paused tokio time.

mod common;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use loqa_tracks::{
    request_stop, CaptureError, OutputFormat, RegistryError, RegistryRecord, SessionRegistry, StopOutcome,
    StopTimeouts, SysinfoProbe,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use common::FakeProbe;

const MARKER: &str = ".stop-requested";

fn record(call_id: &str, pid: u32, output_path: &Path) -> RegistryRecord {
    RegistryRecord {
        session_id: format!("{}_20250101_120000", call_id),
        call_id: call_id.to_string(),
        channel_id: "voice".to_string(),
        output_path: output_path.to_path_buf(),
        start_time: Utc::now(),
        owner_pid: pid,
        format: OutputFormat::Flac,
        bitrate_kbps: 96,
    }
}

fn timeouts() -> StopTimeouts {
    StopTimeouts {
        graceful: Duration::from_secs(2),
        terminate: Duration::from_millis(500),
        poll: Duration::from_millis(50),
    }
}

#[test]
fn test_claim_refuses_live_owner() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let registry = SessionRegistry::open(temp_dir.path())?;
    let probe = FakeProbe::new().with_alive(100);

    assert!(registry.claim(&record("call", 100, temp_dir.path()), &probe)?.is_none());

    // Verify: a second claimant is refused while 100 lives
    let err = registry.claim(&record("call", 200, temp_dir.path()), &probe).unwrap_err();
    assert!(matches!(err, RegistryError::Conflict { owner_pid: 100, .. }));
    assert_eq!(registry.load("call")?.map(|r| r.owner_pid), Some(100));

    // Other calls are independent
    assert!(registry.claim(&record("other", 200, temp_dir.path()), &probe).is_ok());

    Ok(())
}

#[test]
fn test_claim_replaces_dead_owner() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let registry = SessionRegistry::open(temp_dir.path())?;
    let probe = FakeProbe::new();

    registry.claim(&record("call", 100, temp_dir.path()), &probe)?;
    let stale = registry.claim(&record("call", 200, temp_dir.path()), &probe)?;

    assert_eq!(stale.map(|r| r.owner_pid), Some(100));
    assert_eq!(registry.load("call")?.map(|r| r.owner_pid), Some(200));

    Ok(())
}

#[test]
fn test_release_requires_matching_owner() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let registry = SessionRegistry::open(temp_dir.path())?;
    registry.claim(&record("call", 100, temp_dir.path()), &FakeProbe::new())?;

    assert!(!registry.release("call", 999)?);
    assert!(registry.load("call")?.is_some());

    assert!(registry.release("call", 100)?);
    assert!(registry.load("call")?.is_none());
    assert!(!registry.release("call", 100)?);

    Ok(())
}

#[test]
fn test_list_orders_by_start_time() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let registry = SessionRegistry::open(temp_dir.path())?;
    let probe = FakeProbe::new();

    let mut older = record("b-call", 1, temp_dir.path());
    older.start_time = Utc::now() - ChronoDuration::minutes(5);
    registry.claim(&record("a-call", 2, temp_dir.path()), &probe)?;
    registry.claim(&older, &probe)?;

    let calls: Vec<_> = registry.list()?.into_iter().map(|r| r.call_id).collect();
    assert_eq!(calls, vec!["b-call", "a-call"]);

    assert!(registry.clear("a-call")?);
    assert_eq!(registry.list()?.len(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_without_record_is_not_running() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let registry = SessionRegistry::open(temp_dir.path())?;

    let outcome = request_stop(&registry, &FakeProbe::new(), "call", MARKER, timeouts()).await?;
    assert_eq!(outcome, StopOutcome::NotRunning);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_clears_stale_record() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let registry = SessionRegistry::open(temp_dir.path())?;
    let probe = FakeProbe::new();
    registry.claim(&record("call", 100, temp_dir.path()), &probe)?;

    let outcome = request_stop(&registry, &probe, "call", MARKER, timeouts()).await?;

    assert_eq!(outcome, StopOutcome::StaleCleared);
    assert!(registry.load("call")?.is_none());
    assert!(probe.signals().is_empty());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_owner_honours_stop_marker() -> Result<()> {
    // Setup: an owner that releases its record once the marker appears
    let temp_dir = TempDir::new()?;
    let session_dir = temp_dir.path().join("session");
    std::fs::create_dir(&session_dir)?;
    let registry = SessionRegistry::open(temp_dir.path().join("registry"))?;
    let probe = Arc::new(FakeProbe::new().with_alive(100));
    registry.claim(&record("call", 100, &session_dir), probe.as_ref())?;

    let owner_registry = registry.clone();
    let marker = session_dir.join(MARKER);
    let owner = tokio::spawn(async move {
        while !marker.exists() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        owner_registry.release("call", 100).unwrap();
    });

    let outcome = request_stop(&registry, probe.as_ref(), "call", MARKER, timeouts()).await?;
    owner.await?;

    // Verify: graceful stop, no signals sent
    assert_eq!(outcome, StopOutcome::Stopped);
    assert!(registry.load("call")?.is_none());
    assert!(probe.signals().is_empty());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_owner_is_terminated() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let registry = SessionRegistry::open(temp_dir.path())?;
    let probe = FakeProbe::new().with_alive(100).dies_on_terminate();
    registry.claim(&record("call", 100, temp_dir.path()), &probe)?;

    let outcome = request_stop(&registry, &probe, "call", MARKER, timeouts()).await?;

    assert_eq!(outcome, StopOutcome::Terminated);
    assert_eq!(probe.signals(), vec![(100, "term")]);
    assert!(registry.load("call")?.is_none());
    assert!(temp_dir.path().join(MARKER).exists());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_sigterm_resistant_owner_is_killed() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let registry = SessionRegistry::open(temp_dir.path())?;
    let probe = FakeProbe::new().with_alive(100).dies_on_kill();
    registry.claim(&record("call", 100, temp_dir.path()), &probe)?;

    let outcome = request_stop(&registry, &probe, "call", MARKER, timeouts()).await?;

    assert_eq!(outcome, StopOutcome::Terminated);
    assert_eq!(probe.signals(), vec![(100, "term"), (100, "kill")]);
    assert!(registry.load("call")?.is_none());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unkillable_owner_times_out() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let registry = SessionRegistry::open(temp_dir.path())?;
    let probe = FakeProbe::new().with_alive(100);
    registry.claim(&record("call", 100, temp_dir.path()), &probe)?;

    let err = request_stop(&registry, &probe, "call", MARKER, timeouts()).await.unwrap_err();

    assert!(matches!(err, CaptureError::RemoteStopTimeout { owner_pid: 100, .. }));
    // The record of a live owner is never removed behind its back
    assert!(registry.load("call")?.is_some());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missing_session_dir_escalates_immediately() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let registry = SessionRegistry::open(temp_dir.path())?;
    let probe = FakeProbe::new().with_alive(100).dies_on_terminate();
    registry.claim(&record("call", 100, &temp_dir.path().join("gone")), &probe)?;

    let started = tokio::time::Instant::now();
    let outcome = request_stop(&registry, &probe, "call", MARKER, timeouts()).await?;

    assert_eq!(outcome, StopOutcome::Terminated);
    assert!(started.elapsed() < timeouts().graceful);

    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_reused_pid_is_never_signalled() -> Result<()> {
    // Setup: a record whose owner pid now belongs to an unrelated program
    let temp_dir = TempDir::new()?;
    let registry = SessionRegistry::open(temp_dir.path())?;
    let mut bystander = std::process::Command::new("sleep").arg("60").spawn()?;
    let stale = record("call", bystander.id(), temp_dir.path());
    registry.claim(&stale, &FakeProbe::new())?;

    let probe = SysinfoProbe::new();
    let outcome = request_stop(&registry, &probe, "call", MARKER, timeouts()).await;

    // Verify: the record is cleared as stale and the bystander keeps running
    let still_running = bystander.try_wait()?.is_none();
    bystander.kill()?;
    bystander.wait()?;

    assert_eq!(outcome?, StopOutcome::StaleCleared);
    assert!(still_running, "unrelated process was signalled");
    assert!(registry.load("call")?.is_none());

    // A new owner can claim the call
    let fresh = record("call", std::process::id(), temp_dir.path());
    registry.claim(&stale, &FakeProbe::new())?;
    assert!(registry.claim(&fresh, &probe)?.is_some());

    Ok(())
}
