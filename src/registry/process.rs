use anyhow::{bail, Result};
use std::ffi::OsString;
use std::sync::Mutex;
use sysinfo::{Pid, Process, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, warn};

use super::RegistryRecord;

/// Seconds of disagreement tolerated between a record's start time and the
/// start time the OS reports for its owner
const START_TIME_SLACK_SECS: u64 = 2;

/// Liveness and termination of registry owners
///
/// Every call names the record whose owner is meant. A pid that now belongs
/// to a different process is treated as gone and is never signalled.
pub trait ProcessProbe: Send + Sync {
    /// Whether the process that wrote `record` is still running
    fn is_owner(&self, record: &RegistryRecord) -> bool;

    /// Ask the owner to exit (SIGTERM where supported)
    fn terminate(&self, record: &RegistryRecord) -> Result<()>;

    /// Force the owner to exit
    fn kill(&self, record: &RegistryRecord) -> Result<()>;
}

/// Probe backed by the OS process table
///
/// Zombie and dead processes count as gone. So does a live process that
/// started after the record was written or runs a different program than
/// this one, since its pid was reused.
pub struct SysinfoProbe {
    system: Mutex<System>,
    program: Option<OsString>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        let own = Pid::from_u32(std::process::id());
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[own]), true);
        let program = system.process(own).map(|p| OsString::from(p.name()));

        Self {
            system: Mutex::new(system),
            program,
        }
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_owner<T>(&self, record: &RegistryRecord, f: impl FnOnce(Option<&Process>) -> T) -> T {
        let pid = Pid::from_u32(record.owner_pid);
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        f(system.process(pid).filter(|p| self.wrote(p, record)))
    }

    fn wrote(&self, process: &Process, record: &RegistryRecord) -> bool {
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return false;
        }

        let registered = record.start_time.timestamp().max(0) as u64;
        if process.start_time() > registered + START_TIME_SLACK_SECS {
            debug!(
                "pid {} started at {}, after call {} was registered at {}",
                record.owner_pid,
                process.start_time(),
                record.call_id,
                registered
            );
            return false;
        }

        match &self.program {
            Some(program) if OsString::from(process.name()) != *program => {
                debug!(
                    "pid {} runs {:?}, not {:?}",
                    record.owner_pid,
                    process.name(),
                    program
                );
                false
            }
            _ => true,
        }
    }
}

impl ProcessProbe for SysinfoProbe {
    fn is_owner(&self, record: &RegistryRecord) -> bool {
        self.with_owner(record, |process| process.is_some())
    }

    fn terminate(&self, record: &RegistryRecord) -> Result<()> {
        let pid = record.owner_pid;
        self.with_owner(record, |process| match process {
            None => {
                warn!("Not signalling pid {}: it no longer belongs to call {}", pid, record.call_id);
                Ok(())
            }
            Some(p) => match p.kill_with(Signal::Term) {
                Some(true) => Ok(()),
                Some(false) => bail!("Failed to send SIGTERM to pid {}", pid),
                // No SIGTERM on this platform
                None if p.kill() => Ok(()),
                None => bail!("Failed to terminate pid {}", pid),
            },
        })
    }

    fn kill(&self, record: &RegistryRecord) -> Result<()> {
        let pid = record.owner_pid;
        self.with_owner(record, |process| match process {
            None => Ok(()),
            Some(p) if p.kill() => Ok(()),
            Some(_) => bail!("Failed to kill pid {}", pid),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::OutputFormat;
    use chrono::{Duration, Utc};

    fn record_for(pid: u32) -> RegistryRecord {
        RegistryRecord {
            session_id: "call_20250101_120000".into(),
            call_id: "call".into(),
            channel_id: "voice".into(),
            output_path: std::env::temp_dir(),
            start_time: Utc::now(),
            owner_pid: pid,
            format: OutputFormat::Opus,
            bitrate_kbps: 96,
        }
    }

    #[test]
    fn test_own_process_owns_its_record() {
        let probe = SysinfoProbe::new();
        assert!(probe.is_owner(&record_for(std::process::id())));
    }

    #[test]
    fn test_record_older_than_process_is_not_owned() {
        let probe = SysinfoProbe::new();
        let mut record = record_for(std::process::id());
        record.start_time = Utc::now() - Duration::days(30);

        assert!(!probe.is_owner(&record));
    }

    #[cfg(unix)]
    #[test]
    fn test_reaped_child_is_not_owner() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let probe = SysinfoProbe::new();
        assert!(!probe.is_owner(&record_for(pid)));
        assert!(probe.kill(&record_for(pid)).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_other_program_on_owner_pid_is_left_alone() {
        let mut bystander = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let record = record_for(bystander.id());

        let probe = SysinfoProbe::new();
        assert!(!probe.is_owner(&record));
        assert!(probe.terminate(&record).is_ok());
        assert!(probe.kill(&record).is_ok());
        assert!(bystander.try_wait().unwrap().is_none(), "bystander must survive");

        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }
}
