use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::engine::types::ProcessStatus;
use crate::probes::{ProbeError, ProcessStatusProvider};

#[derive(Debug, Clone, Default)]
struct TrackedProcess {
    pid: u32,
    sub_agent_pid: Option<u32>,
    exit_code: Option<i32>,
}

/// Registry of worker processes keyed by execution handle.
///
/// Whoever spawns workers registers their pids here; liveness is checked
/// against the OS on every lookup.
#[derive(Default)]
pub struct ProcessTable {
    processes: Mutex<HashMap<String, TrackedProcess>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, execution_handle: &str, pid: u32) -> Result<(), ProbeError> {
        self.lock()?.insert(
            execution_handle.to_string(),
            TrackedProcess {
                pid,
                ..TrackedProcess::default()
            },
        );
        debug!(execution = %execution_handle, pid, "Registered worker process");
        Ok(())
    }

    /// Attach (or detach with `None`) the worker's sub-agent process.
    pub fn set_sub_agent(&self, execution_handle: &str, pid: Option<u32>) -> Result<(), ProbeError> {
        if let Some(process) = self.lock()?.get_mut(execution_handle) {
            process.sub_agent_pid = pid;
        }
        Ok(())
    }

    /// Record that the worker exited; later lookups report it as stopped.
    pub fn mark_exited(&self, execution_handle: &str, exit_code: i32) -> Result<(), ProbeError> {
        if let Some(process) = self.lock()?.get_mut(execution_handle) {
            process.exit_code = Some(exit_code);
        }
        Ok(())
    }

    pub fn remove(&self, execution_handle: &str) -> Result<bool, ProbeError> {
        Ok(self.lock()?.remove(execution_handle).is_some())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, TrackedProcess>>, ProbeError> {
        self.processes
            .lock()
            .map_err(|_| ProbeError::Unavailable("process table lock poisoned".to_string()))
    }
}

#[async_trait]
impl ProcessStatusProvider for ProcessTable {
    async fn status(&self, execution_handle: &str) -> Result<Option<ProcessStatus>, ProbeError> {
        let process = match self.lock()?.get(execution_handle) {
            Some(p) => p.clone(),
            None => return Ok(None),
        };

        let running = process.exit_code.is_none() && pid_alive(process.pid);
        let sub_agent_alive = running && process.sub_agent_pid.is_some_and(pid_alive);

        Ok(Some(ProcessStatus {
            running,
            pid: Some(process.pid),
            exit_code: process.exit_code,
            sub_agent_alive,
        }))
    }
}

/// Signal 0 probes for existence without delivering anything.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: exists, owned by someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}
