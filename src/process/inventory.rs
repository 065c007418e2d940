//! Host process discovery and termination

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{ProcessRefreshKind, System};

use crate::common::{Error, Result};

/// A live process on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub arguments: Vec<String>,
}

/// Selects processes of one kind that belong to one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFilter {
    /// Executable name, e.g. `xcodebuild`
    pub kind: String,
    /// Device the process was launched for
    pub device_id: String,
}

impl ProcessFilter {
    pub fn new(kind: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            device_id: device_id.into(),
        }
    }

    pub fn matches(&self, process: &ProcessInfo) -> bool {
        self.is_kind(process) && self.names_device(process)
    }

    fn is_kind(&self, process: &ProcessInfo) -> bool {
        if process.name == self.kind {
            return true;
        }
        process
            .arguments
            .first()
            .and_then(|argv0| Path::new(argv0).file_name())
            .and_then(|name| name.to_str())
            == Some(self.kind.as_str())
    }

    // Either a bare argument or an `id=` key in a destination specifier
    // such as `platform=iOS,id=<udid>`.
    fn names_device(&self, process: &ProcessInfo) -> bool {
        process.arguments.iter().any(|arg| {
            arg == &self.device_id
                || arg
                    .split(',')
                    .any(|part| part.strip_prefix("id=") == Some(self.device_id.as_str()))
        })
    }
}

/// Lists and terminates host processes
#[async_trait]
pub trait ProcessInventory: Send + Sync {
    /// Processes currently matching `filter`
    async fn find(&self, filter: &ProcessFilter) -> Result<Vec<ProcessInfo>>;

    /// Stop a process, waiting up to `grace` before forcing it
    ///
    /// Returns `false` if the process had already exited.
    async fn terminate(&self, process: &ProcessInfo, grace: Duration) -> Result<bool>;
}

/// Inventory backed by the host process table
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInventory;

/// Interval between liveness checks while waiting for a process to exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[async_trait]
impl ProcessInventory for SystemInventory {
    async fn find(&self, filter: &ProcessFilter) -> Result<Vec<ProcessInfo>> {
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || {
            let own_pid = std::process::id();
            let mut system = System::new();
            system.refresh_processes_specifics(ProcessRefreshKind::everything());

            system
                .processes()
                .values()
                .map(|process| ProcessInfo {
                    pid: process.pid().as_u32(),
                    name: process.name().to_string(),
                    arguments: process.cmd().to_vec(),
                })
                .filter(|info| info.pid != own_pid && filter.matches(info))
                .collect()
        })
        .await
        .map_err(|e| Error::InventoryQuery(e.to_string()))
    }

    #[cfg(unix)]
    async fn terminate(&self, process: &ProcessInfo, grace: Duration) -> Result<bool> {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(process.pid as i32);

        match signal::kill(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(false),
            Err(e) => {
                return Err(Error::Internal(format!(
                    "Failed to signal process {}: {}",
                    process.pid, e
                )))
            }
        }
        tracing::debug!(pid = process.pid, "Sent SIGTERM");

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !process_exists(pid)? {
                return Ok(true);
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        tracing::warn!(pid = process.pid, "Process ignored SIGTERM, sending SIGKILL");
        match signal::kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                return Err(Error::Internal(format!(
                    "Failed to kill process {}: {}",
                    process.pid, e
                )))
            }
        }

        tokio::time::sleep(EXIT_POLL_INTERVAL * 2).await;
        if process_exists(pid)? {
            return Err(Error::Internal(format!(
                "Process {} still exists after SIGKILL",
                process.pid
            )));
        }
        Ok(true)
    }

    #[cfg(not(unix))]
    async fn terminate(&self, process: &ProcessInfo, _grace: Duration) -> Result<bool> {
        Err(Error::Internal(format!(
            "Terminating process {} is not supported on this platform",
            process.pid
        )))
    }
}

#[cfg(unix)]
fn process_exists(pid: nix::unistd::Pid) -> Result<bool> {
    match nix::sys::signal::kill(pid, None) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::ESRCH) => Ok(false),
        Err(e) => Err(Error::Internal(format!(
            "Error checking if process {} exists: {}",
            pid, e
        ))),
    }
}
