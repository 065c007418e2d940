//! Test runner process supervision
//!
//! Spawns `xcodebuild` for one run and wraps the child in a [`RunHandle`]:
//! its stdout and stderr are drained line by line on the device queue,
//! the first line counts as proof of life, and exit is observable through
//! [`RunHandle::wait`]. A handle dropped while the process is alive kills
//! it.

use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::common::{Error, Result};
use crate::device::DeviceQueue;
use crate::run::{LaunchConfiguration, RunReporter};

/// Label attached to the test runner's logs and process handle
pub const XCODEBUILD_LABEL: &str = "xcodebuild";

/// Environment variable carrying a custom simulator device set
pub const SIM_DEVICE_SET_ENV: &str = "SIM_DEVICE_SET_PATH";

/// Environment variable carrying the macOS test shim
pub const TEST_SHIM_ENV: &str = "XCTEST_SHIM_PATH";

/// How long to keep draining output after the process exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything needed to start the test runner for one run
pub struct SpawnRequest<'a> {
    pub device_id: &'a str,
    pub configuration: &'a LaunchConfiguration,
    pub tool_path: &'a Path,
    pub xctestrun_path: &'a Path,
    /// Reserved for simulator runs. Device runs pass `None`.
    pub simulator_device_set: Option<&'a Path>,
    /// Reserved for macOS test runs. Device runs pass `None`.
    pub macos_test_shim: Option<&'a Path>,
    pub working_dir: &'a Path,
    pub queue: &'a DeviceQueue,
    /// Parent span for the run's `xcodebuild` span
    pub logger: &'a Span,
    pub reporter: Arc<dyn RunReporter>,
}

/// Command line for a `test-without-building` run against one device
pub fn xcodebuild_arguments(xctestrun_path: &Path, device_id: &str) -> Vec<OsString> {
    vec![
        "test-without-building".into(),
        "-xctestrun".into(),
        xctestrun_path.as_os_str().to_owned(),
        "-destination".into(),
        format!("id={}", device_id).into(),
    ]
}

/// Start the test runner
pub fn spawn(request: SpawnRequest<'_>) -> Result<RunHandle> {
    let span = tracing::info_span!(
        parent: request.logger,
        "xcodebuild",
        device = %request.device_id,
        pid = tracing::field::Empty,
    );

    let mut cmd = Command::new(request.tool_path);
    cmd.args(xcodebuild_arguments(request.xctestrun_path, request.device_id))
        .current_dir(request.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(device_set) = request.simulator_device_set {
        cmd.env(SIM_DEVICE_SET_ENV, device_set);
    }
    if let Some(shim) = request.macos_test_shim {
        cmd.env(TEST_SHIM_ENV, shim);
    }

    let mut child = cmd.spawn().map_err(|e| {
        Error::SpawnFailed(format!(
            "Failed to start {}: {}",
            request.tool_path.display(),
            e
        ))
    })?;

    let pid = child
        .id()
        .ok_or_else(|| Error::SpawnFailed("Process exited before reporting a pid".to_string()))?;
    span.record("pid", pid);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::SpawnFailed("Failed to get test runner stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::SpawnFailed("Failed to get test runner stderr".to_string()))?;

    let alive = Arc::new(Notify::new());
    let monitors = vec![
        request.queue.spawn(monitor_output(
            stdout,
            "stdout",
            alive.clone(),
            request.reporter.clone(),
            span.clone(),
        )),
        request.queue.spawn(monitor_output(
            stderr,
            "stderr",
            alive.clone(),
            request.reporter.clone(),
            span.clone(),
        )),
    ];

    tracing::info!(
        parent: &span,
        tool = %request.tool_path.display(),
        xctestrun = %request.xctestrun_path.display(),
        "Spawned test runner"
    );
    request.reporter.process_started(pid, request.configuration);

    Ok(RunHandle {
        pid,
        label: XCODEBUILD_LABEL,
        child,
        alive,
        monitors,
        exit_status: None,
        span,
        reporter: request.reporter,
    })
}

async fn monitor_output<R>(
    stream: R,
    source: &'static str,
    alive: Arc<Notify>,
    reporter: Arc<dyn RunReporter>,
    span: Span,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                alive.notify_one();
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                tracing::debug!(parent: &span, source, "{}", line);
                reporter.output(line);
            }
            Err(e) => {
                tracing::warn!(parent: &span, source, "Failed to read test runner output: {}", e);
                break;
            }
        }
    }
}

/// Outcome of the confirmation stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The process produced output and is presumed running
    Alive,
    /// The process exited before producing any output
    Exited(ExitStatus),
}

/// A running test runner process and its output monitors
pub struct RunHandle {
    pid: u32,
    label: &'static str,
    child: Child,
    alive: Arc<Notify>,
    monitors: Vec<JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
    span: Span,
    reporter: Arc<dyn RunReporter>,
}

impl RunHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Wait for the first sign of life or for the process to exit
    pub async fn confirm(&mut self, timeout: Duration) -> Result<Liveness> {
        let alive = self.alive.clone();
        let child = &mut self.child;

        let confirmation = async {
            tokio::select! {
                _ = alive.notified() => Ok::<_, Error>(Liveness::Alive),
                status = child.wait() => Ok(Liveness::Exited(status?)),
            }
        };

        match tokio::time::timeout(timeout, confirmation).await {
            Ok(result) => result,
            Err(_) => Err(Error::LivenessTimeout(timeout)),
        }
    }

    /// Wait for the process to exit and its output to be drained
    ///
    /// Later calls return the status observed by the first one.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        let status = self.child.wait().await?;

        for mut monitor in self.monitors.drain(..) {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut monitor)
                .await
                .is_err()
            {
                // Grandchildren can keep the pipe open after exit
                monitor.abort();
            }
        }

        tracing::info!(parent: &self.span, %status, "Test runner exited");
        self.exit_status = Some(status);
        self.reporter.process_exited(self.pid, status);
        Ok(status)
    }

    /// Wait for exit, treating an unsuccessful status as an error
    pub async fn finish(&mut self) -> Result<()> {
        let status = self.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::ProcessFailed {
                label: self.label.to_string(),
                pid: self.pid,
                status: status.to_string(),
            })
        }
    }

    /// Kill the process if it is still running and reap it
    pub async fn terminate(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            tracing::info!(parent: &self.span, "Killing test runner");
            if let Err(e) = self.child.kill().await {
                tracing::warn!(parent: &self.span, "Failed to kill test runner: {}", e);
            }
        }
        for monitor in &self.monitors {
            monitor.abort();
        }
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        // Best effort, we can't await in drop
        if matches!(self.child.try_wait(), Ok(None)) {
            tracing::debug!(parent: &self.span, "Test runner dropped while running, killing");
            let _ = self.child.start_kill();
        }
        for monitor in &self.monitors {
            monitor.abort();
        }
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("pid", &self.pid)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
