//! End-to-end tests for the run coordinator
//!
//! These tests drive real processes. The resolved "tool" is `/bin/sh` and
//! the first xcodebuild argument, `test-without-building`, names a script
//! in the working directory, so each test scripts its own runner while the
//! coordinator runs exactly the command line it would give xcodebuild.
//! The device and process inventory are in-memory fakes.

#![cfg(unix)]

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use tempfile::TempDir;
use tracing::Span;

use xctest_runner::device::{open_test_management_channel, ServiceConnection};
use xctest_runner::process::{ProcessFilter, ProcessInfo, ProcessInventory};
use xctest_runner::run::RunConfigBuilder;
use xctest_runner::tool::ToolLocator;
use xctest_runner::{
    Device, DeviceQueue, Error, LaunchConfiguration, Result, RunCoordinator, RunReporter,
    RunState,
};

const UDID: &str = "00008030-001A2B3C4D5E6F70";

/// Ordered record of collaborator calls across one test
#[derive(Default)]
struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.snapshot()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

struct FakeDevice {
    queue: DeviceQueue,
    refuse_services: bool,
}

impl FakeDevice {
    fn new() -> Self {
        Self {
            queue: DeviceQueue::current().unwrap(),
            refuse_services: false,
        }
    }
}

#[async_trait]
impl Device for FakeDevice {
    fn identifier(&self) -> &str {
        UDID
    }

    fn queue(&self) -> &DeviceQueue {
        &self.queue
    }

    async fn start_service(&self, service: &str) -> Result<ServiceConnection> {
        if self.refuse_services {
            return Err(Error::channel(service, "device locked"));
        }
        let (ours, _theirs) = UnixStream::pair()?;
        Ok(ServiceConnection::new(service, ours))
    }
}

#[derive(Default)]
struct FakeInventory {
    processes: Mutex<Vec<ProcessInfo>>,
    terminated: Mutex<Vec<u32>>,
    fail_query: bool,
    events: Arc<EventLog>,
}

#[async_trait]
impl ProcessInventory for FakeInventory {
    async fn find(&self, filter: &ProcessFilter) -> Result<Vec<ProcessInfo>> {
        self.events.push("find");
        if self.fail_query {
            return Err(Error::InventoryQuery("sysctl failed".to_string()));
        }
        Ok(self
            .processes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn terminate(&self, process: &ProcessInfo, _grace: Duration) -> Result<bool> {
        self.events.push(format!("terminate:{}", process.pid));
        self.processes.lock().unwrap().retain(|p| p.pid != process.pid);
        self.terminated.lock().unwrap().push(process.pid);
        Ok(true)
    }
}

/// Writes the real artifact, recording the call
struct RecordingBuilder {
    events: Arc<EventLog>,
    fail: bool,
}

#[async_trait]
impl RunConfigBuilder for RecordingBuilder {
    async fn write(
        &self,
        configuration: &LaunchConfiguration,
        working_dir: &Path,
    ) -> Result<PathBuf> {
        self.events.push("write");
        if self.fail {
            return Err(Error::ConfigurationWrite("disk full".to_string()));
        }
        xctest_runner::run::XctestrunWriter
            .write(configuration, working_dir)
            .await
    }
}

/// Resolves to whatever path the test sets, or fails when unset
struct SettableLocator {
    path: Mutex<Option<PathBuf>>,
    events: Arc<EventLog>,
}

impl SettableLocator {
    fn set(&self, path: Option<PathBuf>) {
        *self.path.lock().unwrap() = path;
    }
}

#[async_trait]
impl ToolLocator for SettableLocator {
    async fn locate(&self) -> Result<PathBuf> {
        self.events.push("locate");
        self.path
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::tool_not_found("xcodebuild", &["PATH"]))
    }
}

struct RecordingReporter {
    events: Arc<EventLog>,
    pids: Mutex<Vec<u32>>,
}

impl RunReporter for RecordingReporter {
    fn process_started(&self, pid: u32, configuration: &LaunchConfiguration) {
        self.pids.lock().unwrap().push(pid);
        self.events
            .push(format!("started:{}", configuration.test_bundle.display()));
    }

    fn output(&self, line: &str) {
        self.events.push(format!("output:{}", line));
    }

    fn process_exited(&self, _pid: u32, status: ExitStatus) {
        self.events.push(format!("exited:{}", status.success()));
    }

    fn run_finished(&self, result: &Result<()>) {
        self.events
            .push(format!("finished:{}", if result.is_ok() { "ok" } else { "err" }));
    }
}

/// Test context with fakes and a scratch working directory
struct TestContext {
    _temp: TempDir,
    work_dir: PathBuf,
    events: Arc<EventLog>,
    inventory: Arc<FakeInventory>,
    locator: Arc<SettableLocator>,
    reporter: Arc<RecordingReporter>,
}

impl TestContext {
    fn new() -> Self {
        Self::with_inventory(|_| {})
    }

    fn with_inventory(setup: impl FnOnce(&mut FakeInventory)) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let work_dir = temp.path().join("runs");
        std::fs::create_dir_all(&work_dir).unwrap();

        let events = Arc::new(EventLog::default());
        let mut inventory = FakeInventory {
            events: events.clone(),
            ..Default::default()
        };
        setup(&mut inventory);

        Self {
            _temp: temp,
            work_dir,
            inventory: Arc::new(inventory),
            locator: Arc::new(SettableLocator {
                path: Mutex::new(Some(PathBuf::from("/bin/sh"))),
                events: events.clone(),
            }),
            reporter: Arc::new(RecordingReporter {
                events: events.clone(),
                pids: Mutex::new(Vec::new()),
            }),
            events,
        }
    }

    /// Script run in place of xcodebuild
    fn runner_script(&self, body: &str) {
        std::fs::write(self.work_dir.join("test-without-building"), body).unwrap();
    }

    fn coordinator<'d>(&self, device: &'d FakeDevice) -> RunCoordinator<'d> {
        self.coordinator_with_builder(device, false)
    }

    fn coordinator_with_builder<'d>(
        &self,
        device: &'d FakeDevice,
        failing_builder: bool,
    ) -> RunCoordinator<'d> {
        RunCoordinator::new(device, self.work_dir.clone())
            .with_inventory(self.inventory.clone())
            .with_config_builder(Arc::new(RecordingBuilder {
                events: self.events.clone(),
                fail: failing_builder,
            }))
            .with_tool_locator(self.locator.clone())
            .with_liveness_timeout(Duration::from_secs(10))
            .with_terminate_grace(Duration::from_millis(10))
    }

    fn reporter(&self) -> Arc<dyn RunReporter> {
        self.reporter.clone()
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.work_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().ends_with(".xctestrun.json"))
            .collect()
    }
}

fn configuration(name: &str) -> LaunchConfiguration {
    LaunchConfiguration::new(format!("/bundles/{}.xctest", name))
}

async fn wait_for_state(coordinator: &RunCoordinator<'_>, state: RunState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while coordinator.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("coordinator never reached expected state");
}

/// Wait until `pid` no longer names a process (killed and reaped)
async fn wait_for_exit(pid: u32) {
    let pid = Pid::from_raw(pid as i32);
    tokio::time::timeout(Duration::from_secs(5), async {
        while signal::kill(pid, None) != Err(Errno::ESRCH) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("test runner process survived cancellation");
}

#[tokio::test]
async fn test_successful_run_sequence() {
    let ctx = TestContext::new();
    ctx.runner_script("echo 'Test Suite All tests started'\necho \"$@\" > args.txt\nexit 0\n");
    let device = FakeDevice::new();
    let coordinator = ctx.coordinator(&device);

    coordinator
        .start_run(configuration("AppTests"), ctx.reporter(), Span::none())
        .await
        .unwrap();

    assert_eq!(coordinator.state(), RunState::Idle);

    let events: Vec<_> = ctx
        .events
        .snapshot()
        .into_iter()
        .filter(|e| !e.starts_with("output:"))
        .collect();
    assert_eq!(
        events,
        [
            "find",
            "write",
            "locate",
            "started:/bundles/AppTests.xctest",
            "exited:true",
            "finished:ok"
        ]
    );
    assert_eq!(ctx.events.count("output:Test Suite All tests started"), 1);

    let artifacts = ctx.artifacts();
    assert_eq!(artifacts.len(), 1);

    let args = std::fs::read_to_string(ctx.work_dir.join("args.txt")).unwrap();
    assert_eq!(
        args.trim_end(),
        format!(
            "-xctestrun {} -destination id={}",
            artifacts[0].display(),
            UDID
        )
    );
}

#[tokio::test]
async fn test_second_run_rejected_while_first_in_flight() {
    let ctx = TestContext::new();
    ctx.runner_script("echo started\nsleep 1\n");
    let device = FakeDevice::new();
    let coordinator = ctx.coordinator(&device);

    let first = coordinator.start_run(configuration("FirstTests"), ctx.reporter(), Span::none());
    let second = async {
        wait_for_state(&coordinator, RunState::Running).await;
        coordinator
            .start_run(configuration("SecondTests"), ctx.reporter(), Span::none())
            .await
    };

    let (first, second) = tokio::join!(first, second);

    first.unwrap();
    match second.unwrap_err() {
        Error::ConcurrencyConflict { requested } => assert!(requested.contains("SecondTests")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(ctx.events.count("started:"), 1);
    assert_eq!(ctx.events.count("finished:"), 1);
    assert_eq!(coordinator.state(), RunState::Idle);
}

#[tokio::test]
async fn test_simultaneous_runs_admit_exactly_one() {
    let ctx = TestContext::new();
    ctx.runner_script("echo started\nsleep 0.3\n");
    let device = FakeDevice::new();
    let coordinator = ctx.coordinator(&device);

    let (a, b, c) = tokio::join!(
        coordinator.start_run(configuration("A"), ctx.reporter(), Span::none()),
        coordinator.start_run(configuration("B"), ctx.reporter(), Span::none()),
        coordinator.start_run(configuration("C"), ctx.reporter(), Span::none()),
    );

    let results = [a, b, c];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_conflict()))
            .count(),
        2
    );
    assert_eq!(ctx.events.count("started:"), 1);
    assert_eq!(ctx.artifacts().len(), 1);
}

#[tokio::test]
async fn test_abandoned_runner_terminated_before_spawn() {
    let ctx = TestContext::with_inventory(|inventory| {
        *inventory.processes.get_mut().unwrap() = vec![
            ProcessInfo {
                pid: 777,
                name: "xcodebuild".to_string(),
                arguments: vec![
                    "xcodebuild".to_string(),
                    "-destination".to_string(),
                    format!("id={}", UDID),
                ],
            },
            ProcessInfo {
                pid: 888,
                name: "xcodebuild".to_string(),
                arguments: vec!["xcodebuild".to_string(), "id=OTHER-DEVICE".to_string()],
            },
        ];
    });
    ctx.runner_script("echo started\n");
    let device = FakeDevice::new();
    let coordinator = ctx.coordinator(&device);

    coordinator
        .start_run(configuration("AppTests"), ctx.reporter(), Span::none())
        .await
        .unwrap();

    assert_eq!(ctx.inventory.terminated.lock().unwrap().as_slice(), [777]);

    let events = ctx.events.snapshot();
    let terminated_at = events.iter().position(|e| e == "terminate:777").unwrap();
    let started_at = events.iter().position(|e| e.starts_with("started:")).unwrap();
    assert!(terminated_at < started_at);
}

#[tokio::test]
async fn test_configuration_failure_does_not_spawn_and_clears_guard() {
    let ctx = TestContext::new();
    ctx.runner_script("echo started\n");
    let device = FakeDevice::new();
    let coordinator = ctx.coordinator_with_builder(&device, true);

    let err = coordinator
        .start_run(configuration("AppTests"), ctx.reporter(), Span::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConfigurationWrite(_)));
    assert_eq!(ctx.events.count("locate"), 0);
    assert_eq!(ctx.events.count("started:"), 0);
    assert_eq!(coordinator.state(), RunState::Idle);

    // The follow-up run gets past the guard and fails the same way
    let err = coordinator
        .start_run(configuration("AppTests"), ctx.reporter(), Span::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConfigurationWrite(_)));
    assert_eq!(ctx.events.count("write"), 2);
}

#[tokio::test]
async fn test_missing_tool_does_not_spawn_and_clears_guard() {
    let ctx = TestContext::new();
    ctx.runner_script("echo started\n");
    ctx.locator.set(None);
    let device = FakeDevice::new();
    let coordinator = ctx.coordinator(&device);

    let err = coordinator
        .start_run(configuration("AppTests"), ctx.reporter(), Span::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ToolNotFound { .. }));
    assert_eq!(ctx.events.count("started:"), 0);
    assert_eq!(coordinator.state(), RunState::Idle);

    ctx.locator.set(Some(PathBuf::from("/bin/sh")));
    coordinator
        .start_run(configuration("AppTests"), ctx.reporter(), Span::none())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_inventory_failure_fails_run_before_launch() {
    let ctx = TestContext::with_inventory(|inventory| inventory.fail_query = true);
    let device = FakeDevice::new();
    let coordinator = ctx.coordinator(&device);

    let err = coordinator
        .start_run(configuration("AppTests"), ctx.reporter(), Span::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InventoryQuery(_)));
    assert_eq!(ctx.events.snapshot(), ["find"]);
    assert_eq!(coordinator.state(), RunState::Idle);
}

#[tokio::test]
async fn test_unexecutable_tool_is_spawn_failure() {
    let ctx = TestContext::new();
    let not_executable = ctx.work_dir.join("xcodebuild");
    std::fs::write(&not_executable, "not a binary").unwrap();
    ctx.locator.set(Some(not_executable));
    let device = FakeDevice::new();
    let coordinator = ctx.coordinator(&device);

    let err = coordinator
        .start_run(configuration("AppTests"), ctx.reporter(), Span::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SpawnFailed(_)));
    assert_eq!(ctx.events.count("finished:err"), 1);
    assert_eq!(coordinator.state(), RunState::Idle);
}

#[tokio::test]
async fn test_failing_runner_resolves_with_process_failure() {
    let ctx = TestContext::new();
    ctx.runner_script("echo 'Testing failed'\nexit 65\n");
    let device = FakeDevice::new();
    let coordinator = ctx.coordinator(&device);

    let err = coordinator
        .start_run(configuration("AppTests"), ctx.reporter(), Span::none())
        .await
        .unwrap_err();
    match err {
        Error::ProcessFailed { label, pid, .. } => {
            assert_eq!(label, "xcodebuild");
            assert_eq!(ctx.reporter.pids.lock().unwrap().as_slice(), [pid]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(coordinator.state(), RunState::Idle);
}

#[tokio::test]
async fn test_silent_runner_times_out_and_clears_guard() {
    let ctx = TestContext::new();
    ctx.runner_script("exec sleep 30\n");
    let device = FakeDevice::new();
    let coordinator = ctx
        .coordinator(&device)
        .with_liveness_timeout(Duration::from_millis(200));

    let err = coordinator
        .start_run(configuration("AppTests"), ctx.reporter(), Span::none())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LivenessTimeout(_)));
    assert_eq!(ctx.events.count("exited:false"), 0);
    assert_eq!(coordinator.state(), RunState::Idle);
}

#[tokio::test]
async fn test_cancelled_run_clears_guard() {
    let ctx = TestContext::new();
    ctx.runner_script("echo started\nexec sleep 30\n");
    let device = FakeDevice::new();
    let coordinator = ctx.coordinator(&device);

    let run = coordinator.start_run(configuration("AppTests"), ctx.reporter(), Span::none());
    let outcome = tokio::time::timeout(Duration::from_millis(500), run).await;
    assert!(outcome.is_err(), "run should still be in flight");
    assert_eq!(ctx.events.count("started:"), 1);
    assert_eq!(coordinator.state(), RunState::Idle);

    let pid = ctx.reporter.pids.lock().unwrap()[0];
    wait_for_exit(pid).await;

    ctx.runner_script("echo started\n");
    coordinator
        .start_run(configuration("AppTests"), ctx.reporter(), Span::none())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_channel_independent_of_run_guard() {
    let ctx = TestContext::new();
    ctx.runner_script("echo started\nsleep 0.5\n");
    let device = FakeDevice::new();
    let coordinator = ctx.coordinator(&device);

    let run = coordinator.start_run(configuration("AppTests"), ctx.reporter(), Span::none());
    let open = async {
        wait_for_state(&coordinator, RunState::Running).await;
        let channel = open_test_management_channel(&device).await.unwrap();
        assert_eq!(channel.service(), "com.apple.testmanagerd.lockdown");
        assert_eq!(coordinator.state(), RunState::Running);
    };
    let (run, ()) = tokio::join!(run, open);
    run.unwrap();

    let refusing = FakeDevice {
        refuse_services: true,
        ..FakeDevice::new()
    };
    let refusing_coordinator = ctx.coordinator(&refusing);
    let err = open_test_management_channel(&refusing).await.unwrap_err();
    assert!(matches!(err, Error::Channel { .. }));
    assert_eq!(refusing_coordinator.state(), RunState::Idle);
}

/// Records the coordinator state seen from inside `run_finished`
#[derive(Default)]
struct FinishObserver {
    coordinator: OnceLock<Weak<RunCoordinator<'static>>>,
    state_at_finish: Mutex<Option<RunState>>,
}

impl RunReporter for FinishObserver {
    fn run_finished(&self, _result: &Result<()>) {
        let state = self
            .coordinator
            .get()
            .and_then(Weak::upgrade)
            .map(|coordinator| coordinator.state());
        *self.state_at_finish.lock().unwrap() = state;
    }
}

#[tokio::test]
async fn test_coordinator_idle_when_run_finished_reported() {
    let ctx = TestContext::new();
    ctx.runner_script("echo started\n");
    let device: &'static FakeDevice = Box::leak(Box::new(FakeDevice::new()));
    let coordinator = Arc::new(ctx.coordinator(device));

    let observer = Arc::new(FinishObserver::default());
    let _ = observer.coordinator.set(Arc::downgrade(&coordinator));

    coordinator
        .start_run(configuration("AppTests"), observer.clone(), Span::none())
        .await
        .unwrap();
    assert_eq!(*observer.state_at_finish.lock().unwrap(), Some(RunState::Idle));

    // Failed runs report the same way
    ctx.locator.set(None);
    coordinator
        .start_run(configuration("AppTests"), observer.clone(), Span::none())
        .await
        .unwrap_err();
    assert_eq!(*observer.state_at_finish.lock().unwrap(), Some(RunState::Idle));
}
