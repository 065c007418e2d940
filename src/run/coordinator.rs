//! Run coordinator
//!
//! Admits one test run at a time per device and drives it from cleanup to
//! settlement: sweep abandoned runners, claim the guard, write the run
//! artifact, resolve the tool, spawn it, confirm it is alive and wait for
//! it to exit. The guard is released when the run settles, including when
//! the caller drops the run future.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, Span};

use crate::common::config::{Config, ToolConfig};
use crate::common::{Error, Result};
use crate::device::Device;
use crate::process::{
    self, Liveness, ProcessInventory, RunHandle, SpawnRequest, SystemInventory, XCODEBUILD_LABEL,
};
use crate::tool::{ToolLocator, XcodebuildLocator};

use super::configuration::{LaunchConfiguration, RunConfigBuilder, XctestrunWriter};
use super::guard::{RunGuard, RunState};
use super::reporter::RunReporter;

/// Coordinates test runs against one device
///
/// The coordinator borrows its device; the device must outlive every run
/// started through it.
pub struct RunCoordinator<'d> {
    device: &'d dyn Device,
    working_dir: PathBuf,
    guard: Arc<RunGuard>,
    inventory: Arc<dyn ProcessInventory>,
    builder: Arc<dyn RunConfigBuilder>,
    locator: Arc<dyn ToolLocator>,
    liveness_timeout: Duration,
    terminate_grace: Duration,
}

impl<'d> RunCoordinator<'d> {
    /// Coordinator with the default collaborators and settings
    pub fn new(device: &'d dyn Device, working_dir: impl Into<PathBuf>) -> Self {
        let config = Config::default();
        Self {
            device,
            working_dir: working_dir.into(),
            guard: RunGuard::new(),
            inventory: Arc::new(SystemInventory),
            builder: Arc::new(XctestrunWriter),
            locator: Arc::new(XcodebuildLocator::new(&ToolConfig::default())),
            liveness_timeout: config.liveness_timeout(),
            terminate_grace: config.terminate_grace(),
        }
    }

    /// Coordinator configured from a loaded config file
    pub fn from_config(device: &'d dyn Device, config: &Config) -> Self {
        Self::new(device, config.working_dir())
            .with_tool_locator(Arc::new(XcodebuildLocator::new(&config.tool)))
            .with_liveness_timeout(config.liveness_timeout())
            .with_terminate_grace(config.terminate_grace())
    }

    pub fn with_inventory(mut self, inventory: Arc<dyn ProcessInventory>) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn with_config_builder(mut self, builder: Arc<dyn RunConfigBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_tool_locator(mut self, locator: Arc<dyn ToolLocator>) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Current guard state
    pub fn state(&self) -> RunState {
        self.guard.state()
    }

    /// Run the test runner for `configuration` until it exits
    ///
    /// Fails immediately with [`Error::ConcurrencyConflict`] if another run
    /// is in progress on this coordinator. Dropping the returned future
    /// cancels the run: the test runner is killed and the guard released.
    pub async fn start_run(
        &self,
        configuration: LaunchConfiguration,
        reporter: Arc<dyn RunReporter>,
        logger: Span,
    ) -> Result<()> {
        let span = tracing::info_span!(
            parent: &logger,
            "test_run",
            device = %self.device.identifier(),
            bundle = %configuration.test_bundle.display(),
        );
        self.run(configuration, reporter).instrument(span).await
    }

    async fn run(
        &self,
        configuration: LaunchConfiguration,
        reporter: Arc<dyn RunReporter>,
    ) -> Result<()> {
        self.admit(&configuration)?;

        // Launch sequences for the same device never interleave
        let turn = self.device.queue().enter().await;
        self.admit(&configuration)?;

        process::terminate_abandoned(
            self.inventory.as_ref(),
            self.device.identifier(),
            self.terminate_grace,
        )
        .await?;

        let permit = self
            .guard
            .try_begin()
            .ok_or_else(|| conflict(&configuration))?;
        tracing::info!("Run admitted");

        let launched = self.launch(&configuration, &reporter).await;
        drop(turn);

        let result = match launched {
            Ok(mut handle) => {
                let result = self.supervise(&mut handle).await;
                permit.settle();
                if result.is_err() {
                    handle.terminate().await;
                }
                result
            }
            Err(e) => {
                permit.settle();
                Err(e)
            }
        };

        match &result {
            Ok(()) => tracing::info!("Run finished"),
            Err(e) => tracing::warn!("Run failed: {}", e),
        }
        drop(permit);
        reporter.run_finished(&result);
        result
    }

    fn admit(&self, configuration: &LaunchConfiguration) -> Result<()> {
        let state = self.guard.state();
        if state != RunState::Idle {
            tracing::warn!(%state, "Rejecting run, another run is in progress");
            return Err(conflict(configuration));
        }
        Ok(())
    }

    async fn launch(
        &self,
        configuration: &LaunchConfiguration,
        reporter: &Arc<dyn RunReporter>,
    ) -> Result<RunHandle> {
        let xctestrun = self
            .builder
            .write(configuration, &self.working_dir)
            .await
            .map_err(|e| match e {
                e @ Error::ConfigurationWrite(_) => e,
                other => Error::ConfigurationWrite(format!("{}: {}", configuration, other)),
            })?;
        tracing::debug!(path = %xctestrun.display(), "Wrote run configuration");

        let tool = self.locator.locate().await.map_err(|e| match e {
            e @ Error::ToolNotFound { .. } => e,
            other => Error::ToolNotFound {
                name: XCODEBUILD_LABEL.to_string(),
                searched: other.to_string(),
            },
        })?;

        process::spawn(SpawnRequest {
            device_id: self.device.identifier(),
            configuration,
            tool_path: &tool,
            xctestrun_path: &xctestrun,
            simulator_device_set: None,
            macos_test_shim: None,
            working_dir: &self.working_dir,
            queue: self.device.queue(),
            logger: &Span::current(),
            reporter: reporter.clone(),
        })
    }

    async fn supervise(&self, handle: &mut RunHandle) -> Result<()> {
        match handle.confirm(self.liveness_timeout).await? {
            Liveness::Alive => tracing::info!(pid = handle.pid(), "Test runner is running"),
            Liveness::Exited(status) => tracing::info!(
                pid = handle.pid(),
                %status,
                "Test runner exited before producing output"
            ),
        }
        handle.finish().await
    }
}

fn conflict(configuration: &LaunchConfiguration) -> Error {
    Error::ConcurrencyConflict {
        requested: configuration.to_string(),
    }
}
