//! CLI command handling
//!
//! Dispatches CLI commands to the run coordinator and prints results.

use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;

use crate::commands::Commands;
use crate::common::{config::Config, paths, Error, Result};
use crate::device::{Device, DeviceQueue};
use crate::process::{self, SystemInventory};
use crate::run::{LaunchConfiguration, RunCoordinator, RunReporter};
use crate::tool::{ToolLocator, XcodebuildLocator};

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    let mut config = Config::load()?;

    match command {
        Commands::Run {
            udid,
            config: launch_path,
            working_dir,
        } => {
            if let Some(dir) = working_dir {
                config.run.working_dir = Some(dir);
            }
            let working_dir = config.working_dir();
            paths::ensure_working_dir(&working_dir)?;

            let configuration = LaunchConfiguration::load(&launch_path)?;
            let device = CliDevice::new(udid)?;
            let coordinator = RunCoordinator::from_config(&device, &config);

            println!("Running {} on {}", configuration, device.identifier());

            let run = coordinator.start_run(
                configuration,
                Arc::new(ConsoleReporter),
                tracing::Span::current(),
            );

            tokio::select! {
                result = run => result?,
                _ = tokio::signal::ctrl_c() => {
                    return Err(Error::Internal("Run interrupted".to_string()));
                }
            }

            println!("Test run finished");
            Ok(())
        }

        Commands::Cleanup { udid } => {
            let count =
                process::terminate_abandoned(&SystemInventory, &udid, config.terminate_grace())
                    .await?;
            println!("Terminated {} abandoned test runner(s) for {}", count, udid);
            Ok(())
        }

        Commands::Locate => {
            let path = XcodebuildLocator::new(&config.tool).locate().await?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

/// Device known only by its UDID
///
/// Service connections need a device transport, which the CLI does not
/// carry.
struct CliDevice {
    udid: String,
    queue: DeviceQueue,
}

impl CliDevice {
    fn new(udid: String) -> Result<Self> {
        Ok(Self {
            udid,
            queue: DeviceQueue::current()?,
        })
    }
}

#[async_trait]
impl Device for CliDevice {
    fn identifier(&self) -> &str {
        &self.udid
    }

    fn queue(&self) -> &DeviceQueue {
        &self.queue
    }

    #[cfg(unix)]
    async fn start_service(&self, service: &str) -> Result<crate::device::ServiceConnection> {
        Err(Error::channel(service, "no device transport attached"))
    }
}

/// Prints test runner output to stdout
struct ConsoleReporter;

impl RunReporter for ConsoleReporter {
    fn process_started(&self, pid: u32, _configuration: &LaunchConfiguration) {
        println!("Started xcodebuild (pid {})", pid);
    }

    fn output(&self, line: &str) {
        println!("{}", line);
    }

    fn process_exited(&self, pid: u32, status: ExitStatus) {
        println!("xcodebuild (pid {}) {}", pid, status);
    }
}
