//! Run progress reporting

use std::process::ExitStatus;

use crate::common::Result;

use super::LaunchConfiguration;

/// Receives progress of a test run
///
/// Every method defaults to doing nothing.
pub trait RunReporter: Send + Sync {
    fn process_started(&self, _pid: u32, _configuration: &LaunchConfiguration) {}

    /// One line of test runner output, without the line terminator
    fn output(&self, _line: &str) {}

    fn process_exited(&self, _pid: u32, _status: ExitStatus) {}

    /// The run settled; called once per admitted run
    ///
    /// The coordinator is already idle again, so the next run may be
    /// started from here. Not called for a run that was cancelled.
    fn run_finished(&self, _result: &Result<()>) {}
}

/// Reporter that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl RunReporter for NullReporter {}
