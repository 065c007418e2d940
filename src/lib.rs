//! xctest runner - supervised, single-flight xcodebuild test runs
//!
//! This library runs one external test runner process at a time against a
//! device, sweeping runners abandoned by earlier sessions before each run
//! and exposing the run as a cancellable future.

pub mod cli;
pub mod commands;
pub mod common;
pub mod device;
pub mod process;
pub mod run;
pub mod tool;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use device::{Device, DeviceQueue};
pub use run::{LaunchConfiguration, RunCoordinator, RunReporter, RunState};
