//! Test run orchestration

pub mod configuration;
pub mod coordinator;
pub mod guard;
pub mod reporter;

pub use configuration::{LaunchConfiguration, RunConfigBuilder, XctestrunWriter};
pub use coordinator::RunCoordinator;
pub use guard::{RunGuard, RunPermit, RunState};
pub use reporter::{NullReporter, RunReporter};
