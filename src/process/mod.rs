//! Test runner processes: discovery, cleanup and supervision

pub mod cleanup;
pub mod inventory;
pub mod supervisor;

pub use cleanup::terminate_abandoned;
pub use inventory::{ProcessFilter, ProcessInfo, ProcessInventory, SystemInventory};
pub use supervisor::{spawn, Liveness, RunHandle, SpawnRequest, XCODEBUILD_LABEL};
