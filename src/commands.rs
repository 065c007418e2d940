//! CLI command definitions
//!
//! Defines the clap commands for the xctest runner CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a test bundle on a device and wait for it to finish
    Run {
        /// Device UDID
        #[arg(long)]
        udid: String,

        /// Launch configuration file (.toml or .json)
        config: PathBuf,

        /// Directory for generated run artifacts (default: from config)
        #[arg(long)]
        working_dir: Option<PathBuf>,
    },

    /// Terminate test runners left behind for a device
    Cleanup {
        /// Device UDID
        #[arg(long)]
        udid: String,
    },

    /// Print the resolved test runner path
    Locate,
}
