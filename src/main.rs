//! xctest runner CLI
//!
//! Runs xctest bundles on a device through xcodebuild, one run at a time,
//! reaping runners left behind by earlier sessions first.

use clap::Parser;
use xctest_runner::{cli, commands::Commands, common::logging};

#[derive(Parser)]
#[command(name = "xctest-runner", about = "Supervised xcodebuild test runs")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    logging::init_cli();

    let cli = Cli::parse();

    if let Err(e) = cli::dispatch(cli.command).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
