//! Abandoned test runner cleanup
//!
//! A session that ended uncleanly can leave an `xcodebuild` attached to
//! the device. Those processes are swept before every new run.

use std::time::Duration;

use futures_util::future::join_all;

use crate::common::{Error, Result};

use super::inventory::{ProcessFilter, ProcessInventory};
use super::supervisor::XCODEBUILD_LABEL;

/// Terminate every `xcodebuild` still running for `device_id`
///
/// Resolves once all terminations have settled and returns how many
/// processes were stopped. Finding nothing is success, and a process that
/// cannot be stopped is logged rather than failing the sweep. Only a
/// failure to list processes is an error.
#[tracing::instrument(skip(inventory))]
pub async fn terminate_abandoned(
    inventory: &dyn ProcessInventory,
    device_id: &str,
    grace: Duration,
) -> Result<usize> {
    let filter = ProcessFilter::new(XCODEBUILD_LABEL, device_id);
    let abandoned = inventory.find(&filter).await.map_err(|e| match e {
        e @ Error::InventoryQuery(_) => e,
        other => Error::InventoryQuery(other.to_string()),
    })?;

    if abandoned.is_empty() {
        tracing::debug!("No abandoned test runners");
        return Ok(0);
    }

    tracing::info!(
        count = abandoned.len(),
        pids = ?abandoned.iter().map(|p| p.pid).collect::<Vec<_>>(),
        "Terminating abandoned test runners"
    );

    let results = join_all(
        abandoned
            .iter()
            .map(|process| inventory.terminate(process, grace)),
    )
    .await;

    let mut terminated = 0;
    for (process, result) in abandoned.iter().zip(results) {
        match result {
            Ok(true) => {
                terminated += 1;
                tracing::info!(pid = process.pid, "Terminated abandoned test runner");
            }
            Ok(false) => tracing::debug!(pid = process.pid, "Abandoned test runner already gone"),
            Err(e) => tracing::warn!(pid = process.pid, "Failed to terminate abandoned test runner: {}", e),
        }
    }

    Ok(terminated)
}
