//! Managed device abstraction
//!
//! The coordinator never owns a device. It borrows one for as long as it
//! runs tests against it and only needs three things from it: a stable
//! identifier, the execution queue work for that device is sequenced on,
//! and the ability to hand out named service connections.

#[cfg(unix)]
pub mod channel;

use std::future::Future;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::common::{Error, Result};

#[cfg(unix)]
pub use channel::{
    open_test_management_channel, with_test_management_channel, ServiceChannel,
    ServiceConnection, TEST_MANAGER_SERVICE,
};

/// A device test runs are executed against
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable device identity (UDID)
    fn identifier(&self) -> &str;

    /// Execution queue for work belonging to this device
    fn queue(&self) -> &DeviceQueue;

    /// Request a named service connection from the device
    #[cfg(unix)]
    async fn start_service(&self, service: &str) -> Result<ServiceConnection>;
}

/// Ordered execution context for one device
///
/// Background work (process monitoring) is spawned onto `handle`. Launch
/// sequences take a turn through [`DeviceQueue::enter`] so two of them
/// never interleave for the same device.
pub struct DeviceQueue {
    handle: Handle,
    turn: Mutex<()>,
}

impl DeviceQueue {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            turn: Mutex::new(()),
        }
    }

    /// Queue bound to the runtime of the calling task
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Internal(format!("No tokio runtime for device queue: {}", e)))?;
        Ok(Self::new(handle))
    }

    /// Wait for exclusive use of the queue
    ///
    /// The returned guard keeps the turn until dropped.
    pub async fn enter(&self) -> MutexGuard<'_, ()> {
        self.turn.lock().await
    }

    /// Run a background task on this device's runtime
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

impl std::fmt::Debug for DeviceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceQueue").finish_non_exhaustive()
    }
}
