//! Test-management service channel
//!
//! The test-management protocol itself lives elsewhere; this module only
//! opens the channel and hands out the socket descriptor, keeping the
//! connection alive for exactly as long as the consumer holds it.

use std::future::Future;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::common::{Error, Result};

use super::Device;

/// Service identifier of the device's test-management daemon
pub const TEST_MANAGER_SERVICE: &str = "com.apple.testmanagerd.lockdown";

/// Raw connection to a named device service
#[derive(Debug)]
pub struct ServiceConnection {
    service: String,
    socket: OwnedFd,
}

impl ServiceConnection {
    pub fn new(service: impl Into<String>, socket: impl Into<OwnedFd>) -> Self {
        Self {
            service: service.into(),
            socket: socket.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

/// An open service channel, released when dropped
#[derive(Debug)]
pub struct ServiceChannel {
    connection: ServiceConnection,
}

impl ServiceChannel {
    pub fn service(&self) -> &str {
        self.connection.service()
    }
}

impl AsFd for ServiceChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.connection.socket.as_fd()
    }
}

impl AsRawFd for ServiceChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.connection.socket.as_raw_fd()
    }
}

impl Drop for ServiceChannel {
    fn drop(&mut self) {
        tracing::debug!(
            service = %self.connection.service,
            fd = self.connection.socket.as_raw_fd(),
            "Releasing service channel"
        );
    }
}

/// Open the test-management channel on a device
#[tracing::instrument(skip(device), fields(device = %device.identifier()))]
pub async fn open_test_management_channel(device: &dyn Device) -> Result<ServiceChannel> {
    let connection = device
        .start_service(TEST_MANAGER_SERVICE)
        .await
        .map_err(|e| match e {
            e @ Error::Channel { .. } => e,
            other => Error::channel(TEST_MANAGER_SERVICE, other),
        })?;

    tracing::debug!(fd = connection.socket.as_raw_fd(), "Test-management channel open");
    Ok(ServiceChannel { connection })
}

/// Run `consume` with the raw descriptor of an open test-management channel
///
/// The channel stays open until the future returned by `consume` finishes
/// or is dropped, and is released on every path.
pub async fn with_test_management_channel<F, Fut, T>(device: &dyn Device, consume: F) -> Result<T>
where
    F: FnOnce(RawFd) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let channel = open_test_management_channel(device).await?;
    let result = consume(channel.as_raw_fd()).await;
    drop(channel);
    result
}
