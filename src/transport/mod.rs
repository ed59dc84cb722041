//! Abstract BLE transport consumed by device sessions.
//!
//! A [`Transport`] scans and opens [`Link`]s; a `Link` is one live GATT
//! connection.  Two implementations ship with the crate:
//!
//! * [`btle::BtleTransport`]: real hardware through `btleplug`.
//! * [`simulated::SimulatedTransport`]: scriptable in-process peripherals for
//!   tests and dry runs.

pub mod btle;
pub mod simulated;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::types::DeviceIdentity;

/// Capacity of the per-link notification channel.
pub const NOTIFICATION_BUFFER: usize = 256;

/// A characteristic value pushed by the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub uuid: Uuid,
    pub value: Vec<u8>,
    /// Host time at which the notification was received.
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Scan for `timeout` and return every named peripheral seen.
    async fn scan(&self, timeout: Duration) -> Result<Vec<DeviceIdentity>>;

    /// Establish a link to `device`, giving up after `timeout`.
    ///
    /// The timeout bounds this device's own attempt.  Implementations that
    /// serialise connects start it once the attempt gets its turn, so a slow
    /// sibling never eats into it.  Callers must not wrap the call in a
    /// second timeout.
    ///
    /// Fails with [`crate::Error::Connect`] when the device cannot be found or
    /// the link does not come up in time.
    async fn connect(&self, device: &DeviceIdentity, timeout: Duration) -> Result<Box<dyn Link>>;
}

/// One live connection to a peripheral.
#[async_trait]
pub trait Link: Send + Sync {
    /// Enable notifications on `uuid`.
    async fn subscribe(&self, uuid: Uuid) -> Result<()>;

    /// Notifications from every subscribed characteristic, in delivery order.
    ///
    /// The channel closes when the link is lost or disconnected; that closure
    /// is the disconnect event sessions observe.  Call once per link.
    async fn notifications(&self) -> Result<mpsc::Receiver<Notification>>;

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>>;

    async fn write(&self, uuid: Uuid, data: &[u8]) -> Result<()>;

    /// UUIDs of the services the peripheral exposes.
    async fn services(&self) -> Result<Vec<Uuid>>;

    async fn disconnect(&self) -> Result<()>;
}
