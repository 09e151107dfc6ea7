//! Boot state of a simulated device

use std::sync::Arc;

use tracing::trace;

use super::{BootStatus, SimDevice, SimulatorDeviceRecord};
use crate::LocsimError;

/// Reads a device's boot state from the host on every call
///
/// A cached state would go stale: the set is shared with other processes, and a
/// device reads `Booted` for a moment while it is already shutting down.
#[derive(Debug, Clone)]
pub struct SimulatorBootMonitor {
    device: Arc<dyn SimDevice>,
}

impl SimulatorBootMonitor {
    pub fn new(device: Arc<dyn SimDevice>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<dyn SimDevice> {
        &self.device
    }

    /// A fresh snapshot of the full device record
    pub async fn record(&self) -> Result<SimulatorDeviceRecord, LocsimError> {
        self.device.record().await
    }

    pub async fn boot_status(&self) -> Result<BootStatus, LocsimError> {
        let status = self.record().await?.status();
        trace!("{} boot status: {status:?}", self.device.udid());
        Ok(status)
    }

    /// Whether the device is booted and done transitioning
    pub async fn is_connected(&self) -> Result<bool, LocsimError> {
        Ok(self.boot_status().await?.is_connected())
    }
}
