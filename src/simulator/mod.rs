//! Simulated devices
//!
//! The simulator host (CoreSimulator, reached here through `xcrun simctl` or any
//! other [`DeviceSet`] implementation) owns a set of simulated devices. Nothing
//! in this crate has exclusive access to that set: other processes boot, shut
//! down and delete devices at any time, so every state read is a fresh snapshot.

use std::{fmt, sync::Arc};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{LocsimError, geo::Coordinate};

pub mod boot;
pub mod location;
pub mod notifications;
#[cfg(feature = "simctl")]
pub mod simctl;

#[cfg(test)]
pub(crate) mod fake;

pub use boot::SimulatorBootMonitor;
pub use location::SimulatorLocationController;
pub use notifications::{SimulatorEvent, SimulatorNotificationHub, Subscription, SubscriptionId};

/// Lifecycle state of a simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootState {
    Offline,
    Booting,
    Booted,
    Shutdown,
}

impl BootState {
    /// Maps CoreSimulator's raw state values
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            1 => Some(Self::Offline),
            2 => Some(Self::Booting),
            3 => Some(Self::Booted),
            4 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// A boot state plus whether the device has settled in it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BootStatus {
    pub boot_state: BootState,
    /// False while the device is still transitioning, e.g. `Booted` during shutdown
    pub is_terminal_status: bool,
}

impl BootStatus {
    /// Ready for location changes: booted, and done transitioning
    pub fn is_connected(&self) -> bool {
        self.boot_state == BootState::Booted && self.is_terminal_status
    }
}

/// A point-in-time view of one simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorDeviceRecord {
    pub udid: String,
    pub name: String,
    /// e.g. "iOS"
    pub product_name: String,
    /// e.g. "17.2"
    pub product_version: String,
    pub boot_state: BootState,
    pub is_terminal_status: bool,
}

impl SimulatorDeviceRecord {
    pub fn status(&self) -> BootStatus {
        BootStatus {
            boot_state: self.boot_state,
            is_terminal_status: self.is_terminal_status,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }
}

/// Which location operations a simulator host supports directly
///
/// Xcode 12.5 added both; older hosts only offer the bridge port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostCapabilities {
    pub set_location: bool,
    pub clear_location: bool,
}

/// An error object returned by the simulator host, kept as the host reported it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{domain} ({code}): {description}")]
pub struct HostError {
    pub domain: String,
    pub code: i64,
    pub description: String,
}

/// The location proxy reached through a device's bridge port
pub trait SimulatorBridge: Send + Sync + fmt::Debug {
    fn set_location(&self, coordinate: Coordinate) -> BoxFuture<'_, Result<(), HostError>>;
}

/// One simulated device as the host exposes it
pub trait SimDevice: Send + Sync + fmt::Debug {
    fn udid(&self) -> &str;

    /// Reads the device's current record from the host
    fn record(&self) -> BoxFuture<'_, Result<SimulatorDeviceRecord, LocsimError>>;

    /// Asks the host which direct location operations it offers
    fn detect_capabilities(&self) -> BoxFuture<'_, Result<HostCapabilities, LocsimError>>;

    /// The direct set-location operation
    fn set_location(&self, coordinate: Coordinate) -> BoxFuture<'_, Result<(), HostError>>;

    /// The direct clear-location operation
    fn clear_location(&self) -> BoxFuture<'_, Result<(), HostError>>;

    /// Resolves a named port on the device to the proxy behind it
    fn lookup_port(&self, name: &str) -> BoxFuture<'_, Result<Arc<dyn SimulatorBridge>, HostError>>;
}

/// Identifies one registration of a notification sink with a device set
pub type RegistrationId = u64;

/// A mutation of the device set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSetNotification {
    /// A device was added or its state changed
    Changed(SimulatorDeviceRecord),
    Removed(SimulatorDeviceRecord),
}

/// The host's registry of simulated devices
pub trait DeviceSet: Send + Sync + fmt::Debug {
    fn devices(&self) -> BoxFuture<'_, Result<Vec<Arc<dyn SimDevice>>, LocsimError>>;

    /// Current records of every device
    ///
    /// The default reads each device in turn; hosts that can list the whole set
    /// at once should override it.
    fn records(&self) -> BoxFuture<'_, Result<Vec<SimulatorDeviceRecord>, LocsimError>> {
        Box::pin(async move {
            let mut records = Vec::new();
            for device in self.devices().await? {
                records.push(device.record().await?);
            }
            Ok(records)
        })
    }

    /// Starts sending mutations to `sink`, in the order they happen
    fn register_notifications(
        &self,
        sink: mpsc::UnboundedSender<DeviceSetNotification>,
    ) -> BoxFuture<'_, Result<RegistrationId, LocsimError>>;

    /// Stops a registration; false if `id` wasn't registered
    fn unregister_notifications(
        &self,
        id: RegistrationId,
    ) -> BoxFuture<'_, Result<bool, LocsimError>>;
}

/// An explicitly owned handle to the host's device set
///
/// Create one with [`SimServiceContext::new`] (or [`SimServiceContext::simctl`]) and
/// pass clones to the components that need the set. The set is released when
/// the last clone is dropped.
#[derive(Debug, Clone)]
pub struct SimServiceContext {
    device_set: Arc<dyn DeviceSet>,
}

impl SimServiceContext {
    pub fn new(device_set: Arc<dyn DeviceSet>) -> Self {
        Self { device_set }
    }

    /// A context backed by `xcrun simctl`
    #[cfg(feature = "simctl")]
    pub fn simctl(config: simctl::SimctlConfig) -> Self {
        Self::new(Arc::new(simctl::SimctlDeviceSet::new(config)))
    }

    pub fn device_set(&self) -> &Arc<dyn DeviceSet> {
        &self.device_set
    }

    /// Finds a device by UDID
    ///
    /// # Errors
    /// `DeviceNotFound` if the set has no such device
    pub async fn device(&self, udid: &str) -> Result<Arc<dyn SimDevice>, LocsimError> {
        self.device_set
            .devices()
            .await?
            .into_iter()
            .find(|d| d.udid() == udid)
            .ok_or(LocsimError::DeviceNotFound)
    }

    /// Current records of every device in the set
    pub async fn records(&self) -> Result<Vec<SimulatorDeviceRecord>, LocsimError> {
        self.device_set.records().await
    }
}
