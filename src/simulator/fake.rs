//! Test doubles for the simulator host

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::{
    BootState, BootStatus, DeviceSet, DeviceSetNotification, HostCapabilities, HostError,
    RegistrationId, SimDevice, SimulatorBridge, SimulatorDeviceRecord,
};
use crate::{LocsimError, geo::Coordinate};

pub(crate) fn host_error(description: &str) -> HostError {
    HostError {
        domain: "com.apple.CoreSimulator.SimError".into(),
        code: 405,
        description: description.into(),
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeBridge {
    pub calls: AtomicUsize,
    pub error: Option<HostError>,
}

impl SimulatorBridge for FakeBridge {
    fn set_location(&self, _coordinate: Coordinate) -> BoxFuture<'_, Result<(), HostError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.error.clone().map_or(Ok(()), Err);
        Box::pin(async move { result })
    }
}

#[derive(Debug)]
pub(crate) struct FakeDevice {
    udid: String,
    status: Mutex<BootStatus>,
    capabilities: HostCapabilities,
    error: Option<HostError>,
    bridge: Option<Arc<FakeBridge>>,

    pub capability_checks: AtomicUsize,
    pub direct_sets: AtomicUsize,
    pub clears: AtomicUsize,
    pub lookups: AtomicUsize,
    pub locations: Mutex<Vec<Coordinate>>,
}

impl FakeDevice {
    /// A booted device on a host with both direct operations
    pub fn new(udid: &str) -> Self {
        Self {
            udid: udid.into(),
            status: Mutex::new(BootStatus {
                boot_state: BootState::Booted,
                is_terminal_status: true,
            }),
            capabilities: HostCapabilities {
                set_location: true,
                clear_location: true,
            },
            error: None,
            bridge: None,
            capability_checks: AtomicUsize::new(0),
            direct_sets: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
            locations: Mutex::new(Vec::new()),
        }
    }

    pub fn booted(udid: &str) -> Arc<Self> {
        Arc::new(Self::new(udid))
    }

    pub fn status(self, boot_state: BootState, is_terminal_status: bool) -> Self {
        *self.status.lock().unwrap() = BootStatus {
            boot_state,
            is_terminal_status,
        };
        self
    }

    pub fn capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn bridge(mut self, bridge: Arc<FakeBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn rejecting(mut self, error: HostError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn set_status(&self, boot_state: BootState, is_terminal_status: bool) {
        *self.status.lock().unwrap() = BootStatus {
            boot_state,
            is_terminal_status,
        };
    }

    pub fn snapshot(&self) -> SimulatorDeviceRecord {
        let status = *self.status.lock().unwrap();
        SimulatorDeviceRecord {
            udid: self.udid.clone(),
            name: format!("iPhone {}", self.udid),
            product_name: "iOS".into(),
            product_version: "17.2".into(),
            boot_state: status.boot_state,
            is_terminal_status: status.is_terminal_status,
        }
    }

    fn outcome(&self) -> Result<(), HostError> {
        self.error.clone().map_or(Ok(()), Err)
    }
}

impl SimDevice for FakeDevice {
    fn udid(&self) -> &str {
        &self.udid
    }

    fn record(&self) -> BoxFuture<'_, Result<SimulatorDeviceRecord, LocsimError>> {
        Box::pin(async move { Ok(self.snapshot()) })
    }

    fn detect_capabilities(&self) -> BoxFuture<'_, Result<HostCapabilities, LocsimError>> {
        self.capability_checks.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(self.capabilities) })
    }

    fn set_location(&self, coordinate: Coordinate) -> BoxFuture<'_, Result<(), HostError>> {
        self.direct_sets.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            self.outcome()?;
            self.locations.lock().unwrap().push(coordinate);
            Ok(())
        })
    }

    fn clear_location(&self) -> BoxFuture<'_, Result<(), HostError>> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { self.outcome() })
    }

    fn lookup_port(
        &self,
        name: &str,
    ) -> BoxFuture<'_, Result<Arc<dyn SimulatorBridge>, HostError>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let name = name.to_string();
        Box::pin(async move {
            match &self.bridge {
                Some(bridge) => Ok(bridge.clone() as Arc<dyn SimulatorBridge>),
                None => Err(host_error(&format!("no port named {name}"))),
            }
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeDeviceSet {
    devices: Mutex<Vec<Arc<FakeDevice>>>,
    sinks: Mutex<HashMap<RegistrationId, mpsc::UnboundedSender<DeviceSetNotification>>>,
    next_id: AtomicU64,
    pub registers: AtomicUsize,
    pub unregisters: AtomicUsize,
}

impl FakeDeviceSet {
    pub fn with_devices(devices: Vec<Arc<FakeDevice>>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
            ..Default::default()
        })
    }

    /// Number of live registrations
    pub fn registrations(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    fn emit(&self, notification: DeviceSetNotification) {
        for sink in self.sinks.lock().unwrap().values() {
            let _ = sink.send(notification.clone());
        }
    }

    pub fn add(&self, device: Arc<FakeDevice>) {
        let record = device.snapshot();
        self.devices.lock().unwrap().push(device);
        self.emit(DeviceSetNotification::Changed(record));
    }

    pub fn change(&self, udid: &str, boot_state: BootState, is_terminal_status: bool) {
        let device = self
            .devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.udid == udid)
            .cloned()
            .unwrap();
        device.set_status(boot_state, is_terminal_status);
        self.emit(DeviceSetNotification::Changed(device.snapshot()));
    }

    pub fn remove(&self, udid: &str) {
        let removed = {
            let mut devices = self.devices.lock().unwrap();
            let index = devices.iter().position(|d| d.udid == udid).unwrap();
            devices.remove(index)
        };
        self.emit(DeviceSetNotification::Removed(removed.snapshot()));
    }
}

impl DeviceSet for FakeDeviceSet {
    fn devices(&self) -> BoxFuture<'_, Result<Vec<Arc<dyn SimDevice>>, LocsimError>> {
        let devices = self
            .devices
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.clone() as Arc<dyn SimDevice>)
            .collect();
        Box::pin(async move { Ok(devices) })
    }

    fn register_notifications(
        &self,
        sink: mpsc::UnboundedSender<DeviceSetNotification>,
    ) -> BoxFuture<'_, Result<RegistrationId, LocsimError>> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().unwrap().insert(id, sink);
        Box::pin(async move { Ok(id) })
    }

    fn unregister_notifications(
        &self,
        id: RegistrationId,
    ) -> BoxFuture<'_, Result<bool, LocsimError>> {
        self.unregisters.fetch_add(1, Ordering::SeqCst);
        let removed = self.sinks.lock().unwrap().remove(&id).is_some();
        Box::pin(async move { Ok(removed) })
    }
}
