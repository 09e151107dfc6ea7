//! One interface over physical and simulated devices
//!
//! [`Device`] only dispatches and checks preconditions; the protocol work is
//! done by the service clients in the rest of the crate.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    DeviceIdentity, DeviceInfoQuery, DeviceKind, DiskImageMounter, LocsimError, MountRequest,
    MountResult, ServiceSession,
    geo::Coordinate,
    location::LocationSimulationService,
    provider::DeviceProvider,
    simulator::{
        SimDevice, SimServiceContext, SimulatorBootMonitor, SimulatorDeviceRecord,
        SimulatorLocationController,
    },
};

/// What resetting a device's location did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The device is back at its real location
    Reset,
    /// The host can't clear a simulated location, so nothing changed
    NoOp,
}

/// A physical device reached through a paired lockdown session
#[derive(Debug)]
pub struct PhysicalDevice {
    session: ServiceSession,
}

impl PhysicalDevice {
    pub fn new(session: ServiceSession) -> Self {
        Self { session }
    }

    /// Opens a lockdown session through `provider`
    pub async fn connect(provider: Arc<dyn DeviceProvider>) -> Result<Self, LocsimError> {
        Ok(Self::new(ServiceSession::connect(provider).await?))
    }

    /// Resolves `handle` through usbmuxd and opens a lockdown session
    #[cfg(feature = "usbmuxd")]
    pub async fn connect_handle(
        handle: &crate::DeviceHandle,
        label: impl Into<String>,
    ) -> Result<Self, LocsimError> {
        Ok(Self::new(ServiceSession::connect_handle(handle, label).await?))
    }

    pub fn session(&mut self) -> &mut ServiceSession {
        &mut self.session
    }

    pub async fn identify(&mut self) -> Result<DeviceIdentity, LocsimError> {
        DeviceInfoQuery::new(&mut self.session).identity().await
    }

    /// Whether a developer disk image is mounted
    pub async fn is_developer_image_mounted(&mut self) -> Result<bool, LocsimError> {
        let mut mounter = DiskImageMounter::start(&mut self.session).await?;
        let mounted = mounter.is_mounted(MountRequest::DEVELOPER).await?;
        mounter.hangup().await?;
        Ok(mounted)
    }

    /// Uploads and mounts a developer disk image
    ///
    /// # Errors
    /// `AlreadyMounted` if one is mounted already; nothing is uploaded then
    pub async fn mount_developer_image(
        &mut self,
        request: &MountRequest,
    ) -> Result<MountResult, LocsimError> {
        let mut mounter = DiskImageMounter::start(&mut self.session).await?;
        let result = mounter.mount(request).await?;
        mounter.hangup().await?;
        info!("Mounted developer image: {result:?}");
        Ok(result)
    }

    /// # Errors
    /// `ImageNotMounted` if there is no developer image to provide the location service
    pub async fn locate(&mut self, coordinate: Coordinate) -> Result<(), LocsimError> {
        if !self.is_developer_image_mounted().await? {
            return Err(LocsimError::ImageNotMounted);
        }
        LocationSimulationService::start(&mut self.session)
            .await?
            .set(&coordinate)
            .await
    }

    pub async fn reset(&mut self) -> Result<ResetOutcome, LocsimError> {
        LocationSimulationService::start(&mut self.session)
            .await?
            .clear()
            .await?;
        Ok(ResetOutcome::Reset)
    }

    /// Ends the lockdown session
    pub async fn close(self) -> Result<(), LocsimError> {
        self.session.close().await
    }
}

/// A simulated device in the host's device set
#[derive(Debug)]
pub struct SimulatorDevice {
    monitor: SimulatorBootMonitor,
    controller: SimulatorLocationController,
}

impl SimulatorDevice {
    pub fn new(device: Arc<dyn SimDevice>) -> Self {
        Self {
            controller: SimulatorLocationController::new(device.clone()),
            monitor: SimulatorBootMonitor::new(device),
        }
    }

    /// Looks up `udid` in the context's device set
    pub async fn open(context: &SimServiceContext, udid: &str) -> Result<Self, LocsimError> {
        Ok(Self::new(context.device(udid).await?))
    }

    pub fn monitor(&self) -> &SimulatorBootMonitor {
        &self.monitor
    }

    pub fn controller(&self) -> &SimulatorLocationController {
        &self.controller
    }

    /// The device's current record, if it is ready for location changes
    async fn connected_record(&self) -> Result<SimulatorDeviceRecord, LocsimError> {
        let record = self.monitor.record().await?;
        if !record.is_connected() {
            debug!("{} is {:?}", record.udid, record.status());
            return Err(LocsimError::SimulatorNotBooted(record.udid));
        }
        Ok(record)
    }

    pub async fn identify(&self) -> Result<DeviceIdentity, LocsimError> {
        let record = self.connected_record().await?;
        Ok(DeviceIdentity {
            udid: record.udid,
            name: record.name,
            product_name: record.product_name,
            product_version: record.product_version,
            kind: DeviceKind::Simulator,
        })
    }

    pub async fn locate(&self, coordinate: Coordinate) -> Result<(), LocsimError> {
        self.connected_record().await?;
        self.controller.set_location(coordinate).await
    }

    pub async fn reset(&self) -> Result<ResetOutcome, LocsimError> {
        self.connected_record().await?;
        self.controller.reset_location().await
    }
}

/// Either kind of device, behind the same three operations
#[derive(Debug)]
pub enum Device {
    Physical(PhysicalDevice),
    Simulator(SimulatorDevice),
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Physical(_) => DeviceKind::Physical,
            Self::Simulator(_) => DeviceKind::Simulator,
        }
    }

    pub async fn identify(&mut self) -> Result<DeviceIdentity, LocsimError> {
        match self {
            Self::Physical(d) => d.identify().await,
            Self::Simulator(d) => d.identify().await,
        }
    }

    /// Moves the device's reported location to `coordinate`
    ///
    /// # Errors
    /// * `ImageNotMounted` for a physical device without a developer image
    /// * `SimulatorNotBooted` for a simulator that isn't booted and settled
    pub async fn locate(&mut self, coordinate: Coordinate) -> Result<(), LocsimError> {
        match self {
            Self::Physical(d) => d.locate(coordinate).await,
            Self::Simulator(d) => d.locate(coordinate).await,
        }
    }

    /// Returns the device to its real location
    pub async fn reset(&mut self) -> Result<ResetOutcome, LocsimError> {
        match self {
            Self::Physical(d) => d.reset().await,
            Self::Simulator(d) => d.reset().await,
        }
    }
}

impl From<PhysicalDevice> for Device {
    fn from(device: PhysicalDevice) -> Self {
        Self::Physical(device)
    }
}

impl From<SimulatorDevice> for Device {
    fn from(device: SimulatorDevice) -> Self {
        Self::Simulator(device)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        simulator::{
            BootState, HostCapabilities,
            fake::{FakeDevice, FakeDeviceSet},
        },
        test_util::{ScriptedProvider, dict},
    };

    fn here() -> Coordinate {
        Coordinate::new(51.5007, -0.1246).unwrap()
    }

    /// A physical device whose lookup reports `signatures`; returns the location
    /// service's device end if one was started
    async fn physical_locate(
        signatures: Vec<plist::Value>,
    ) -> (Result<(), LocsimError>, Vec<u16>, Vec<u8>) {
        let (provider, mut peers) = ScriptedProvider::with_peers(3);
        let mut location = peers.pop().unwrap();
        let mut mounter = peers.pop().unwrap();
        let mut lockdown = peers.pop().unwrap();
        let mounted = !signatures.is_empty();

        tokio::spawn(async move {
            lockdown.accept_session().await;
            lockdown
                .accept_service(DiskImageMounter::SERVICE_NAME, 50100)
                .await;
            mounter.expect("LookupImage").await;
            mounter
                .reply(dict([("ImageSignature", plist::Value::Array(signatures))]))
                .await;
            mounter.expect("Hangup").await;
            if mounted {
                lockdown
                    .accept_service(LocationSimulationService::SERVICE_NAME, 50200)
                    .await;
            }
            // Keep the lockdown end open until the client is done
            lockdown.read_to_end().await;
        });

        let mut device = Device::from(PhysicalDevice::connect(provider.clone()).await.unwrap());
        let result = device.locate(here()).await;
        let ports = provider.ports();
        drop(device);

        let sent = if mounted {
            location.read_to_end().await
        } else {
            Vec::new()
        };
        (result, ports, sent)
    }

    #[tokio::test]
    async fn physical_locate_needs_the_developer_image() {
        let (result, ports, _) = physical_locate(vec![]).await;
        assert!(matches!(result, Err(LocsimError::ImageNotMounted)));
        assert!(!ports.contains(&50200));
    }

    #[tokio::test]
    async fn physical_locate_uses_the_location_service() {
        let (result, ports, sent) =
            physical_locate(vec![plist::Value::Data(vec![0xAA; 20])]).await;
        result.unwrap();
        assert_eq!(ports.last(), Some(&50200));
        assert_eq!(&sent[..4], &[0, 0, 0, 0]);
        assert!(
            sent.windows(b"51.5007".len()).any(|w| w == b"51.5007"),
            "{sent:?}"
        );
    }

    #[tokio::test]
    async fn physical_reset_clears_without_the_mount_check() {
        let (provider, mut peers) = ScriptedProvider::with_peers(2);
        let mut location = peers.pop().unwrap();
        let mut lockdown = peers.pop().unwrap();

        tokio::spawn(async move {
            lockdown.accept_session().await;
            lockdown
                .accept_service(LocationSimulationService::SERVICE_NAME, 50200)
                .await;
            lockdown.read_to_end().await;
        });

        let mut device = Device::from(PhysicalDevice::connect(provider.clone()).await.unwrap());
        assert_eq!(device.reset().await.unwrap(), ResetOutcome::Reset);
        assert_eq!(provider.ports().last(), Some(&50200));
        drop(device);

        assert_eq!(location.read_to_end().await, vec![0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn physical_identity() {
        let (provider, mut peers) = ScriptedProvider::with_peers(1);
        let mut lockdown = peers.remove(0);

        tokio::spawn(async move {
            lockdown.accept_session().await;
            for (key, value) in [
                ("UniqueDeviceID", "00008030-TEST"),
                ("DeviceName", "Test iPhone"),
                ("ProductName", "iPhone OS"),
                ("ProductVersion", "17.4"),
            ] {
                let req = lockdown.expect("GetValue").await;
                assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some(key));
                lockdown
                    .reply(dict([("Key", key.into()), ("Value", value.into())]))
                    .await;
            }
            lockdown.read_to_end().await;
        });

        let mut device = Device::from(PhysicalDevice::connect(provider).await.unwrap());
        assert_eq!(device.kind(), DeviceKind::Physical);
        assert_eq!(
            device.identify().await.unwrap(),
            DeviceIdentity {
                udid: "00008030-TEST".into(),
                name: "Test iPhone".into(),
                product_name: "iPhone OS".into(),
                product_version: "17.4".into(),
                kind: DeviceKind::Physical,
            }
        );
    }

    #[tokio::test]
    async fn simulator_identity() {
        let mut device = Device::from(SimulatorDevice::new(FakeDevice::booted("SIM-1")));
        assert_eq!(device.kind(), DeviceKind::Simulator);
        assert_eq!(
            device.identify().await.unwrap(),
            DeviceIdentity {
                udid: "SIM-1".into(),
                name: "iPhone SIM-1".into(),
                product_name: "iOS".into(),
                product_version: "17.2".into(),
                kind: DeviceKind::Simulator,
            }
        );
    }

    #[tokio::test]
    async fn simulator_must_be_booted_and_settled() {
        let fake = Arc::new(FakeDevice::new("SIM-1").status(BootState::Booted, false));
        let mut device = Device::from(SimulatorDevice::new(fake.clone()));

        assert!(matches!(
            device.locate(here()).await,
            Err(LocsimError::SimulatorNotBooted(udid)) if udid == "SIM-1"
        ));
        assert!(matches!(
            device.reset().await,
            Err(LocsimError::SimulatorNotBooted(_))
        ));
        assert_eq!(fake.direct_sets.load(Ordering::SeqCst), 0);
        assert_eq!(fake.capability_checks.load(Ordering::SeqCst), 0);

        fake.set_status(BootState::Booted, true);
        device.locate(here()).await.unwrap();
        assert_eq!(*fake.locations.lock().unwrap(), vec![here()]);
    }

    #[tokio::test]
    async fn simulator_reset_reports_no_op() {
        let fake = Arc::new(FakeDevice::new("SIM-1").capabilities(HostCapabilities {
            set_location: true,
            clear_location: false,
        }));
        let mut device = Device::from(SimulatorDevice::new(fake));
        assert_eq!(device.reset().await.unwrap(), ResetOutcome::NoOp);
    }

    #[tokio::test]
    async fn open_by_udid() {
        let set = FakeDeviceSet::with_devices(vec![FakeDevice::booted("A")]);
        let context = SimServiceContext::new(set);

        assert!(SimulatorDevice::open(&context, "A").await.is_ok());
        assert!(matches!(
            SimulatorDevice::open(&context, "B").await,
            Err(LocsimError::DeviceNotFound)
        ));
    }
}
