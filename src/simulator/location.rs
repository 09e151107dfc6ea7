//! Location of a simulated device

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{HostCapabilities, SimDevice};
use crate::{LocsimError, facade::ResetOutcome, geo::Coordinate};

/// Sets and clears the location of one simulated device
///
/// The host is asked once which direct operations it offers; the answer is
/// kept for the controller's lifetime. Hosts without the direct set-location
/// operation are driven through the simulator bridge port instead.
#[derive(Debug)]
pub struct SimulatorLocationController {
    device: Arc<dyn SimDevice>,
    capabilities: OnceCell<HostCapabilities>,
}

impl SimulatorLocationController {
    /// Port the simulator bridge listens on, for hosts older than Xcode 12.5
    pub const BRIDGE_PORT: &'static str = "com.apple.iphonesimulator.bridge";

    pub fn new(device: Arc<dyn SimDevice>) -> Self {
        Self {
            device,
            capabilities: OnceCell::new(),
        }
    }

    /// The host's capabilities, detected on first use
    pub async fn capabilities(&self) -> Result<HostCapabilities, LocsimError> {
        self.capabilities
            .get_or_try_init(|| async {
                let capabilities = self.device.detect_capabilities().await?;
                debug!("{} capabilities: {capabilities:?}", self.device.udid());
                Ok::<_, LocsimError>(capabilities)
            })
            .await
            .copied()
    }

    /// Moves the device to `coordinate`
    ///
    /// # Errors
    /// * `RejectedByHost` with the host's own error when the host refuses
    /// * `Unsupported` when neither the direct operation nor the bridge port exists
    pub async fn set_location(&self, coordinate: Coordinate) -> Result<(), LocsimError> {
        if self.capabilities().await?.set_location {
            return self
                .device
                .set_location(coordinate)
                .await
                .map_err(LocsimError::RejectedByHost);
        }

        info!("Direct location unavailable, using the simulator bridge");
        let bridge = self.device.lookup_port(Self::BRIDGE_PORT).await.map_err(|e| {
            LocsimError::Unsupported(format!("no simulator bridge: {e}"))
        })?;
        bridge
            .set_location(coordinate)
            .await
            .map_err(LocsimError::RejectedByHost)
    }

    /// Returns the device to its own location
    ///
    /// Hosts without the clear operation can't undo a simulated location;
    /// that is reported as [`ResetOutcome::NoOp`].
    pub async fn reset_location(&self) -> Result<ResetOutcome, LocsimError> {
        if !self.capabilities().await?.clear_location {
            debug!("{} can't clear its location", self.device.udid());
            return Ok(ResetOutcome::NoOp);
        }
        self.device
            .clear_location()
            .await
            .map_err(LocsimError::RejectedByHost)?;
        Ok(ResetOutcome::Reset)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::simulator::fake::{FakeBridge, FakeDevice, host_error};

    fn here() -> Coordinate {
        Coordinate::new(48.8584, 2.2945).unwrap()
    }

    const LEGACY: HostCapabilities = HostCapabilities {
        set_location: false,
        clear_location: false,
    };

    #[tokio::test]
    async fn direct_capability_skips_the_bridge() {
        let bridge = Arc::new(FakeBridge::default());
        let device = Arc::new(FakeDevice::new("A").bridge(bridge.clone()));
        let controller = SimulatorLocationController::new(device.clone());

        controller.set_location(here()).await.unwrap();
        controller.set_location(here()).await.unwrap();

        assert_eq!(device.direct_sets.load(Ordering::SeqCst), 2);
        assert_eq!(device.lookups.load(Ordering::SeqCst), 0);
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 0);
        assert_eq!(device.capability_checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn legacy_hosts_go_through_the_bridge() {
        let bridge = Arc::new(FakeBridge::default());
        let device = Arc::new(FakeDevice::new("A").capabilities(LEGACY).bridge(bridge.clone()));
        let controller = SimulatorLocationController::new(device.clone());

        controller.set_location(here()).await.unwrap();

        assert_eq!(device.direct_sets.load(Ordering::SeqCst), 0);
        assert_eq!(device.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_bridge_is_unsupported() {
        let device = Arc::new(FakeDevice::new("A").capabilities(LEGACY));
        let controller = SimulatorLocationController::new(device);

        assert!(matches!(
            controller.set_location(here()).await,
            Err(LocsimError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn host_errors_are_surfaced_verbatim() {
        let device = Arc::new(FakeDevice::new("A").rejecting(host_error("Device not booted")));
        let controller = SimulatorLocationController::new(device);

        match controller.set_location(here()).await {
            Err(LocsimError::RejectedByHost(e)) => assert_eq!(e, host_error("Device not booted")),
            other => panic!("unexpected result: {other:?}"),
        }

        let bridge = Arc::new(FakeBridge {
            error: Some(host_error("bridge gone")),
            ..Default::default()
        });
        let device = Arc::new(FakeDevice::new("B").capabilities(LEGACY).bridge(bridge));
        let controller = SimulatorLocationController::new(device);
        assert!(matches!(
            controller.set_location(here()).await,
            Err(LocsimError::RejectedByHost(e)) if e.description == "bridge gone"
        ));
    }

    #[tokio::test]
    async fn reset_without_clear_is_a_no_op() {
        let device = Arc::new(FakeDevice::new("A").capabilities(LEGACY));
        let controller = SimulatorLocationController::new(device.clone());

        assert_eq!(controller.reset_location().await.unwrap(), ResetOutcome::NoOp);
        assert_eq!(device.clears.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reset_with_clear() {
        let device = FakeDevice::booted("A");
        let controller = SimulatorLocationController::new(device.clone());

        assert_eq!(controller.reset_location().await.unwrap(), ResetOutcome::Reset);
        assert_eq!(device.clears.load(Ordering::SeqCst), 1);
    }
}
