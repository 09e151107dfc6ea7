//! On-device location simulation
//!
//! `com.apple.dt.simulatelocation` lives on the developer disk image. It speaks a
//! bare binary protocol: a big-endian command word, then for `set` the latitude and
//! longitude as length-prefixed decimal strings. The service never answers.

use tracing::debug;

use crate::{LocsimError, ServiceChannel, ServiceSession, geo::Coordinate};

const SET: u32 = 0;
const CLEAR: u32 = 1;

/// Client for the location simulation service
#[derive(Debug)]
pub struct LocationSimulationService<'s> {
    channel: ServiceChannel<'s>,
}

impl<'s> LocationSimulationService<'s> {
    pub const SERVICE_NAME: &'static str = "com.apple.dt.simulatelocation";

    /// Starts the service
    ///
    /// # Errors
    /// `ServiceUnavailable` when the developer disk image isn't mounted
    pub async fn start(session: &'s mut ServiceSession) -> Result<Self, LocsimError> {
        let channel = session.start_service(Self::SERVICE_NAME).await?;
        Ok(Self { channel })
    }

    /// Overrides the device's location
    pub async fn set(&mut self, coordinate: &Coordinate) -> Result<(), LocsimError> {
        debug!("Simulating location {coordinate}");
        let message = encode_set(coordinate);
        self.channel.connection().send_raw(&message).await
    }

    /// Returns the device to its real location
    pub async fn clear(&mut self) -> Result<(), LocsimError> {
        debug!("Clearing simulated location");
        self.channel
            .connection()
            .send_raw(&CLEAR.to_be_bytes())
            .await
    }
}

fn encode_set(coordinate: &Coordinate) -> Vec<u8> {
    let mut message = SET.to_be_bytes().to_vec();
    for part in [coordinate.latitude(), coordinate.longitude()] {
        let part = part.to_string();
        message.extend_from_slice(&(part.len() as u32).to_be_bytes());
        message.extend_from_slice(part.as_bytes());
    }
    message
}
