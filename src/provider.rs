//! Ways of reaching a physical device
//!
//! A provider is bound to exactly one device. It opens connections to ports on
//! that device and hands out the pairing record the host uses to authenticate.

use std::{future::Future, pin::Pin};

#[cfg(feature = "tcp")]
use std::net::{IpAddr, SocketAddr};

#[cfg(feature = "tcp")]
use tokio::net::TcpStream;

use crate::{LocsimError, ServiceConnection, pairing_file::PairingFile};

#[cfg(feature = "usbmuxd")]
use crate::{handle::DeviceHandle, usbmuxd::UsbmuxdAddr};

/// Boxed future returned by provider methods
pub type ProviderFuture<T> = Pin<Box<dyn Future<Output = Result<T, LocsimError>> + Send>>;

/// A connection source for one device
pub trait DeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    /// Opens a plain connection to `port` on the device
    fn connect(&self, port: u16) -> ProviderFuture<ServiceConnection>;

    /// Label sent with every lockdown request
    fn label(&self) -> &str;

    /// The pairing record for this device
    fn get_pairing_file(&self) -> ProviderFuture<PairingFile>;
}

/// Reaches a network-paired device directly by address
#[cfg(feature = "tcp")]
#[derive(Debug)]
pub struct TcpProvider {
    pub addr: IpAddr,
    pub pairing_file: PairingFile,
    pub label: String,
}

#[cfg(feature = "tcp")]
impl DeviceProvider for TcpProvider {
    fn connect(&self, port: u16) -> ProviderFuture<ServiceConnection> {
        let addr = self.addr;
        let label = self.label.clone();
        Box::pin(async move {
            let stream = TcpStream::connect(SocketAddr::new(addr, port)).await?;
            Ok(ServiceConnection::new(Box::new(stream), label))
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn get_pairing_file(&self) -> ProviderFuture<PairingFile> {
        let pairing_file = self.pairing_file.clone();
        Box::pin(async move { Ok(pairing_file) })
    }
}

/// Reaches a device through usbmuxd
#[cfg(feature = "usbmuxd")]
#[derive(Debug)]
pub struct UsbmuxdProvider {
    pub addr: UsbmuxdAddr,
    pub tag: u32,
    pub udid: String,
    pub device_id: u32,
    pub label: String,
}

#[cfg(feature = "usbmuxd")]
impl UsbmuxdProvider {
    /// Looks the handle up in usbmuxd and binds a provider to the device found
    ///
    /// # Errors
    /// `DeviceNotFound` when the device isn't attached over an allowed transport
    pub async fn for_handle(
        addr: UsbmuxdAddr,
        handle: &DeviceHandle,
        label: impl Into<String>,
    ) -> Result<Self, LocsimError> {
        let mut usbmuxd = addr.connect(0).await?;
        let device = usbmuxd.find_device(handle).await?;
        Ok(device.to_provider(addr, label))
    }
}

#[cfg(feature = "usbmuxd")]
impl DeviceProvider for UsbmuxdProvider {
    fn connect(&self, port: u16) -> ProviderFuture<ServiceConnection> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let device_id = self.device_id;
        let label = self.label.clone();

        Box::pin(async move {
            let usbmuxd = addr.connect(tag).await?;
            usbmuxd.connect_to_device(device_id, port, &label).await
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn get_pairing_file(&self) -> ProviderFuture<PairingFile> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let udid = self.udid.clone();

        Box::pin(async move {
            let mut usbmuxd = addr.connect(tag).await?;
            usbmuxd.get_pair_record(&udid).await
        })
    }
}
