//! usbmuxd client
//!
//! The multiplexing daemon knows which devices are attached (over USB or the
//! network), stores their pairing records and tunnels connections to device ports.

use std::{
    net::{AddrParseError, IpAddr, SocketAddr},
    str::FromStr,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    DeviceSocket, LocsimError, ProtocolError, ServiceConnection,
    handle::{DeviceHandle, TransportKind},
    pairing_file::PairingFile,
    pretty_print_dictionary,
    provider::UsbmuxdProvider,
    variant::field,
};

mod des;

/// How a device is attached to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Usb,
    Network(IpAddr),
    Unknown(String),
}

impl Connection {
    fn transport(&self) -> Option<TransportKind> {
        match self {
            Self::Usb => Some(TransportKind::Usb),
            Self::Network(_) => Some(TransportKind::Network),
            Self::Unknown(_) => None,
        }
    }
}

/// A device entry as listed by usbmuxd
#[derive(Debug, Clone)]
pub struct UsbmuxdDevice {
    pub connection_type: Connection,
    pub udid: String,
    /// usbmuxd-assigned device ID, only valid while the device stays attached
    pub device_id: u32,
}

/// Active connection to the usbmuxd service
pub struct UsbmuxdConnection {
    socket: DeviceSocket,
    tag: u32,
}

/// Address of the usbmuxd service
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsbmuxdAddr {
    #[cfg(unix)]
    UnixSocket(String),
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    pub const DEFAULT_PORT: u16 = 27015;
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";
    pub const ENV_VAR: &'static str = "USBMUXD_SOCKET_ADDRESS";

    pub async fn to_socket(&self) -> Result<DeviceSocket, LocsimError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, LocsimError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket, tag))
    }

    /// Reads the address from `USBMUXD_SOCKET_ADDRESS`, falling back to the platform default
    ///
    /// A value containing `:` is a TCP address, anything else a socket path.
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        match std::env::var(Self::ENV_VAR) {
            Ok(var) => Self::parse(&var),
            Err(_) => Ok(Self::default()),
        }
    }

    fn parse(var: &str) -> Result<Self, AddrParseError> {
        #[cfg(unix)]
        if !var.contains(':') {
            return Ok(Self::UnixSocket(var.to_string()));
        }
        Ok(Self::TcpSocket(SocketAddr::from_str(var)?))
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::LOCALHOST,
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

const HEADER_LEN: usize = 16;

/// Frames a plist message: little-endian {length, version, message type, tag} then XML
fn encode_packet(
    message: &plist::Dictionary,
    version: u32,
    message_type: u32,
    tag: u32,
) -> Result<Vec<u8>, LocsimError> {
    let mut body = Vec::new();
    plist::to_writer_xml(&mut body, message)?;

    let total = HEADER_LEN + body.len();
    let len = u32::try_from(total).map_err(|_| ProtocolError::FrameTooLarge(total))?;

    let mut packet = Vec::with_capacity(total);
    packet.extend_from_slice(&len.to_le_bytes());
    packet.extend_from_slice(&version.to_le_bytes());
    packet.extend_from_slice(&message_type.to_le_bytes());
    packet.extend_from_slice(&tag.to_le_bytes());
    packet.extend_from_slice(&body);
    Ok(packet)
}

impl UsbmuxdConnection {
    pub const XML_PLIST_VERSION: u32 = 1;
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    const CLIENT_VERSION: &'static str = concat!("locsim-", env!("CARGO_PKG_VERSION"));

    pub fn new(socket: DeviceSocket, tag: u32) -> Self {
        Self { socket, tag }
    }

    /// Lists attached devices
    ///
    /// Entries usbmuxd describes inconsistently are skipped with a warning.
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, LocsimError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        req.insert("ClientVersionString".into(), Self::CLIENT_VERSION.into());
        req.insert("kLibUSBMuxVersion".into(), 3.into());
        self.write_plist(req).await?;

        let res = self.read_plist().await?;
        let res: des::ListDevicesResponse = plist::from_value(&plist::Value::Dictionary(res))?;

        Ok(res
            .device_list
            .into_iter()
            .filter_map(|d| match UsbmuxdDevice::try_from(d) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("Skipping device entry: {e}");
                    None
                }
            })
            .collect())
    }

    /// Resolves a handle to one attached device, honouring its lookup options
    ///
    /// # Errors
    /// `DeviceNotFound` if no attached device matches over an allowed transport
    pub async fn find_device(
        &mut self,
        handle: &DeviceHandle,
    ) -> Result<UsbmuxdDevice, LocsimError> {
        let devices = self.get_devices().await?;
        let candidates = devices
            .into_iter()
            .filter(|d| d.udid == handle.udid())
            .filter_map(|d| d.connection_type.transport().map(|t| (t, d)));

        handle
            .lookup()
            .select(candidates)
            .ok_or(LocsimError::DeviceNotFound)
    }

    /// Reads the pairing record usbmuxd stores for a device
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairingFile, LocsimError> {
        debug!("Getting pair record for {udid}");
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadPairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;

        match field::<Vec<u8>>(&res, "PairRecordData")? {
            Some(d) => PairingFile::from_bytes(&d),
            None => {
                // usbmuxd answers a Result packet when it has no record
                warn!("No pair record for {udid}");
                Err(LocsimError::HandshakeFailed(format!("no pairing record for {udid}")))
            }
        }
    }

    /// Turns this connection into a tunnel to a port on the device
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd device ID
    /// * `port` - port on the device, host byte order
    /// * `label` - label for the resulting connection
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<ServiceConnection, LocsimError> {
        debug!("Connecting to device {device_id} on port {port}");

        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), device_id.into());
        // usbmuxd wants the port in network byte order
        req.insert("PortNumber".into(), port.to_be().into());
        self.write_plist(req).await?;

        let res = self.read_plist().await?;
        match field::<u64>(&res, "Number")? {
            Some(0) => Ok(ServiceConnection::new(self.socket, label)),
            Some(1) => Err(LocsimError::UsbBadCommand),
            Some(2) => Err(LocsimError::UsbBadDevice),
            Some(3) => Err(LocsimError::UsbConnectionRefused),
            Some(6) => Err(LocsimError::UsbBadVersion),
            Some(n) => Err(ProtocolError::UnexpectedStatus(n.to_string()).into()),
            None => Err(ProtocolError::MissingField("Number").into()),
        }
    }

    async fn write_plist(&mut self, req: plist::Dictionary) -> Result<(), LocsimError> {
        let packet = encode_packet(
            &req,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        )?;
        self.socket.write_all(&packet).await?;
        self.socket.flush().await?;
        Ok(())
    }

    async fn read_plist(&mut self) -> Result<plist::Dictionary, LocsimError> {
        let mut len = [0u8; 4];
        self.socket.read_exact(&mut len).await?;
        let mut rest_of_header = [0u8; HEADER_LEN - 4];
        self.socket.read_exact(&mut rest_of_header).await?;

        let total = u32::from_le_bytes(len) as usize;
        let body_len = total
            .checked_sub(HEADER_LEN)
            .ok_or(ProtocolError::MalformedResponse)?;
        debug!("Reading {body_len} bytes from muxer");

        let mut body = vec![0; body_len];
        self.socket.read_exact(&mut body).await?;

        let res: plist::Dictionary = plist::from_bytes(&body)?;
        debug!("Read from muxer: {}", pretty_print_dictionary(&res));
        Ok(res)
    }
}

impl UsbmuxdDevice {
    /// Creates a provider for this device
    pub fn to_provider(&self, addr: UsbmuxdAddr, label: impl Into<String>) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            tag: self.device_id,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label: label.into(),
        }
    }
}
