#![doc = include_str!("../README.md")]

mod action;
pub mod developer_mode;
pub mod device_info;
pub mod facade;
pub mod geo;
pub mod handle;
pub mod location;
pub mod lockdown;
pub mod mounter;
pub mod move_state;
pub mod pairing_file;
pub mod provider;
pub mod simulator;
pub mod spoofer;
#[cfg(test)]
mod test_util;
mod tls;
#[cfg(feature = "usbmuxd")]
pub mod usbmuxd;
mod util;
pub mod variant;

pub use developer_mode::{DeveloperModeAction, DeveloperModeController, DeveloperModeStatus};
pub use device_info::{DeviceIdentity, DeviceInfoQuery, DeviceKind};
pub use facade::{Device, PhysicalDevice, ResetOutcome, SimulatorDevice};
pub use geo::Coordinate;
pub use handle::{DeviceHandle, LookupOptions, TransportKind};
pub use location::LocationSimulationService;
pub use lockdown::{ServiceChannel, ServiceSession};
pub use mounter::{DiskImageMounter, MountRequest, MountResult};
pub use move_state::{MoveState, NavigationRoute};
pub use simulator::{HostError, SimServiceContext};
pub use spoofer::{AutoUpdate, AutoUpdateEnd, LocationSpoofer};
pub use util::{pretty_print_dictionary, pretty_print_plist};
pub use variant::{FromVariant, VariantKind};

use std::{io, sync::Arc};

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream, UnixStream and DuplexStream implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Type alias for boxed device connection sockets
pub type DeviceSocket = Box<dyn ReadWrite>;

/// Upper bound for a single plist frame; lockdown messages are a few KiB at most
const MAX_PLIST_FRAME: usize = 16 * 1024 * 1024;

/// Raw payloads (disk images) are written in frames of this size
const RAW_FRAME_SIZE: usize = 64 * 1024;

/// A length-prefixed plist connection to one port on a device
///
/// Every service this crate talks to (lockdown, amfi, the image mounter and the
/// location service) speaks the same framing: a big-endian `u32` length followed
/// by an XML plist.
#[derive(Debug)]
pub struct ServiceConnection {
    /// The underlying socket, `None` once a TLS upgrade consumed it and failed
    socket: Option<DeviceSocket>,
    /// Label sent with lockdown requests
    label: String,
}

impl ServiceConnection {
    /// Wraps an established socket
    ///
    /// # Arguments
    /// * `socket` - The connected socket
    /// * `label` - Client label identifying this connection to the device
    pub fn new(socket: DeviceSocket, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
        }
    }

    /// The client label this connection was created with
    pub fn label(&self) -> &str {
        &self.label
    }

    fn socket(&mut self) -> Result<&mut DeviceSocket, LocsimError> {
        self.socket
            .as_mut()
            .ok_or(LocsimError::NoEstablishedConnection)
    }

    /// Sends an XML plist frame
    ///
    /// # Errors
    /// Returns `LocsimError` if serialization or transmission fails
    pub(crate) async fn send_plist(&mut self, message: plist::Value) -> Result<(), LocsimError> {
        debug!("Sending plist: {}", pretty_print_plist(&message));

        let mut buf = Vec::new();
        message.to_writer_xml(&mut buf)?;
        let len = u32::try_from(buf.len())
            .map_err(|_| ProtocolError::FrameTooLarge(buf.len()))?;

        let socket = self.socket()?;
        socket.write_all(&len.to_be_bytes()).await?;
        socket.write_all(&buf).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Reads one plist frame and requires it to be a mapping
    ///
    /// The `Error` key is left untouched; services that put their own meaning
    /// on it read with this and interpret the mapping themselves.
    pub(crate) async fn read_plist(&mut self) -> Result<plist::Dictionary, LocsimError> {
        let socket = self.socket()?;

        let mut len = [0u8; 4];
        socket.read_exact(&mut len).await?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_PLIST_FRAME {
            return Err(ProtocolError::FrameTooLarge(len).into());
        }

        let mut buf = vec![0; len];
        socket.read_exact(&mut buf).await?;
        let value = plist::Value::from_reader(std::io::Cursor::new(buf))?;

        match value {
            plist::Value::Dictionary(res) => {
                debug!("Received plist: {}", pretty_print_dictionary(&res));
                Ok(res)
            }
            other => Err(ProtocolError::KindMismatch {
                expected: VariantKind::Mapping,
                found: VariantKind::of(&other),
            }
            .into()),
        }
    }

    /// Reads one plist frame and turns a device-reported `Error` into a typed error
    ///
    /// # Errors
    /// Returns the mapped device error, or `ProtocolError` if `Error` isn't a string
    pub(crate) async fn read_response(&mut self) -> Result<plist::Dictionary, LocsimError> {
        let res = self.read_plist().await?;
        if let Some(e) = res.get("Error") {
            let e = String::from_variant(e)?;
            return Err(LocsimError::from_device_error_type(&e, &res));
        }
        Ok(res)
    }

    /// Sends raw bytes, split into frames
    pub(crate) async fn send_raw(&mut self, message: &[u8]) -> Result<(), LocsimError> {
        let socket = self.socket()?;
        let frames = message.chunks(RAW_FRAME_SIZE);
        let total = frames.len();

        for (i, frame) in frames.enumerate() {
            trace!("Writing frame {}/{total}", i + 1);
            socket.write_all(frame).await?;
        }
        socket.flush().await?;
        Ok(())
    }

    /// Upgrades the connection to TLS using the host credentials of a pairing record
    ///
    /// # Errors
    /// Returns `LocsimError` if the credentials can't be loaded or the TLS handshake fails.
    /// A failed handshake leaves the connection unusable.
    pub(crate) async fn start_tls(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), LocsimError> {
        tls::ensure_crypto_provider();
        let config = tls::create_client_config(pairing_file)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        let server_name = ServerName::try_from("Device")
            .map_err(|e| LocsimError::HandshakeFailed(e.to_string()))?;
        let socket = self
            .socket
            .take()
            .ok_or(LocsimError::NoEstablishedConnection)?;
        let socket = connector.connect(server_name, socket).await?;

        self.socket = Some(Box::new(socket));
        Ok(())
    }
}

/// A response that violates the shape the protocol promises
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("expected {expected}, found {found}")]
    KindMismatch {
        expected: VariantKind,
        found: VariantKind,
    },
    #[error("response is missing `{0}`")]
    MissingField(&'static str),
    #[error("malformed response")]
    MalformedResponse,
    #[error("unexpected status `{0}`")]
    UnexpectedStatus(String),
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
    #[error("frame of {0} bytes exceeds the protocol limit")]
    FrameTooLarge(usize),
}

/// Comprehensive error type for device and simulator control failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LocsimError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error),
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error),
    #[error("TLS error")]
    Rustls(#[from] rustls::Error),
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[cfg(feature = "simctl")]
    #[error("JSON deserialization failed")]
    Json(#[from] serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("device not found")]
    DeviceNotFound,
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("service `{0}` is unavailable")]
    ServiceUnavailable(String),
    #[error("the requested value is not set on the device")]
    MissingValue,
    #[error("device reported failure: {0}")]
    Application(String),
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("developer disk image is already mounted")]
    AlreadyMounted,
    #[error("image upload failed: {0}")]
    UploadFailed(String),
    #[error("image validation failed: {0}")]
    ValidationFailed(String),
    #[error("developer disk image is not mounted")]
    ImageNotMounted,

    #[error("host rejected the request: {0}")]
    RejectedByHost(HostError),
    #[error("simulator {0} is not booted")]
    SimulatorNotBooted(String),
    #[error("notification hub has shut down")]
    HubClosed,
    #[error("auto update task failed: {0}")]
    AutoUpdateFailed(String),
    #[error("simulator host command failed: {0}")]
    HostCommand(String),
    #[error("invalid coordinate ({0}, {1})")]
    InvalidCoordinate(f64, f64),

    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("device does not have pairing file")]
    InvalidHostID,
    #[error("device locked")]
    DeviceLocked,
    #[error("pairing trust dialog pending")]
    PairingDialogResponsePending,
    #[error("user denied pairing trust")]
    UserDeniedPairing,
    #[error("device is passcode protected")]
    PasswordProtected,
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),

    #[error("device refused connection")]
    UsbConnectionRefused,
    #[error("bad command")]
    UsbBadCommand,
    #[error("bad device")]
    UsbBadDevice,
    #[error("usb bad version")]
    UsbBadVersion,
}

impl LocsimError {
    /// Converts a device-reported error string to a typed error
    ///
    /// # Arguments
    /// * `e` - The error string from device
    /// * `context` - Full response containing additional error details
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Self {
        match e {
            "GetProhibited" => Self::GetProhibited,
            "InvalidHostID" => Self::InvalidHostID,
            "SessionInactive" => Self::SessionInactive,
            "DeviceLocked" => Self::DeviceLocked,
            "PairingDialogResponsePending" => Self::PairingDialogResponsePending,
            "UserDeniedPairing" => Self::UserDeniedPairing,
            "PasswordProtected" => Self::PasswordProtected,
            "MissingValue" => Self::MissingValue,
            "InternalError" => {
                let detailed_error = context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string();

                if detailed_error.contains("There is no matching entry in the device map for") {
                    Self::ImageNotMounted
                } else {
                    Self::InternalError(detailed_error)
                }
            }
            _ => Self::UnknownErrorType(e.to_string()),
        }
    }

    /// True for the failures that mean the device never accepted this host
    pub fn is_pairing_failure(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailed(_)
                | Self::InvalidHostID
                | Self::PasswordProtected
                | Self::UserDeniedPairing
                | Self::PairingDialogResponsePending
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::pipe;

    #[tokio::test]
    async fn plist_frames_are_length_prefixed() {
        let (mut conn, mut peer) = pipe();

        let mut req = plist::Dictionary::new();
        req.insert("Request".into(), "QueryType".into());
        conn.send_plist(plist::Value::Dictionary(req)).await.unwrap();

        let received = peer.read_request().await;
        assert_eq!(
            received.get("Request").and_then(|v| v.as_string()),
            Some("QueryType")
        );
    }

    #[tokio::test]
    async fn non_mapping_frame_is_a_protocol_error() {
        let (mut conn, mut peer) = pipe();
        peer.reply_value(plist::Value::Array(vec![])).await;

        match conn.read_plist().await {
            Err(LocsimError::Protocol(ProtocolError::KindMismatch { expected, found })) => {
                assert_eq!(expected, VariantKind::Mapping);
                assert_eq!(found, VariantKind::Array);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn device_errors_are_typed() {
        let (mut conn, mut peer) = pipe();

        let mut res = plist::Dictionary::new();
        res.insert("Error".into(), "MissingValue".into());
        peer.reply(res).await;
        assert!(matches!(
            conn.read_response().await,
            Err(LocsimError::MissingValue)
        ));

        let mut res = plist::Dictionary::new();
        res.insert("Error".into(), "SomethingNew".into());
        peer.reply(res).await;
        assert!(matches!(
            conn.read_response().await,
            Err(LocsimError::UnknownErrorType(e)) if e == "SomethingNew"
        ));
    }

    #[tokio::test]
    async fn non_string_error_is_a_protocol_error() {
        let (mut conn, mut peer) = pipe();

        let mut res = plist::Dictionary::new();
        res.insert("Error".into(), 5u64.into());
        peer.reply(res).await;
        assert!(matches!(
            conn.read_response().await,
            Err(LocsimError::Protocol(ProtocolError::KindMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn raw_payloads_arrive_intact() {
        let (mut conn, mut peer) = pipe();
        let payload: Vec<u8> = (0..(RAW_FRAME_SIZE * 2 + 17))
            .map(|i| (i % 251) as u8)
            .collect();

        conn.send_raw(&payload).await.unwrap();
        assert_eq!(peer.read_raw(payload.len()).await, payload);
    }

    #[tokio::test]
    async fn closed_peer_is_a_socket_error() {
        let (mut conn, peer) = pipe();
        drop(peer);
        assert!(matches!(
            conn.read_plist().await,
            Err(LocsimError::Socket(_))
        ));
    }
}
