//! Lockdown sessions
//!
//! Lockdown is the device's configuration service on port 62078. A paired session
//! answers value queries and starts the named services everything else runs on.

use std::{io::ErrorKind, marker::PhantomData, sync::Arc};

use tracing::{debug, warn};

use crate::{
    LocsimError, ProtocolError, ServiceConnection,
    pairing_file::PairingFile,
    provider::DeviceProvider,
    variant::{field, required_field},
};

#[cfg(feature = "usbmuxd")]
use crate::{handle::DeviceHandle, provider::UsbmuxdProvider, usbmuxd::UsbmuxdAddr};

/// A validated, paired lockdown session with one device
///
/// Dropping the session closes the connection; [`ServiceSession::close`] also
/// tells lockdown to end the session first.
#[derive(Debug)]
pub struct ServiceSession {
    provider: Arc<dyn DeviceProvider>,
    connection: ServiceConnection,
    pairing_file: PairingFile,
    session_id: String,
}

/// A running service started through a [`ServiceSession`]
///
/// The channel borrows its session, so it can't outlive it.
#[derive(Debug)]
pub struct ServiceChannel<'s> {
    name: String,
    connection: ServiceConnection,
    _session: PhantomData<&'s mut ServiceSession>,
}

impl<'s> ServiceChannel<'s> {
    /// The service name this channel was started for
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn connection(&mut self) -> &mut ServiceConnection {
        &mut self.connection
    }
}

/// Failures reaching lockdown that mean the device isn't there
fn absent(e: LocsimError) -> LocsimError {
    match e {
        LocsimError::UsbBadDevice => LocsimError::DeviceNotFound,
        LocsimError::Socket(ref io)
            if matches!(
                io.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::HostUnreachable
                    | ErrorKind::NotFound
                    | ErrorKind::TimedOut
            ) =>
        {
            debug!("Lockdown unreachable: {io}");
            LocsimError::DeviceNotFound
        }
        other => other,
    }
}

/// Wraps anything but a transport failure as a failed handshake
fn handshake(e: LocsimError) -> LocsimError {
    match e {
        LocsimError::Socket(_) | LocsimError::HandshakeFailed(_) => e,
        other => LocsimError::HandshakeFailed(other.to_string()),
    }
}

impl ServiceSession {
    pub const LOCKDOWND_PORT: u16 = 62078;
    pub const SERVICE_TYPE: &'static str = "com.apple.mobile.lockdown";

    /// Connects to lockdown and establishes a paired session
    ///
    /// # Errors
    /// * `DeviceNotFound` if the provider can't reach the device at all
    /// * `HandshakeFailed` if the device doesn't speak lockdown, has no pairing
    ///   record for this host, or refuses the session
    pub async fn connect(provider: Arc<dyn DeviceProvider>) -> Result<Self, LocsimError> {
        let mut connection = provider
            .connect(Self::LOCKDOWND_PORT)
            .await
            .map_err(absent)?;

        Self::query_type(&mut connection).await.map_err(handshake)?;

        let pairing_file = provider.get_pairing_file().await.map_err(handshake)?;
        let session_id = Self::start_session(&mut connection, &pairing_file)
            .await
            .map_err(handshake)?;
        debug!("Lockdown session {session_id} established");

        Ok(Self {
            provider,
            connection,
            pairing_file,
            session_id,
        })
    }

    /// Looks a device up through usbmuxd and establishes a session with it
    #[cfg(feature = "usbmuxd")]
    pub async fn connect_handle(
        handle: &DeviceHandle,
        label: impl Into<String>,
    ) -> Result<Self, LocsimError> {
        let addr = UsbmuxdAddr::from_env_var()
            .map_err(|e| LocsimError::Unsupported(format!("bad usbmuxd address: {e}")))?;
        let provider = UsbmuxdProvider::for_handle(addr, handle, label).await?;
        Self::connect(Arc::new(provider)).await
    }

    async fn query_type(connection: &mut ServiceConnection) -> Result<(), LocsimError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), connection.label().into());
        req.insert("Request".into(), "QueryType".into());
        connection.send_plist(req.into()).await?;

        let res = connection.read_response().await?;
        let kind: String = required_field(&res, "Type")?;
        if kind != Self::SERVICE_TYPE {
            return Err(LocsimError::HandshakeFailed(format!(
                "port answered as {kind}"
            )));
        }
        Ok(())
    }

    async fn start_session(
        connection: &mut ServiceConnection,
        pairing_file: &PairingFile,
    ) -> Result<String, LocsimError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), connection.label().into());
        req.insert("Request".into(), "StartSession".into());
        req.insert("HostID".into(), pairing_file.host_id.clone().into());
        req.insert("SystemBUID".into(), pairing_file.system_buid.clone().into());
        connection.send_plist(req.into()).await?;

        let res = connection.read_response().await?;
        let session_id: String = required_field(&res, "SessionID")?;
        if field::<bool>(&res, "EnableSessionSSL")?.unwrap_or(false) {
            connection
                .start_tls(pairing_file)
                .await
                .map_err(|e| LocsimError::HandshakeFailed(format!("session TLS: {e}")))?;
        }
        Ok(session_id)
    }

    /// The client label this session identifies itself with
    pub fn label(&self) -> &str {
        self.connection.label()
    }

    /// Reads one value from lockdown
    ///
    /// # Arguments
    /// * `domain` - value domain, `None` for the global one
    /// * `key` - the value's key
    ///
    /// # Errors
    /// `MissingValue` if the device has nothing under that key
    pub async fn get_value(
        &mut self,
        domain: Option<&str>,
        key: &str,
    ) -> Result<plist::Value, LocsimError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().into());
        req.insert("Request".into(), "GetValue".into());
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        req.insert("Key".into(), key.into());
        self.connection.send_plist(req.into()).await?;

        let mut res = self.connection.read_response().await?;
        res.remove("Value").ok_or(LocsimError::MissingValue)
    }

    /// Starts a named service and connects to it
    ///
    /// # Errors
    /// `ServiceUnavailable` if lockdown refuses to start the service
    pub async fn start_service(&mut self, name: &str) -> Result<ServiceChannel<'_>, LocsimError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().into());
        req.insert("Request".into(), "StartService".into());
        req.insert("Service".into(), name.into());
        self.connection.send_plist(req.into()).await?;

        let res = self.connection.read_plist().await?;
        if let Some(e) = field::<String>(&res, "Error")? {
            warn!("Lockdown refused to start {name}: {e}");
            return Err(LocsimError::ServiceUnavailable(name.to_string()));
        }

        let port: u64 = required_field(&res, "Port")?;
        let port = u16::try_from(port).map_err(|_| ProtocolError::MalformedResponse)?;
        // Absent over USB
        let ssl = field::<bool>(&res, "EnableServiceSSL")?.unwrap_or(false);
        debug!("{name} listening on port {port}, ssl: {ssl}");

        let mut connection = self.provider.connect(port).await?;
        if ssl {
            connection.start_tls(&self.pairing_file).await?;
        }

        Ok(ServiceChannel {
            name: name.to_string(),
            connection,
            _session: PhantomData,
        })
    }

    /// Ends the session
    pub async fn close(mut self) -> Result<(), LocsimError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().into());
        req.insert("Request".into(), "StopSession".into());
        req.insert("SessionID".into(), self.session_id.clone().into());
        self.connection.send_plist(req.into()).await?;
        self.connection.read_response().await?;
        Ok(())
    }
}
