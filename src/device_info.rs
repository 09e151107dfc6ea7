//! Identity facts about a physical device

use crate::{LocsimError, ServiceSession, variant::FromVariant};

/// Whether a device is real hardware or a simulated instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Physical,
    Simulator,
}

/// What a device reports about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub udid: String,
    /// The user-visible name, e.g. "Anna's iPhone"
    pub name: String,
    /// OS product, e.g. "iPhone OS"
    pub product_name: String,
    /// OS version, e.g. "17.4"
    pub product_version: String,
    pub kind: DeviceKind,
}

/// Typed reads of lockdown string values
///
/// Every read is a fresh round trip; nothing is cached.
#[derive(Debug)]
pub struct DeviceInfoQuery<'s> {
    session: &'s mut ServiceSession,
}

impl<'s> DeviceInfoQuery<'s> {
    pub fn new(session: &'s mut ServiceSession) -> Self {
        Self { session }
    }

    /// Reads a value that must be a string
    ///
    /// # Errors
    /// * `MissingValue` if the key is absent
    /// * `Protocol` if the value has any other kind
    /// * `Socket` if the connection failed
    pub async fn query_string(
        &mut self,
        domain: Option<&str>,
        key: &str,
    ) -> Result<String, LocsimError> {
        let value = self.session.get_value(domain, key).await?;
        Ok(String::from_variant(&value)?)
    }

    pub async fn product_version(&mut self) -> Result<String, LocsimError> {
        self.query_string(None, "ProductVersion").await
    }

    pub async fn product_name(&mut self) -> Result<String, LocsimError> {
        self.query_string(None, "ProductName").await
    }

    pub async fn device_name(&mut self) -> Result<String, LocsimError> {
        self.query_string(None, "DeviceName").await
    }

    /// Reads everything that makes up the device's identity
    pub async fn identity(&mut self) -> Result<DeviceIdentity, LocsimError> {
        Ok(DeviceIdentity {
            udid: self.query_string(None, "UniqueDeviceID").await?,
            name: self.device_name().await?,
            product_name: self.product_name().await?,
            product_version: self.product_version().await?,
            kind: DeviceKind::Physical,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ProtocolError, VariantKind,
        test_util::{FakePeer, ScriptedProvider, dict},
    };

    async fn answer(device: &mut FakePeer, key: &str, value: plist::Value) {
        let req = device.expect("GetValue").await;
        assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some(key));
        device.reply(dict([("Key", key.into()), ("Value", value)])).await;
    }

    #[tokio::test]
    async fn identity_reads_each_value() {
        let (provider, mut peers) = ScriptedProvider::with_peers(1);
        let mut device = peers.remove(0);

        let server = tokio::spawn(async move {
            device.accept_session().await;
            answer(&mut device, "UniqueDeviceID", "00008030-TEST".into()).await;
            answer(&mut device, "DeviceName", "Test iPhone".into()).await;
            answer(&mut device, "ProductName", "iPhone OS".into()).await;
            answer(&mut device, "ProductVersion", "16.7.2".into()).await;
        });

        let mut session = ServiceSession::connect(provider).await.unwrap();
        let identity = DeviceInfoQuery::new(&mut session).identity().await.unwrap();
        assert_eq!(
            identity,
            DeviceIdentity {
                udid: "00008030-TEST".into(),
                name: "Test iPhone".into(),
                product_name: "iPhone OS".into(),
                product_version: "16.7.2".into(),
                kind: DeviceKind::Physical,
            }
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn non_string_values_are_protocol_errors() {
        let (provider, mut peers) = ScriptedProvider::with_peers(1);
        let mut device = peers.remove(0);

        let server = tokio::spawn(async move {
            device.accept_session().await;
            answer(&mut device, "ProductVersion", 17u64.into()).await;
            answer(&mut device, "DeviceName", plist::Value::Data(vec![])).await;
        });

        let mut session = ServiceSession::connect(provider).await.unwrap();
        let mut query = DeviceInfoQuery::new(&mut session);
        match query.product_version().await {
            Err(LocsimError::Protocol(ProtocolError::KindMismatch { expected, found })) => {
                assert_eq!(expected, VariantKind::String);
                assert_eq!(found, VariantKind::UnsignedInt);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            query.device_name().await,
            Err(LocsimError::Protocol(ProtocolError::KindMismatch { .. }))
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn empty_string_is_a_value_not_an_absence() {
        let (provider, mut peers) = ScriptedProvider::with_peers(1);
        let mut device = peers.remove(0);

        let server = tokio::spawn(async move {
            device.accept_session().await;
            answer(&mut device, "DeviceName", "".into()).await;
            device.expect("GetValue").await;
            device.reply(dict([("Error", "MissingValue".into())])).await;
        });

        let mut session = ServiceSession::connect(provider).await.unwrap();
        let mut query = DeviceInfoQuery::new(&mut session);
        assert_eq!(query.device_name().await.unwrap(), "");
        assert!(matches!(
            query.product_name().await,
            Err(LocsimError::MissingValue)
        ));
        server.await.unwrap();
    }
}
