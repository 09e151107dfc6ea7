use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    LocsimError, ProtocolError,
    usbmuxd::{Connection, UsbmuxdDevice},
};

#[derive(Deserialize)]
pub struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceListResponse>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceListResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DevicePropertiesResponse,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DevicePropertiesResponse {
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "NetworkAddress")]
    pub network_address: Option<plist::Data>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
}

/// Reads the IPv6 address that sits at offset 8 of a `sockaddr_in6`
fn ipv6_at_8(addr: &[u8]) -> IpAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&addr[8..24]);
    IpAddr::V6(Ipv6Addr::from(octets))
}

/// Decodes the raw sockaddr usbmuxd reports for network-attached devices
fn parse_network_address(addr: &[u8]) -> Result<Connection, LocsimError> {
    if addr.len() < 8 {
        warn!("Device address bytes len < 8");
        return Err(ProtocolError::MalformedResponse.into());
    }

    Ok(match addr[0] {
        // sockaddr_in with the family in the first byte
        0x02 => Connection::Network(IpAddr::V4(Ipv4Addr::new(
            addr[4], addr[5], addr[6], addr[7],
        ))),
        0x1E => {
            if addr.len() < 24 {
                warn!("IPv6 address is less than 24 bytes");
                return Err(ProtocolError::MalformedResponse.into());
            }
            Connection::Network(ipv6_at_8(addr))
        }
        // BSD layout: length byte, then family
        0x1C => {
            if addr.len() < 28 {
                warn!("IPv6 sockaddr_in6 data too short (len {})", addr.len());
                return Err(ProtocolError::MalformedResponse.into());
            }
            if addr[1] == 0x1E {
                Connection::Network(ipv6_at_8(addr))
            } else {
                warn!("Expected IPv6 family (0x1E) but got {:02X}", addr[1]);
                Connection::Unknown(format!("Network {:02X}", addr[1]))
            }
        }
        other => {
            warn!("Unknown IP address protocol: {other:02X}");
            Connection::Unknown(format!("Network {other:02X}"))
        }
    })
}

impl TryFrom<DeviceListResponse> for UsbmuxdDevice {
    type Error = LocsimError;

    fn try_from(dev: DeviceListResponse) -> Result<Self, Self::Error> {
        let connection_type = match dev.properties.connection_type.as_str() {
            "Network" => match dev.properties.network_address {
                Some(addr) => parse_network_address(&Vec::<u8>::from(addr))?,
                None => {
                    warn!("Device is network attached, but has no network info");
                    return Err(ProtocolError::MissingField("NetworkAddress").into());
                }
            },
            "USB" => Connection::Usb,
            _ => Connection::Unknown(dev.properties.connection_type),
        };
        debug!("Connection type: {connection_type:?}");
        Ok(UsbmuxdDevice {
            connection_type,
            udid: dev.properties.serial_number,
            device_id: dev.device_id,
        })
    }
}
