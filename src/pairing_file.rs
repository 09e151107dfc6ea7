//! Pairing records
//!
//! A pairing record holds the host credentials a device accepted when it was
//! trusted. Lockdown sessions present them in `StartSession` and use the
//! certificate and key for the TLS upgrade.

use std::path::Path;

use plist::Data;
use rustls::pki_types::{CertificateDer, pem::PemObject};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::LocsimError;

/// Host credentials for one trusted device
#[derive(Clone, Debug)]
pub struct PairingFile {
    /// Device's certificate in DER format
    pub device_certificate: CertificateDer<'static>,
    /// Host's private key, PEM encoded
    pub host_private_key: Vec<u8>,
    /// Host's certificate in DER format
    pub host_certificate: CertificateDer<'static>,
    /// Root CA's certificate in DER format
    pub root_certificate: CertificateDer<'static>,
    /// System Build Unique Identifier
    pub system_buid: String,
    /// Host identifier
    pub host_id: String,
    /// Device's UDID, when the record carries one
    pub udid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairingFile {
    device_certificate: Data,
    host_private_key: Data,
    host_certificate: Data,
    root_certificate: Data,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(rename = "UDID")]
    udid: Option<String>,
}

impl PairingFile {
    /// Reads a pairing record from disk
    ///
    /// # Errors
    /// Returns `LocsimError` if the file can't be read or isn't a valid record
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, LocsimError> {
        let f = std::fs::read(path)?;
        Self::from_bytes(&f)
    }

    /// Parses a pairing record from plist bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LocsimError> {
        let raw: RawPairingFile = plist::from_bytes(bytes).map_err(|e| {
            warn!("Unable to parse pairing record: {e:?}");
            e
        })?;
        Ok(raw.try_into()?)
    }

    /// Parses a pairing record from an already decoded plist value
    pub fn from_value(v: &plist::Value) -> Result<Self, LocsimError> {
        let raw: RawPairingFile = plist::from_value(v)?;
        Ok(raw.try_into()?)
    }
}

impl TryFrom<RawPairingFile> for PairingFile {
    type Error = rustls::pki_types::pem::Error;

    fn try_from(value: RawPairingFile) -> Result<Self, Self::Error> {
        let pem = |d: Data| CertificateDer::from_pem_slice(&Vec::<u8>::from(d));
        Ok(Self {
            device_certificate: pem(value.device_certificate)?,
            host_private_key: value.host_private_key.into(),
            host_certificate: pem(value.host_certificate)?,
            root_certificate: pem(value.root_certificate)?,
            system_buid: value.system_buid,
            host_id: value.host_id,
            udid: value.udid,
        })
    }
}
