//! TLS for lockdown and service connections
//!
//! Devices serve self-issued certificates that no root store will ever vouch for,
//! so the server side is accepted as is. The host side authenticates with the
//! certificate from its pairing record.

use std::sync::Arc;

use rustls::{
    ClientConfig, DigitallySignedStruct,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};
use tracing::{debug, warn};

use crate::{LocsimError, pairing_file::PairingFile};

/// Accepts whatever certificate the device presents
#[derive(Debug)]
struct AcceptDeviceCertificate;

impl ServerCertVerifier for AcceptDeviceCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        // Older firmware still signs with SHA1
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ED448,
        ]
    }
}

/// Installs the crypto provider selected by cargo features, once per process
pub(crate) fn ensure_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }

    #[cfg(feature = "aws-lc")]
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    #[cfg(all(feature = "ring", not(feature = "aws-lc")))]
    let provider = rustls::crypto::ring::default_provider();

    #[cfg(any(feature = "aws-lc", feature = "ring"))]
    if provider.install_default().is_err() {
        // Another thread won the race; its provider is just as good
        warn!("A rustls crypto provider was installed concurrently");
    }
}

/// Builds a client config that authenticates with the pairing record's host credentials
///
/// # Errors
/// Returns `LocsimError` if the host key can't be parsed or doesn't match the certificate
pub(crate) fn create_client_config(
    pairing_file: &PairingFile,
) -> Result<ClientConfig, LocsimError> {
    let private_key = PrivateKeyDer::from_pem_slice(&pairing_file.host_private_key)?;
    debug!("Loaded host certificate and private key");

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptDeviceCertificate))
        .with_client_auth_cert(vec![pairing_file.host_certificate.clone()], private_key)?;

    // Lockdown drops resumed sessions
    config.resumption = rustls::client::Resumption::disabled();

    Ok(config)
}
