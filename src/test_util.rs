//! In-memory stand-ins for devices

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::{
    LocsimError, ServiceConnection,
    pairing_file::PairingFile,
    provider::{DeviceProvider, ProviderFuture},
};

pub(crate) fn dict<const N: usize>(pairs: [(&str, plist::Value); N]) -> plist::Dictionary {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// The device end of an in-memory connection
pub(crate) struct FakePeer {
    stream: DuplexStream,
}

impl FakePeer {
    pub(crate) async fn read_request(&mut self) -> plist::Dictionary {
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).await.unwrap();
        let mut buf = vec![0; u32::from_be_bytes(len) as usize];
        self.stream.read_exact(&mut buf).await.unwrap();
        plist::from_bytes(&buf).unwrap()
    }

    /// Reads a request and checks its `Request` (lockdown) or `Command` (services) key
    pub(crate) async fn expect(&mut self, request: &str) -> plist::Dictionary {
        let req = self.read_request().await;
        let name = req
            .get("Request")
            .or_else(|| req.get("Command"))
            .and_then(|v| v.as_string());
        assert_eq!(name, Some(request), "unexpected request {req:?}");
        req
    }

    pub(crate) async fn reply(&mut self, res: plist::Dictionary) {
        self.reply_value(plist::Value::Dictionary(res)).await
    }

    pub(crate) async fn reply_value(&mut self, value: plist::Value) {
        let mut buf = Vec::new();
        value.to_writer_xml(&mut buf).unwrap();
        self.stream
            .write_all(&(buf.len() as u32).to_be_bytes())
            .await
            .unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    pub(crate) async fn read_raw(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    /// Reads until the client closes its end
    pub(crate) async fn read_to_end(&mut self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    /// Answers `QueryType` and a `StartSession` that doesn't ask for TLS
    pub(crate) async fn accept_session(&mut self) {
        self.expect("QueryType").await;
        self.reply(dict([("Type", "com.apple.mobile.lockdown".into())]))
            .await;

        let req = self.expect("StartSession").await;
        assert_eq!(
            req.get("HostID").and_then(|v| v.as_string()),
            Some("HOST-ID")
        );
        self.reply(dict([
            ("SessionID", "SESSION".into()),
            ("EnableSessionSSL", false.into()),
        ]))
        .await;
    }

    /// Answers a `StartService` for `service` with `port`
    pub(crate) async fn accept_service(&mut self, service: &str, port: u16) {
        let req = self.expect("StartService").await;
        assert_eq!(req.get("Service").and_then(|v| v.as_string()), Some(service));
        self.reply(dict([
            ("Service", service.into()),
            ("Port", u64::from(port).into()),
        ]))
        .await;
    }
}

pub(crate) fn pipe() -> (ServiceConnection, FakePeer) {
    let (client, device) = tokio::io::duplex(1024 * 1024);
    (
        ServiceConnection::new(Box::new(client), "locsim-test"),
        FakePeer { stream: device },
    )
}

pub(crate) fn dummy_pairing_file() -> PairingFile {
    PairingFile {
        device_certificate: CertificateDer::from(Vec::new()),
        host_private_key: Vec::new(),
        host_certificate: CertificateDer::from(Vec::new()),
        root_certificate: CertificateDer::from(Vec::new()),
        system_buid: "BUID".into(),
        host_id: "HOST-ID".into(),
        udid: Some("00008030-TEST".into()),
    }
}

/// A provider whose connections are handed out in order from a prepared queue
#[derive(Debug)]
pub(crate) struct ScriptedProvider {
    connections: Mutex<VecDeque<ServiceConnection>>,
    ports: Mutex<Vec<u16>>,
    pairing_file: Option<PairingFile>,
    /// How `connect` fails once the queue is empty
    exhausted: std::io::ErrorKind,
}

impl ScriptedProvider {
    /// A provider backed by `count` connections, and the device ends of each
    pub(crate) fn with_peers(count: usize) -> (Arc<Self>, Vec<FakePeer>) {
        Self::build(count, Some(dummy_pairing_file()))
    }

    pub(crate) fn without_pairing_record(count: usize) -> (Arc<Self>, Vec<FakePeer>) {
        Self::build(count, None)
    }

    /// A provider whose every connection fails with `kind`
    pub(crate) fn failing(kind: std::io::ErrorKind) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(VecDeque::new()),
            ports: Mutex::new(Vec::new()),
            pairing_file: Some(dummy_pairing_file()),
            exhausted: kind,
        })
    }

    fn build(count: usize, pairing_file: Option<PairingFile>) -> (Arc<Self>, Vec<FakePeer>) {
        let (connections, peers): (VecDeque<_>, Vec<_>) = (0..count).map(|_| pipe()).unzip();
        let provider = Self {
            connections: Mutex::new(connections),
            ports: Mutex::new(Vec::new()),
            pairing_file,
            exhausted: std::io::ErrorKind::ConnectionRefused,
        };
        (Arc::new(provider), peers)
    }

    /// Ports connected to so far
    pub(crate) fn ports(&self) -> Vec<u16> {
        self.ports.lock().unwrap().clone()
    }
}

impl DeviceProvider for ScriptedProvider {
    fn connect(&self, port: u16) -> ProviderFuture<ServiceConnection> {
        self.ports.lock().unwrap().push(port);
        let next = self.connections.lock().unwrap().pop_front();
        let exhausted = self.exhausted;
        Box::pin(async move {
            next.ok_or_else(|| LocsimError::Socket(std::io::Error::from(exhausted)))
        })
    }

    fn label(&self) -> &str {
        "locsim-test"
    }

    fn get_pairing_file(&self) -> ProviderFuture<PairingFile> {
        let pairing_file = self.pairing_file.clone();
        Box::pin(async move {
            pairing_file.ok_or_else(|| {
                LocsimError::HandshakeFailed("no pairing record".into())
            })
        })
    }
}
