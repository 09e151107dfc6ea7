//! A simulator host backed by `xcrun simctl`
//!
//! simctl has no push notifications, so device set changes are found by
//! polling `simctl list devices --json` and diffing consecutive listings.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::Output,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::{process::Command, sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use super::{
    BootState, DeviceSet, DeviceSetNotification, HostCapabilities, HostError, RegistrationId,
    SimDevice, SimulatorBridge, SimulatorDeviceRecord,
};
use crate::{LocsimError, geo::Coordinate};

/// How to run simctl
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimctlConfig {
    /// The `xcrun` executable
    pub xcrun: PathBuf,
    /// Xcode to use, forwarded as `DEVELOPER_DIR`
    pub developer_dir: Option<PathBuf>,
    /// How often the device set is listed while someone listens for changes
    pub poll_interval: Duration,
}

impl Default for SimctlConfig {
    fn default() -> Self {
        Self {
            xcrun: PathBuf::from("xcrun"),
            developer_dir: None,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl SimctlConfig {
    /// The default configuration, with `DEVELOPER_DIR` taken from the environment
    pub fn from_env() -> Self {
        Self {
            developer_dir: std::env::var_os("DEVELOPER_DIR").map(PathBuf::from),
            ..Self::default()
        }
    }
}

/// JSON output from `xcrun simctl list devices --json`
#[derive(Debug, Deserialize)]
struct SimctlOutput {
    devices: HashMap<String, Vec<SimctlEntry>>,
}

#[derive(Debug, Deserialize)]
struct SimctlEntry {
    udid: String,
    name: String,
    state: String,
    #[serde(rename = "isAvailable")]
    is_available: Option<bool>,
}

/// Maps a simctl state name to a boot state and whether it is settled
fn parse_state(state: &str) -> (BootState, bool) {
    match state {
        "Booted" => (BootState::Booted, true),
        "Shutdown" => (BootState::Shutdown, true),
        "Booting" => (BootState::Booting, false),
        "Shutting Down" => (BootState::Shutdown, false),
        _ => (BootState::Offline, false),
    }
}

/// "com.apple.CoreSimulator.SimRuntime.iOS-17-2" -> ("iOS", "17.2")
fn parse_runtime(identifier: &str) -> (String, String) {
    let suffix = identifier
        .strip_prefix("com.apple.CoreSimulator.SimRuntime.")
        .unwrap_or(identifier);
    match suffix.split_once('-') {
        Some((os, version)) => (os.to_string(), version.replace('-', ".")),
        None => (suffix.to_string(), String::new()),
    }
}

fn parse_listing(json: &[u8]) -> Result<Vec<SimulatorDeviceRecord>, LocsimError> {
    let parsed: SimctlOutput = serde_json::from_slice(json)?;

    let mut records = Vec::new();
    for (runtime, devices) in parsed.devices {
        let (product_name, product_version) = parse_runtime(&runtime);
        for device in devices {
            if device.is_available == Some(false) {
                continue;
            }
            let (boot_state, is_terminal_status) = parse_state(&device.state);
            records.push(SimulatorDeviceRecord {
                udid: device.udid,
                name: device.name,
                product_name: product_name.clone(),
                product_version: product_version.clone(),
                boot_state,
                is_terminal_status,
            });
        }
    }
    records.sort_by(|a, b| a.udid.cmp(&b.udid));
    Ok(records)
}

/// The mutations that turn listing `prev` into listing `next`
fn diff(
    prev: &[SimulatorDeviceRecord],
    next: &[SimulatorDeviceRecord],
) -> Vec<DeviceSetNotification> {
    let mut changes = Vec::new();
    for record in next {
        if !prev.contains(record) {
            changes.push(DeviceSetNotification::Changed(record.clone()));
        }
    }
    for record in prev {
        if !next.iter().any(|r| r.udid == record.udid) {
            changes.push(DeviceSetNotification::Removed(record.clone()));
        }
    }
    changes
}

#[derive(Debug)]
struct Simctl {
    config: SimctlConfig,
}

impl Simctl {
    async fn run(&self, args: &[&str]) -> std::io::Result<Output> {
        let mut command = Command::new(&self.config.xcrun);
        command.arg("simctl").args(args);
        if let Some(dir) = &self.config.developer_dir {
            command.env("DEVELOPER_DIR", dir);
        }
        debug!("Running simctl {}", args.join(" "));
        command.output().await
    }

    async fn list(&self) -> Result<Vec<SimulatorDeviceRecord>, LocsimError> {
        let output = self
            .run(&["list", "devices", "--json"])
            .await
            .map_err(|e| LocsimError::HostCommand(format!("failed to run xcrun simctl: {e}")))?;
        if !output.status.success() {
            return Err(LocsimError::HostCommand(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        parse_listing(&output.stdout)
    }

    /// Runs a command whose failure is the host's answer to a request
    async fn request(&self, args: &[&str]) -> Result<(), HostError> {
        let output = self.run(args).await.map_err(|e| HostError {
            domain: "xcrun".into(),
            code: e.raw_os_error().map_or(-1, i64::from),
            description: e.to_string(),
        })?;
        if output.status.success() {
            return Ok(());
        }
        Err(HostError {
            domain: "simctl".into(),
            code: output.status.code().map_or(-1, i64::from),
            description: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// A device in the simctl device set
#[derive(Debug)]
pub struct SimctlDevice {
    udid: String,
    simctl: Arc<Simctl>,
}

impl SimDevice for SimctlDevice {
    fn udid(&self) -> &str {
        &self.udid
    }

    fn record(&self) -> BoxFuture<'_, Result<SimulatorDeviceRecord, LocsimError>> {
        Box::pin(async move {
            self.simctl
                .list()
                .await?
                .into_iter()
                .find(|r| r.udid == self.udid)
                .ok_or(LocsimError::DeviceNotFound)
        })
    }

    fn detect_capabilities(&self) -> BoxFuture<'_, Result<HostCapabilities, LocsimError>> {
        Box::pin(async move {
            // `simctl location` shipped together with set and clear
            let output = self.simctl.run(&["help", "location"]).await.map_err(|e| {
                LocsimError::HostCommand(format!("failed to run xcrun simctl: {e}"))
            })?;
            let available = output.status.success();
            Ok(HostCapabilities {
                set_location: available,
                clear_location: available,
            })
        })
    }

    fn set_location(&self, coordinate: Coordinate) -> BoxFuture<'_, Result<(), HostError>> {
        Box::pin(async move {
            let coordinate = coordinate.to_string();
            self.simctl
                .request(&["location", self.udid.as_str(), "set", coordinate.as_str()])
                .await
        })
    }

    fn clear_location(&self) -> BoxFuture<'_, Result<(), HostError>> {
        Box::pin(async move {
            self.simctl
                .request(&["location", self.udid.as_str(), "clear"])
                .await
        })
    }

    fn lookup_port(
        &self,
        name: &str,
    ) -> BoxFuture<'_, Result<Arc<dyn SimulatorBridge>, HostError>> {
        let error = HostError {
            domain: "simctl".into(),
            code: -1,
            description: format!("port {name} is not reachable through simctl"),
        };
        Box::pin(async move { Err(error) })
    }
}

/// The device set simctl manages
#[derive(Debug)]
pub struct SimctlDeviceSet {
    simctl: Arc<Simctl>,
    pollers: Mutex<HashMap<RegistrationId, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl SimctlDeviceSet {
    pub fn new(config: SimctlConfig) -> Self {
        Self {
            simctl: Arc::new(Simctl { config }),
            pollers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// The map stays consistent across a panic, so a poisoned lock is still usable
    fn pollers(&self) -> MutexGuard<'_, HashMap<RegistrationId, JoinHandle<()>>> {
        self.pollers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn poll(
        simctl: Arc<Simctl>,
        mut listing: Vec<SimulatorDeviceRecord>,
        sink: mpsc::UnboundedSender<DeviceSetNotification>,
    ) {
        let mut interval = tokio::time::interval(simctl.config.poll_interval);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let next = match simctl.list().await {
                Ok(next) => next,
                Err(e) => {
                    warn!("Polling the simctl device set failed: {e}");
                    continue;
                }
            };
            for change in diff(&listing, &next) {
                if sink.send(change).is_err() {
                    debug!("Notification sink closed, stopping poller");
                    return;
                }
            }
            listing = next;
        }
    }
}

impl DeviceSet for SimctlDeviceSet {
    fn devices(&self) -> BoxFuture<'_, Result<Vec<Arc<dyn SimDevice>>, LocsimError>> {
        Box::pin(async move {
            Ok(self
                .simctl
                .list()
                .await?
                .into_iter()
                .map(|r| {
                    Arc::new(SimctlDevice {
                        udid: r.udid,
                        simctl: self.simctl.clone(),
                    }) as Arc<dyn SimDevice>
                })
                .collect())
        })
    }

    fn records(&self) -> BoxFuture<'_, Result<Vec<SimulatorDeviceRecord>, LocsimError>> {
        Box::pin(async move { self.simctl.list().await })
    }

    fn register_notifications(
        &self,
        sink: mpsc::UnboundedSender<DeviceSetNotification>,
    ) -> BoxFuture<'_, Result<RegistrationId, LocsimError>> {
        Box::pin(async move {
            let baseline = self.simctl.list().await?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let poller = tokio::spawn(Self::poll(self.simctl.clone(), baseline, sink));
            self.pollers().insert(id, poller);
            Ok(id)
        })
    }

    fn unregister_notifications(
        &self,
        id: RegistrationId,
    ) -> BoxFuture<'_, Result<bool, LocsimError>> {
        let poller = self.pollers().remove(&id);
        Box::pin(async move {
            match poller {
                Some(poller) => {
                    poller.abort();
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }
}

impl Drop for SimctlDeviceSet {
    fn drop(&mut self) {
        let pollers = self
            .pollers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, poller) in pollers.drain() {
            poller.abort();
        }
    }
}
