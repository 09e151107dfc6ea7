//! Identifying the device to talk to

/// How a device was reached by the multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Usb,
    Network,
}

/// Which transports a lookup may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupOptions {
    /// Accept devices attached over USB
    pub usb: bool,
    /// Accept devices paired over the network
    pub network: bool,
    /// When a device is reachable both ways, pick the network connection
    pub prefer_network: bool,
}

impl LookupOptions {
    pub const USB_ONLY: Self = Self {
        usb: true,
        network: false,
        prefer_network: false,
    };
    pub const NETWORK_ONLY: Self = Self {
        usb: false,
        network: true,
        prefer_network: true,
    };
    pub const ANY: Self = Self {
        usb: true,
        network: true,
        prefer_network: false,
    };

    /// Whether a device reached over `kind` is acceptable at all
    pub fn allows(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Usb => self.usb,
            TransportKind::Network => self.network,
        }
    }

    /// Picks the preferred entry among connections to the same device
    ///
    /// Returns `None` when no entry uses an allowed transport.
    pub fn select<T>(
        &self,
        candidates: impl IntoIterator<Item = (TransportKind, T)>,
    ) -> Option<T> {
        let preferred = if self.prefer_network {
            TransportKind::Network
        } else {
            TransportKind::Usb
        };

        let mut fallback = None;
        for (kind, candidate) in candidates {
            if !self.allows(kind) {
                continue;
            }
            if kind == preferred {
                return Some(candidate);
            }
            fallback.get_or_insert(candidate);
        }
        fallback
    }
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self::ANY
    }
}

/// An opaque reference to one physical device
///
/// Handles are supplied by the caller and never change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    udid: String,
    lookup: LookupOptions,
}

impl DeviceHandle {
    pub fn new(udid: impl Into<String>, lookup: LookupOptions) -> Self {
        Self {
            udid: udid.into(),
            lookup,
        }
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    pub fn lookup(&self) -> LookupOptions {
        self.lookup
    }
}

impl From<&str> for DeviceHandle {
    fn from(udid: &str) -> Self {
        Self::new(udid, LookupOptions::default())
    }
}
