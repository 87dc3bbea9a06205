// Device catalog. The ingestion path only reads it; the HTTP handlers and
// startup seeding write to it.
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
}

/// A device together with the connection identifier it publishes under.
/// This is also the on-disk shape of the seed file and the `PUT /devices` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub connection_id: String,
    #[serde(flatten)]
    pub device: Device,
}

/// Resolves a connection identifier to a device.
///
/// Implementations must tolerate concurrent calls; lookups happen on the
/// reception path and must not block.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceRegistry: Send + Sync {
    fn lookup(&self, connection_id: &str) -> Option<Device>;
}

#[derive(Debug, Default)]
pub struct InMemoryDeviceRegistry {
    devices: DashMap<String, Device>,
}

impl InMemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_registrations(registrations: impl IntoIterator<Item = DeviceRegistration>) -> Self {
        let registry = Self::new();
        for r in registrations {
            registry.register(r.connection_id, r.device);
        }
        registry
    }

    /// Insert or replace. Returns the previous device for that connection id.
    pub fn register(&self, connection_id: impl Into<String>, device: Device) -> Option<Device> {
        self.devices.insert(connection_id.into(), device)
    }

    pub fn remove(&self, connection_id: &str) -> Option<Device> {
        self.devices.remove(connection_id).map(|(_, d)| d)
    }

    pub fn list(&self) -> Vec<DeviceRegistration> {
        let mut all: Vec<DeviceRegistration> = self
            .devices
            .iter()
            .map(|entry| DeviceRegistration {
                connection_id: entry.key().clone(),
                device: entry.value().clone(),
            })
            .collect();
        all.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        all
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceRegistry for InMemoryDeviceRegistry {
    fn lookup(&self, connection_id: &str) -> Option<Device> {
        self.devices.get(connection_id).map(|d| d.value().clone())
    }
}

/// Load the seed catalog. A missing file is an empty catalog, a malformed
/// one is an error.
pub async fn load_devices(path: &str) -> anyhow::Result<Vec<DeviceRegistration>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let devices: Vec<DeviceRegistration> = serde_json::from_slice(&bytes)
                .map_err(|e| anyhow::anyhow!("invalid device file {}: {}", path, e))?;
            info!(path = %path, count = devices.len(), "loaded device catalog");
            Ok(devices)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path, "device file not found, starting with an empty catalog");
            Ok(Vec::new())
        }
        Err(e) => Err(anyhow::anyhow!("failed to read device file {}: {}", path, e)),
    }
}
