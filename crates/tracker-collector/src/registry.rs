use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Revoked,
}

struct Device {
    secret: Zeroizing<Vec<u8>>,
    device_type: String,
    device_name: String,
    status: DeviceStatus,
    registered_at: DateTime<Utc>,
    last_seen: Option<DateTime<Utc>>,
}

/// Public view of a device, without its secret.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub client_id: String,
    pub device_type: String,
    pub device_name: String,
    pub status: DeviceStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Devices known to this collector, keyed by client id. Registration is
/// trust on first use: the first accepted secret for an id is kept for good.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the id was already taken; the stored secret is
    /// never replaced.
    pub fn register(
        &self,
        client_id: &str,
        secret: Vec<u8>,
        device_type: &str,
        device_name: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let mut devices = self.devices.write();
        if devices.contains_key(client_id) {
            return false;
        }
        let device_name = if device_name.is_empty() {
            format!("Device {}", client_id.chars().take(8).collect::<String>())
        } else {
            device_name.to_string()
        };
        devices.insert(
            client_id.to_string(),
            Device {
                secret: Zeroizing::new(secret),
                device_type: if device_type.is_empty() {
                    "unknown".to_string()
                } else {
                    device_type.to_string()
                },
                device_name,
                status: DeviceStatus::Active,
                registered_at: now,
                last_seen: None,
            },
        );
        true
    }

    pub fn secret(&self, client_id: &str) -> Option<Zeroizing<Vec<u8>>> {
        self.devices
            .read()
            .get(client_id)
            .map(|d| Zeroizing::new(d.secret.to_vec()))
    }

    pub fn status(&self, client_id: &str) -> Option<DeviceStatus> {
        self.devices.read().get(client_id).map(|d| d.status)
    }

    pub fn revoke(&self, client_id: &str) -> bool {
        match self.devices.write().get_mut(client_id) {
            Some(device) => {
                device.status = DeviceStatus::Revoked;
                true
            }
            None => false,
        }
    }

    pub fn touch(&self, client_id: &str, now: DateTime<Utc>) {
        if let Some(device) = self.devices.write().get_mut(client_id) {
            device.last_seen = Some(now);
        }
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<DeviceSummary> {
        let mut out: Vec<DeviceSummary> = self
            .devices
            .read()
            .iter()
            .map(|(id, d)| DeviceSummary {
                client_id: id.clone(),
                device_type: d.device_type.clone(),
                device_name: d.device_name.clone(),
                status: d.status,
                registered_at: d.registered_at,
                last_seen: d.last_seen,
            })
            .collect();
        out.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        out
    }
}
