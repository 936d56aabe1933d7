use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::envelope::IdAssignment;
use crate::types::DeviceId;

/// A registered peer.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub device_id: DeviceId,
    pub app_name: String,
    pub assigned_port: u16,
    pub last_heartbeat: Instant,
}

/// Outcome of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub device_id: DeviceId,
    pub assignment: IdAssignment,
}

/// Connected peers and their heartbeat freshness.
///
/// Entries are never removed; a peer whose heartbeat is older than the
/// staleness window is simply not counted as active.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DeviceEntry>,
    staleness_window: Duration,
}

impl DeviceRegistry {
    pub fn new(staleness_window: Duration) -> Self {
        Self {
            devices: HashMap::new(),
            staleness_window,
        }
    }

    /// Pick the id a peer claiming `claimed_id` will be registered under.
    ///
    /// A free claim is kept. A taken one is replaced by
    /// `app_name|claimed_id(n)` with the smallest free `n >= 1`, which is
    /// reproducible from the same inputs and registry contents.
    pub fn assign_id(&self, app_name: &str, claimed_id: &str) -> Registration {
        let claimed = DeviceId::new(claimed_id);
        if !self.devices.contains_key(&claimed) {
            return Registration {
                device_id: claimed,
                assignment: IdAssignment::Original,
            };
        }
        let mut index = 1u32;
        loop {
            let candidate = DeviceId::new(format!("{app_name}|{claimed_id}({index})"));
            if !self.devices.contains_key(&candidate) {
                return Registration {
                    device_id: candidate,
                    assignment: IdAssignment::Alternate,
                };
            }
            index += 1;
        }
    }

    /// Register a peer on its assigned request port.
    pub fn register(&mut self, app_name: &str, claimed_id: &str, port: u16) -> Registration {
        let registration = self.assign_id(app_name, claimed_id);
        self.devices.insert(
            registration.device_id.clone(),
            DeviceEntry {
                device_id: registration.device_id.clone(),
                app_name: app_name.to_string(),
                assigned_port: port,
                last_heartbeat: Instant::now(),
            },
        );
        tracing::info!(
            device_id = %registration.device_id,
            app_name,
            port,
            "device registered"
        );
        registration
    }

    /// Refresh a peer's heartbeat. Unknown ids are ignored.
    pub fn heartbeat(&mut self, device_id: &DeviceId) {
        match self.devices.get_mut(device_id) {
            Some(entry) => entry.last_heartbeat = Instant::now(),
            None => tracing::debug!(device_id = %device_id, "heartbeat from unknown device"),
        }
    }

    /// Number of peers whose heartbeat is within the staleness window.
    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        self.devices
            .values()
            .filter(|d| now.duration_since(d.last_heartbeat) < self.staleness_window)
            .count()
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&DeviceEntry> {
        self.devices.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
