use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use time::OffsetDateTime;
use tracing::debug;

use crate::device::{Device, DeviceStatus};
use crate::events::{DeviceEvent, EventFabric, EventKind};

/// What an upsert did to the stored record.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UpsertOutcome {
    Discovered,
    StatusChanged,
    Unchanged,
}

/// Canonical in-memory device store.
///
/// All mutation happens under one writer lock; readers get snapshots.
/// Events are published only after the store is updated, so a subscriber
/// that reacts to an event and reads back sees at least the new state.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    events: Arc<EventFabric>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new(events: Arc<EventFabric>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Returns a snapshot of every known device.
    #[must_use]
    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices
            .read()
            .expect("registry lock poisoned")
            .get(device_id)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.read().expect("registry lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or refreshes a device record, emitting `discovered` or
    /// `status_changed` as appropriate. Called only by the discovery engine
    /// and the network connection manager.
    pub fn upsert(&self, mut incoming: Device) -> UpsertOutcome {
        incoming.last_seen = OffsetDateTime::now_utc();

        let (outcome, event) = {
            let mut devices = self.devices.write().expect("registry lock poisoned");
            match devices.get(&incoming.id) {
                None => {
                    let event =
                        DeviceEvent::new(EventKind::Discovered, &incoming.id, incoming.kind)
                            .with_data(serde_json::json!({
                                "name": incoming.name,
                                "status": incoming.status,
                            }));
                    devices.insert(incoming.id.clone(), incoming);
                    (UpsertOutcome::Discovered, Some(event))
                }
                Some(stored) => {
                    let mut merged = incoming;
                    // A sweep record knows nothing about live handles; keep
                    // the stored connection state unless the caller set it.
                    if stored.is_connected && !merged.is_connected {
                        merged.is_connected = true;
                        merged.status = stored.status;
                    }
                    for (key, value) in &stored.properties {
                        merged
                            .properties
                            .entry(key.clone())
                            .or_insert_with(|| value.clone());
                    }

                    let changed = stored.status != merged.status
                        || stored.is_connected != merged.is_connected;
                    let event = changed.then(|| {
                        DeviceEvent::new(EventKind::StatusChanged, &merged.id, merged.kind)
                            .with_data(serde_json::json!({
                                "status": merged.status,
                                "is_connected": merged.is_connected,
                            }))
                    });
                    let outcome = if changed {
                        UpsertOutcome::StatusChanged
                    } else {
                        UpsertOutcome::Unchanged
                    };
                    devices.insert(merged.id.clone(), merged);
                    (outcome, event)
                }
            }
        };

        if let Some(event) = event {
            self.events.publish(event);
        }
        outcome
    }

    /// Flips the connection state of a stored device, emitting
    /// `status_changed` when it actually changed.
    pub fn set_connected(&self, device_id: &str, connected: bool) -> bool {
        let event = {
            let mut devices = self.devices.write().expect("registry lock poisoned");
            let Some(device) = devices.get_mut(device_id) else {
                return false;
            };
            let new_status = if connected {
                DeviceStatus::Connected
            } else {
                DeviceStatus::Available
            };
            if device.is_connected == connected && device.status == new_status {
                None
            } else {
                device.is_connected = connected;
                device.status = new_status;
                device.last_seen = OffsetDateTime::now_utc();
                Some(
                    DeviceEvent::new(EventKind::StatusChanged, device_id, device.kind).with_data(
                        serde_json::json!({
                            "status": device.status,
                            "is_connected": connected,
                        }),
                    ),
                )
            }
        };

        if let Some(event) = event {
            self.events.publish(event);
        }
        true
    }

    /// Removes a device, emitting `removed` when it existed.
    pub fn remove(&self, device_id: &str) -> bool {
        let removed = self
            .devices
            .write()
            .expect("registry lock poisoned")
            .remove(device_id);
        match removed {
            Some(device) => {
                debug!(device_id, "device removed from registry");
                self.events
                    .publish(DeviceEvent::new(EventKind::Removed, device_id, device.kind));
                true
            }
            None => false,
        }
    }
}
