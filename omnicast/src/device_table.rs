use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::Utc;
use tracing::{debug, info};

use crate::events::EventBus;
use crate::model::{Device, DeviceEvent, DeviceId, MediaStatus};

/// Authoritative table of currently known devices.
///
/// Mutations are serialized by a dedicated lock that also spans the event
/// publish, so the event order on the bus always matches the table's
/// mutation order. Reads take only the inner `RwLock` and never wait on a
/// publish in progress.
pub struct DeviceTable {
    devices: RwLock<HashMap<DeviceId, Device>>,
    mutation: Mutex<()>,
    bus: EventBus,
}

impl DeviceTable {
    pub fn new(bus: EventBus) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            mutation: Mutex::new(()),
            bus,
        }
    }

    /// Inserts or replaces a device and publishes `Added` or `Updated`.
    ///
    /// A re-registration with identical fields still publishes `Updated`
    /// (with an empty change list), so adapters may re-announce devices
    /// without tracking what the table already holds.
    pub fn upsert(&self, device: Device) -> DeviceEvent {
        let _guard = self.mutation.lock().unwrap();
        let previous = {
            let mut devices = self.devices.write().unwrap();
            devices.insert(device.id.clone(), device.clone())
        };
        let event = match previous {
            None => {
                info!(device = %device.id, name = %device.name, transport = %device.transport, "Device added");
                DeviceEvent::Added {
                    device,
                    at: Utc::now(),
                }
            }
            Some(old) => {
                let changed = old.changed_fields(&device);
                debug!(device = %device.id, changed = ?changed, "Device updated");
                DeviceEvent::Updated {
                    device,
                    changed,
                    at: Utc::now(),
                }
            }
        };
        self.bus.publish(event.clone());
        event
    }

    /// Removes a device and publishes `Removed`. Returns `None` when the
    /// device was not in the table (nothing is published then).
    pub fn remove(&self, id: &DeviceId, reason: Option<String>) -> Option<DeviceEvent> {
        let _guard = self.mutation.lock().unwrap();
        let removed = {
            let mut devices = self.devices.write().unwrap();
            devices.remove(id)
        };
        removed.map(|_| {
            info!(device = %id, reason = reason.as_deref().unwrap_or("unspecified"), "Device removed");
            let event = DeviceEvent::Removed {
                id: id.clone(),
                reason,
                at: Utc::now(),
            };
            self.bus.publish(event.clone());
            event
        })
    }

    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        self.devices.read().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.read().unwrap().contains_key(id)
    }

    /// Point-in-time snapshot of all devices.
    pub fn list(&self) -> Vec<Device> {
        self.devices.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().unwrap().is_empty()
    }

    /// Ids of every device owned by the given transport.
    pub fn ids_for_transport(&self, transport: &str) -> Vec<DeviceId> {
        self.devices
            .read()
            .unwrap()
            .values()
            .filter(|d| d.transport == transport)
            .map(|d| d.id.clone())
            .collect()
    }

    /// Publishes a playback status update for a known device. Updates for
    /// removed devices are silently discarded.
    pub fn publish_status(&self, id: &DeviceId, status: MediaStatus) {
        let _guard = self.mutation.lock().unwrap();
        if !self.contains(id) {
            debug!(device = %id, "Dropping status update for unknown device");
            return;
        }
        self.bus.publish(DeviceEvent::MediaStatusUpdated {
            id: id.clone(),
            status,
            at: Utc::now(),
        });
    }

    /// Publishes a volume update for a known device.
    pub fn publish_volume(&self, id: &DeviceId, level: f32, muted: bool) {
        let _guard = self.mutation.lock().unwrap();
        if !self.contains(id) {
            debug!(device = %id, "Dropping volume update for unknown device");
            return;
        }
        self.bus.publish(DeviceEvent::VolumeUpdated {
            id: id.clone(),
            level,
            muted,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventBusConfig;
    use crate::model::PlaybackState;
    use std::sync::Arc;

    fn table_with_bus() -> (Arc<DeviceTable>, crate::events::Subscription, crossbeam_channel::Receiver<DeviceEvent>) {
        let bus = EventBus::new(EventBusConfig::default());
        let (sub, rx) = bus.subscribe_queue();
        (Arc::new(DeviceTable::new(bus)), sub, rx)
    }

    #[test]
    fn upsert_then_remove_publishes_in_order() {
        let (table, _sub, rx) = table_with_bus();

        table.upsert(Device::new("uuid:1", "Living Room", "dlna"));
        table.upsert(Device::new("uuid:1", "Kitchen", "dlna"));
        table.remove(&DeviceId::new("uuid:1"), Some("lost".to_string()));

        assert!(matches!(rx.try_recv().unwrap(), DeviceEvent::Added { .. }));
        match rx.try_recv().unwrap() {
            DeviceEvent::Updated { device, changed, .. } => {
                assert_eq!(device.name, "Kitchen");
                assert_eq!(changed, vec!["name".to_string()]);
            }
            other => panic!("expected Updated, got {other:?}"),
        }
        match rx.try_recv().unwrap() {
            DeviceEvent::Removed { id, reason, .. } => {
                assert_eq!(id.as_str(), "uuid:1");
                assert_eq!(reason.as_deref(), Some("lost"));
            }
            other => panic!("expected Removed, got {other:?}"),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn identical_upsert_still_publishes_updated() {
        let (table, _sub, rx) = table_with_bus();
        let device = Device::new("uuid:1", "Living Room", "dlna");

        table.upsert(device.clone());
        table.upsert(device);

        let _ = rx.try_recv().unwrap();
        match rx.try_recv().unwrap() {
            DeviceEvent::Updated { changed, .. } => assert!(changed.is_empty()),
            other => panic!("expected Updated, got {other:?}"),
        }
    }

    #[test]
    fn remove_unknown_is_silent() {
        let (table, _sub, rx) = table_with_bus();
        assert!(table.remove(&DeviceId::new("uuid:ghost"), None).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn status_for_removed_device_is_discarded() {
        let (table, _sub, rx) = table_with_bus();
        let id = DeviceId::new("uuid:1");

        table.upsert(Device::new("uuid:1", "Living Room", "dlna"));
        table.remove(&id, None);
        table.publish_status(&id, MediaStatus::new(PlaybackState::Playing));

        let _ = rx.try_recv().unwrap();
        let _ = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn concurrent_mutations_keep_event_order_consistent() {
        let (table, _sub, rx) = table_with_bus();
        let threads: Vec<_> = (0..4)
            .map(|n| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        table.upsert(Device::new(
                            format!("uuid:{n}-{i}"),
                            "Device",
                            "mock",
                        ));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        // Every mutation produced exactly one event, and each device's Added
        // precedes any later event for it.
        let mut seen = std::collections::HashSet::new();
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            count += 1;
            match event {
                DeviceEvent::Added { device, .. } => {
                    assert!(seen.insert(device.id));
                }
                other => panic!("expected only Added events, got {other:?}"),
            }
        }
        assert_eq!(count, 100);
        assert_eq!(table.len(), 100);
    }
}
