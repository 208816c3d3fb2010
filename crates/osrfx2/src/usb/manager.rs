//! USB device manager
//!
//! Matches boards on the bus against the configured VID:PID filters and
//! drives the [`LifecycleController`]: attach on arrival (initial
//! enumeration or hot-plug), detach on removal. A board that fails to
//! attach is not retried until it leaves the bus. Runs on the USB worker
//! thread.

use crate::usb::device::{UsbDevice, device_ids};
use crate::usb::lifecycle::LifecycleController;
use common::{DeviceId, DeviceSummary, DriverEvent};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Hot-plug notification forwarded from the libusb callback
pub enum HotplugEvent {
    Arrived(Device<Context>),
    Left { bus: u8, address: u8 },
}

/// Bus position: (bus number, device address)
type BusKey = (u8, u8);

/// What the manager knows about each bus position it has probed
#[derive(Debug, Default)]
struct BusTracker {
    attached: HashMap<BusKey, DeviceId>,
    /// Matched the filters but failed to attach; skipped until they leave
    failed: HashSet<BusKey>,
}

impl BusTracker {
    fn needs_probe(&self, key: BusKey) -> bool {
        !self.attached.contains_key(&key) && !self.failed.contains(&key)
    }

    fn record_attached(&mut self, key: BusKey, id: DeviceId) {
        self.failed.remove(&key);
        self.attached.insert(key, id);
    }

    fn record_failed(&mut self, key: BusKey) {
        self.failed.insert(key);
    }

    /// Forget `key`; returns the board attached there, if any
    fn left(&mut self, key: BusKey) -> Option<DeviceId> {
        self.failed.remove(&key);
        self.attached.remove(&key)
    }

    /// Known positions no longer in `present`
    fn gone(&self, present: &HashSet<BusKey>) -> Vec<BusKey> {
        self.attached
            .keys()
            .chain(self.failed.iter())
            .filter(|key| !present.contains(key))
            .copied()
            .collect()
    }

    fn drain_attached(&mut self) -> Vec<DeviceId> {
        self.failed.clear();
        self.attached.drain().map(|(_, id)| id).collect()
    }

    fn attached_count(&self) -> usize {
        self.attached.len()
    }
}

pub struct DeviceManager {
    context: Context,
    controller: LifecycleController,
    bus: BusTracker,
    filters: Vec<String>,
    hotplug_tx: async_channel::Sender<HotplugEvent>,
    hotplug_rx: async_channel::Receiver<HotplugEvent>,
    _hotplug_registration: Option<Registration<Context>>,
    event_sender: async_channel::Sender<DriverEvent>,
}

impl DeviceManager {
    pub fn new(
        controller: LifecycleController,
        event_sender: async_channel::Sender<DriverEvent>,
        filters: Vec<String>,
    ) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let (hotplug_tx, hotplug_rx) = async_channel::unbounded();

        Ok(Self {
            context,
            controller,
            bus: BusTracker::default(),
            filters,
            hotplug_tx,
            hotplug_rx,
            _hotplug_registration: None,
            event_sender,
        })
    }

    /// Attach boards already present and register for hot-plug
    pub fn initialize(&mut self) -> Result<(), rusb::Error> {
        self.rescan()?;

        if rusb::has_hotplug() {
            self.register_hotplug()?;
        } else {
            warn!("libusb has no hot-plug support, falling back to periodic rescans");
        }

        info!(
            "Device manager initialized with {} board(s)",
            self.bus.attached_count()
        );
        Ok(())
    }

    pub fn has_hotplug(&self) -> bool {
        self._hotplug_registration.is_some()
    }

    fn register_hotplug(&mut self) -> Result<(), rusb::Error> {
        let callback = HotplugCallback {
            sender: self.hotplug_tx.clone(),
        };

        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(callback))?;

        self._hotplug_registration = Some(registration);
        debug!("Hot-plug callbacks registered");
        Ok(())
    }

    /// Reconcile attached boards with what is on the bus
    pub fn rescan(&mut self) -> Result<(), rusb::Error> {
        let devices = self.context.devices()?;
        let mut present = HashSet::new();

        for device in devices.iter() {
            let key = (device.bus_number(), device.address());
            present.insert(key);
            if self.bus.needs_probe(key) {
                self.handle_device_arrived(device);
            }
        }

        for (bus, address) in self.bus.gone(&present) {
            self.handle_device_left(bus, address);
        }

        Ok(())
    }

    /// Drain notifications queued by the hot-plug callback
    pub fn process_hotplug_events(&mut self) {
        while let Ok(event) = self.hotplug_rx.try_recv() {
            match event {
                HotplugEvent::Arrived(device) => self.handle_device_arrived(device),
                HotplugEvent::Left { bus, address } => self.handle_device_left(bus, address),
            }
        }
    }

    /// Probe a board that appeared on the bus
    pub fn handle_device_arrived(&mut self, device: Device<Context>) {
        let key = (device.bus_number(), device.address());
        if !self.bus.needs_probe(key) {
            return;
        }

        let (vid, pid) = match device_ids(&device) {
            Ok(ids) => ids,
            Err(e) => {
                debug!(
                    "Skipping device on bus {:03} address {:03}: {}",
                    key.0, key.1, e
                );
                return;
            }
        };
        if !Self::check_filter(vid, pid, &self.filters) {
            debug!(
                "Device ignored by filter: bus={}, addr={}, vid={:#06x}, pid={:#06x}",
                key.0, key.1, vid, pid
            );
            return;
        }

        let usb_device = match UsbDevice::open(device) {
            Ok(usb_device) => usb_device,
            Err(e) => {
                self.attach_failed(key, e.to_string());
                return;
            }
        };
        if let Some(product) = usb_device.product() {
            debug!("Probing {} on bus {:03} address {:03}", product, key.0, key.1);
        }

        match self.controller.attach(Arc::new(usb_device)) {
            Ok(id) => {
                self.bus.record_attached(key, id);
                if let Some(context) = self.controller.find(id) {
                    self.send_event(DriverEvent::DeviceAttached {
                        id,
                        node_name: context.node_name().to_string(),
                        switches: context.subscribe(),
                    });
                }
            }
            Err(e) => self.attach_failed(key, e.to_string()),
        }
    }

    /// Retire the board that was at (bus, address), if we attached one
    pub fn handle_device_left(&mut self, bus: u8, address: u8) {
        let Some(id) = self.bus.left((bus, address)) else {
            return;
        };

        match self.controller.detach(id) {
            Ok(()) => self.send_event(DriverEvent::DeviceDetached { id }),
            Err(e) => warn!("Detach of device {} failed: {}", id, e),
        }
    }

    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        self.controller.devices()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Detach every attached board
    pub fn shutdown(&mut self) {
        for id in self.bus.drain_attached() {
            match self.controller.detach(id) {
                Ok(()) => self.send_event(DriverEvent::DeviceDetached { id }),
                Err(e) => debug!("Device {} already gone at shutdown: {}", id, e),
            }
        }
    }

    fn attach_failed(&mut self, key: BusKey, reason: String) {
        self.bus.record_failed(key);
        let (bus_number, device_address) = key;
        warn!(
            "Failed to attach board on bus {:03} address {:03}: {}",
            bus_number, device_address, reason
        );
        self.send_event(DriverEvent::AttachFailed {
            bus_number,
            device_address,
            reason,
        });
    }

    fn send_event(&self, event: DriverEvent) {
        if let Err(e) = self.event_sender.try_send(event) {
            error!("Failed to send driver event: {}", e);
        }
    }

    /// Check if a VID/PID pair is allowed by the filters
    ///
    /// Filter format is "0xVID:0xPID" with `*` as a wildcard on either side;
    /// an empty filter list allows everything.
    pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
        if filters.is_empty() {
            return true;
        }

        filters.iter().any(|filter| {
            let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
                return false;
            };
            matches_id(filter_vid, vid) && matches_id(filter_pid, pid)
        })
    }
}

fn matches_id(pattern: &str, id: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let hex = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(hex, 16).is_ok_and(|v| v == id)
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Forwards libusb hot-plug notifications to the worker loop
///
/// The callback runs inside `handle_events`, so it only queues.
struct HotplugCallback {
    sender: async_channel::Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.sender.try_send(HotplugEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.sender.try_send(HotplugEvent::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec![
            "0x0547:0x1002".to_string(), // Exact match
            "0xABCD:*".to_string(),      // Wildcard PID
        ];

        assert!(DeviceManager::check_filter(0x0547, 0x1002, &filters));
        assert!(DeviceManager::check_filter(0xABCD, 0x1111, &filters));
        assert!(DeviceManager::check_filter(0xABCD, 0x9999, &filters));

        assert!(!DeviceManager::check_filter(0x0547, 0x9999, &filters)); // Wrong PID
        assert!(!DeviceManager::check_filter(0x9999, 0x1002, &filters)); // Wrong VID
        assert!(!DeviceManager::check_filter(0x0000, 0x0000, &filters));

        // Empty filters = allow all
        assert!(DeviceManager::check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_filter_ignores_malformed_entries() {
        let filters = vec!["garbage".to_string(), "*:0x1002".to_string()];
        assert!(DeviceManager::check_filter(0x0547, 0x1002, &filters));
        assert!(!DeviceManager::check_filter(0x0547, 0x1003, &filters));
    }

    #[test]
    fn test_failed_board_skipped_until_it_leaves() {
        let mut bus = BusTracker::default();
        let key = (1, 4);
        assert!(bus.needs_probe(key));

        bus.record_failed(key);
        // Every later rescan with the board still present skips it
        let present: HashSet<BusKey> = [key].into_iter().collect();
        assert!(!bus.needs_probe(key));
        assert!(bus.gone(&present).is_empty());

        // Unplugged: forgotten, and probed again when it comes back
        assert_eq!(bus.gone(&HashSet::new()), vec![key]);
        assert_eq!(bus.left(key), None);
        assert!(bus.needs_probe(key));
    }

    #[test]
    fn test_bus_tracker_attach_and_leave() {
        let mut bus = BusTracker::default();
        bus.record_failed((1, 4));
        bus.record_attached((1, 4), DeviceId(192));
        bus.record_attached((2, 9), DeviceId(193));
        assert!(!bus.needs_probe((1, 4)));
        assert_eq!(bus.attached_count(), 2);

        let present: HashSet<BusKey> = [(2, 9)].into_iter().collect();
        assert_eq!(bus.gone(&present), vec![(1, 4)]);
        assert_eq!(bus.left((1, 4)), Some(DeviceId(192)));

        assert_eq!(bus.drain_attached(), vec![DeviceId(193)]);
        assert_eq!(bus.attached_count(), 0);
    }
}
