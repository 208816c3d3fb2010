//! Attach/detach lifecycle
//!
//! [`LifecycleController`] creates, publishes and retires device contexts.
//! Published contexts live in a [`DeviceRegistry`], an explicit object owned
//! by the controller rather than process-wide state, so each test (or each
//! daemon run) gets its own.

use crate::config::TransferSettings;
use crate::usb::backend::UsbBackend;
use crate::usb::channel::lock;
use crate::usb::context::DeviceContext;
use crate::usb::session::Session;
use common::{AccessMode, DeviceId, DeviceSummary, Error, Result, SwitchState};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// Device node name prefix (`osrfx2_0`, `osrfx2_1`, ...)
pub const NODE_PREFIX: &str = "osrfx2_";

enum Slot {
    /// Id handed out to an attach still in progress
    Reserved,
    Published(Arc<DeviceContext>),
}

/// Table of attached boards, keyed by minor number
pub struct DeviceRegistry {
    minor_base: u32,
    max_devices: u32,
    slots: Mutex<BTreeMap<DeviceId, Slot>>,
}

impl DeviceRegistry {
    pub fn new(minor_base: u32, max_devices: u32) -> Self {
        Self {
            minor_base,
            max_devices,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reserve the lowest free minor number
    pub fn reserve(&self) -> Result<DeviceId> {
        let mut slots = lock(&self.slots);
        let id = (self.minor_base..self.minor_base.saturating_add(self.max_devices))
            .map(DeviceId)
            .find(|id| !slots.contains_key(id))
            .ok_or_else(|| {
                Error::ResourceExhausted(format!("all {} minor numbers in use", self.max_devices))
            })?;
        slots.insert(id, Slot::Reserved);
        Ok(id)
    }

    /// Drop a reservation whose attach failed
    pub fn release(&self, id: DeviceId) {
        let mut slots = lock(&self.slots);
        if matches!(slots.get(&id), Some(Slot::Reserved)) {
            slots.remove(&id);
        }
    }

    pub fn publish(&self, id: DeviceId, context: Arc<DeviceContext>) {
        lock(&self.slots).insert(id, Slot::Published(context));
    }

    /// Remove a context so that no new open can find it
    pub fn unpublish(&self, id: DeviceId) -> Option<Arc<DeviceContext>> {
        let mut slots = lock(&self.slots);
        match slots.remove(&id) {
            Some(Slot::Published(context)) => Some(context),
            Some(Slot::Reserved) => {
                slots.insert(id, Slot::Reserved);
                None
            }
            None => None,
        }
    }

    /// Look up a published context
    pub fn find(&self, id: DeviceId) -> Option<Arc<DeviceContext>> {
        match lock(&self.slots).get(&id) {
            Some(Slot::Published(context)) => Some(Arc::clone(context)),
            _ => None,
        }
    }

    /// Look up a published, live context and take a reference to it
    ///
    /// Holds the registry lock across the liveness check, so a concurrent
    /// detach is either fully before or fully after this call.
    pub fn find_live(&self, id: DeviceId) -> Result<Arc<DeviceContext>> {
        match lock(&self.slots).get(&id) {
            Some(Slot::Published(context)) if context.is_live() => Ok(Arc::clone(context)),
            _ => Err(Error::NoSuchDevice),
        }
    }

    pub fn published(&self) -> Vec<Arc<DeviceContext>> {
        lock(&self.slots)
            .values()
            .filter_map(|slot| match slot {
                Slot::Published(context) => Some(Arc::clone(context)),
                Slot::Reserved => None,
            })
            .collect()
    }

    pub fn node_name(&self, id: DeviceId) -> String {
        format!("{}{}", NODE_PREFIX, id.0.saturating_sub(self.minor_base))
    }
}

/// Creates, publishes and retires device contexts
pub struct LifecycleController {
    registry: DeviceRegistry,
    settings: TransferSettings,
}

impl LifecycleController {
    pub fn new(registry: DeviceRegistry, settings: TransferSettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Bring up a matched board and publish it
    ///
    /// On any failure the partially built context is released and nothing
    /// stays published.
    pub fn attach(&self, backend: Arc<dyn UsbBackend>) -> Result<DeviceId> {
        let (bus, address) = backend.location();
        let id = self.registry.reserve()?;
        let node_name = self.registry.node_name(id);

        match DeviceContext::create(id, node_name.clone(), backend, self.settings) {
            Ok(context) => {
                self.registry.publish(id, context);
                info!(
                    "OSR FX2 device now attached as {} (bus {:03} device {:03})",
                    node_name, bus, address
                );
                Ok(id)
            }
            Err(e) => {
                self.registry.release(id);
                error!(
                    "OSR FX2 device probe failed (bus {:03} device {:03}): {}",
                    bus, address, e
                );
                Err(e)
            }
        }
    }

    /// Retire a board
    ///
    /// Returns once the hardware channels are quiesced. Sessions opened
    /// before this call stay valid; the context is destroyed when the last
    /// of them closes.
    pub fn detach(&self, id: DeviceId) -> Result<()> {
        let context = self.registry.unpublish(id).ok_or(Error::NoSuchDevice)?;
        context.retire();

        let sessions = Arc::strong_count(&context) - 1;
        let node_name = context.node_name().to_string();
        drop(context);

        if sessions > 0 {
            debug!(
                "{} retired with {} open session(s) outstanding",
                node_name, sessions
            );
        }
        info!("OSR FX2 {} disconnected", node_name);
        Ok(())
    }

    /// Open a session on a published, live board
    pub fn open(&self, id: DeviceId, mode: AccessMode) -> Result<Session> {
        let context = self.registry.find_live(id)?;
        Session::open(context, mode)
    }

    /// Formatted switch state of a published board
    pub fn status(&self, id: DeviceId) -> Result<String> {
        self.registry
            .find(id)
            .map(|context| context.status())
            .ok_or(Error::NoSuchDevice)
    }

    pub fn switches(&self, id: DeviceId) -> Result<SwitchState> {
        self.registry
            .find(id)
            .map(|context| context.switches())
            .ok_or(Error::NoSuchDevice)
    }

    pub fn find(&self, id: DeviceId) -> Option<Arc<DeviceContext>> {
        self.registry.find(id)
    }

    pub fn devices(&self) -> Vec<DeviceSummary> {
        self.registry
            .published()
            .iter()
            .map(|context| context.summary())
            .collect()
    }

    /// Detach every published board
    pub fn shutdown(&self) {
        for context in self.registry.published() {
            let id = context.id();
            drop(context);
            if let Err(e) = self.detach(id) {
                debug!("Device {} already gone at shutdown: {}", id, e);
            }
        }
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockBackend, fast_settings};

    #[test]
    fn test_reserve_lowest_free() {
        let registry = DeviceRegistry::new(192, 2);
        assert_eq!(registry.reserve().unwrap(), DeviceId(192));
        assert_eq!(registry.reserve().unwrap(), DeviceId(193));
        assert!(matches!(
            registry.reserve(),
            Err(Error::ResourceExhausted(_))
        ));

        registry.release(DeviceId(192));
        assert_eq!(registry.reserve().unwrap(), DeviceId(192));
    }

    #[test]
    fn test_node_names() {
        let registry = DeviceRegistry::new(192, 16);
        assert_eq!(registry.node_name(DeviceId(192)), "osrfx2_0");
        assert_eq!(registry.node_name(DeviceId(195)), "osrfx2_3");
    }

    #[test]
    fn test_reserved_ids_are_not_findable() {
        let registry = DeviceRegistry::new(192, 16);
        let id = registry.reserve().unwrap();
        assert!(registry.find(id).is_none());
        assert!(matches!(registry.find_live(id), Err(Error::NoSuchDevice)));
        assert!(registry.unpublish(id).is_none());
        // Reservation survives the failed unpublish
        assert_ne!(registry.reserve().unwrap(), id);
    }

    #[test]
    fn test_attach_publishes_and_detach_unpublishes() {
        let controller = LifecycleController::new(DeviceRegistry::new(192, 16), fast_settings());
        let id = controller
            .attach(Arc::new(MockBackend::osrfx2()))
            .unwrap();

        assert_eq!(id, DeviceId(192));
        assert_eq!(controller.status(id).unwrap(), "00000000");
        assert_eq!(controller.devices().len(), 1);

        controller.detach(id).unwrap();
        assert!(controller.find(id).is_none());
        assert!(matches!(controller.status(id), Err(Error::NoSuchDevice)));
        assert!(matches!(controller.detach(id), Err(Error::NoSuchDevice)));
    }

    #[test]
    fn test_failed_attach_releases_reservation() {
        let controller = LifecycleController::new(DeviceRegistry::new(192, 16), fast_settings());
        let backend = Arc::new(MockBackend::with_endpoints(Vec::new()));

        assert!(matches!(
            controller.attach(backend),
            Err(Error::Unsupported(_))
        ));
        assert!(controller.devices().is_empty());

        let id = controller
            .attach(Arc::new(MockBackend::osrfx2()))
            .unwrap();
        assert_eq!(id, DeviceId(192));
    }

    #[test]
    fn test_shutdown_detaches_everything() {
        let controller = LifecycleController::new(DeviceRegistry::new(192, 16), fast_settings());
        let a = controller.attach(Arc::new(MockBackend::osrfx2())).unwrap();
        let b = controller.attach(Arc::new(MockBackend::osrfx2())).unwrap();
        let weak_a = Arc::downgrade(&controller.find(a).unwrap());
        let weak_b = Arc::downgrade(&controller.find(b).unwrap());

        controller.shutdown();
        assert!(controller.devices().is_empty());
        assert!(weak_a.upgrade().is_none());
        assert!(weak_b.upgrade().is_none());
    }
}
