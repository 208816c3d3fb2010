//! Session handles
//!
//! A [`Session`] is what one successful open hands back: a shared reference
//! to the device context plus the gate slots the open acquired. It exists
//! only while open; closing consumes it, and dropping it has the same effect.

use crate::usb::context::DeviceContext;
use crate::usb::gate::GateSlots;
use common::{AccessMode, DeviceId, Error, Result, SwitchState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

pub struct Session {
    context: Arc<DeviceContext>,
    mode: AccessMode,
    slots: GateSlots,
    switches: watch::Receiver<u8>,
}

impl Session {
    /// Bind a new session to `context`
    ///
    /// Fails with [`Error::DeviceBusy`] without side effects when a required
    /// gate slot is taken.
    pub(crate) fn open(context: Arc<DeviceContext>, mode: AccessMode) -> Result<Self> {
        let slots = context.gate().acquire(mode)?;
        context.reset_streams(slots);

        debug!(
            "Opened {} ({}) for {}",
            context.node_name(),
            context.id(),
            mode
        );

        let switches = context.subscribe();
        Ok(Self {
            context,
            mode,
            slots,
            switches,
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.context.id()
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn slots(&self) -> GateSlots {
        self.slots
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    /// Blocking bulk-in read into `buf`
    ///
    /// Reads at most one packet. A timeout or transport error leaves the
    /// session open and its slots held.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.mode.is_read() {
            return Err(Error::AccessDenied("reading"));
        }
        self.context.read_bulk(buf)
    }

    /// Submit `data` on the bulk-out channel and return without waiting for
    /// the hardware
    ///
    /// A zero-length write is a no-op returning `Ok(0)`. Errors on the
    /// asynchronous completion are only logged.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if !self.mode.is_write() {
            return Err(Error::AccessDenied("writing"));
        }
        self.context.write_bulk(data)
    }

    /// Current switch state
    pub fn switches(&self) -> SwitchState {
        self.context.switches()
    }

    /// Wait for the next interrupt completion, up to `timeout`
    pub async fn wait_switches(&mut self, timeout: Duration) -> Result<SwitchState> {
        if !self.context.is_live() {
            return Err(Error::NoSuchDevice);
        }

        match tokio::time::timeout(timeout, self.switches.changed()).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Err(Error::NoSuchDevice),
            Ok(Ok(())) => {
                if self.context.is_live() {
                    Ok(self.context.switches())
                } else {
                    Err(Error::NoSuchDevice)
                }
            }
        }
    }

    /// Close the session, returning its slots and its context reference
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.context.gate().release(self.slots);
        debug!(
            "Closed {} ({}), {} other reference(s) remain",
            self.context.node_name(),
            self.context.id(),
            Arc::strong_count(&self.context) - 1
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.context.id())
            .field("mode", &self.mode)
            .field("slots", &self.slots)
            .finish()
    }
}
