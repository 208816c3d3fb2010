//! Device context
//!
//! One [`DeviceContext`] exists per attached board. It is shared through
//! `Arc`: the registry holds the controller's reference, every open
//! [`Session`](crate::usb::session::Session) holds one, and so does the
//! interrupt request while it is in flight. The context is destroyed
//! (its `Drop` runs) when the last of those lets go.
//!
//! The `live` flag only gates the start of I/O. It is checked before a
//! transfer and never held across one, so a read blocked on the hardware
//! cannot hold up a detach or any other caller. Once
//! [`DeviceContext::retire`] has cleared it no new I/O can start; a read
//! already in progress runs to its own completion or timeout.

use crate::config::TransferSettings;
use crate::usb::backend::{EndpointLayout, UsbBackend};
use crate::usb::channel::{TransferChannel, WriteChannel, WriteRequest};
use crate::usb::gate::{ExclusiveGate, GateSlots};
use crate::usb::transfers::{CompletionStatus, alloc_buffer, map_rusb_error};
use common::{DeviceId, DeviceSummary, Error, Result, SwitchState};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

/// Interrupt payload: the switch byte and nothing else
const SWITCH_PAYLOAD_LEN: usize = std::mem::size_of::<u8>();

pub struct DeviceContext {
    id: DeviceId,
    node_name: String,
    /// Bus ownership; released when the context is destroyed
    backend: Arc<dyn UsbBackend>,
    interrupt: TransferChannel,
    bulk_in: TransferChannel,
    bulk_out: WriteChannel,
    gate: ExclusiveGate,
    live: AtomicBool,
    /// Written only by the interrupt completion path
    switches: AtomicU8,
    events: watch::Sender<u8>,
    /// Advisory; nothing reads it for flow control
    pending_bytes: AtomicUsize,
    settings: TransferSettings,
}

impl DeviceContext {
    /// Build a context for a freshly matched board and start the interrupt
    /// polling loop
    ///
    /// Any failure drops whatever was built so far through the ordinary
    /// release path.
    pub fn create(
        id: DeviceId,
        node_name: String,
        backend: Arc<dyn UsbBackend>,
        settings: TransferSettings,
    ) -> Result<Arc<Self>> {
        let endpoints = backend.endpoints().map_err(map_rusb_error)?;
        let layout = EndpointLayout::from_descriptors(&endpoints)?;

        debug!(
            "Device {} endpoints: int-in {:#04x}, bulk-in {:#04x} ({} bytes), bulk-out {:#04x} ({} bytes)",
            id,
            layout.interrupt_in.address,
            layout.bulk_in.address,
            layout.bulk_in.max_packet_size,
            layout.bulk_out.address,
            layout.bulk_out.max_packet_size
        );

        // The status channel carries one byte regardless of wMaxPacketSize
        let interrupt = TransferChannel::new(layout.interrupt_in, SWITCH_PAYLOAD_LEN)?;
        let bulk_in = TransferChannel::new(
            layout.bulk_in,
            usize::from(layout.bulk_in.max_packet_size),
        )?;
        let bulk_out = WriteChannel::new(
            id,
            layout.bulk_out,
            Arc::clone(&backend),
            settings.write_queue_depth,
            settings.write_timeout,
        )?;

        let (events, _) = watch::channel(0u8);

        let context = Arc::new(Self {
            id,
            node_name,
            backend,
            interrupt,
            bulk_in,
            bulk_out,
            gate: ExclusiveGate::new(),
            live: AtomicBool::new(true),
            switches: AtomicU8::new(0),
            events,
            pending_bytes: AtomicUsize::new(0),
            settings,
        });

        context.submit_interrupt()?;
        Ok(context)
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// (bus number, device address)
    pub fn location(&self) -> (u8, u8) {
        self.backend.location()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Last switch state delivered by the interrupt endpoint
    pub fn switches(&self) -> SwitchState {
        SwitchState(self.switches.load(Ordering::Acquire))
    }

    /// Switch state as eight `'0'`/`'1'` characters, leftmost switch first
    ///
    /// Never blocks; safe to call from any thread at any time.
    pub fn status(&self) -> String {
        self.switches().to_string()
    }

    /// Subscribe to switch-change notifications
    ///
    /// The receiver is woken on every interrupt completion, and once more
    /// when the context is retired.
    pub fn subscribe(&self) -> watch::Receiver<u8> {
        self.events.subscribe()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }

    pub fn gate(&self) -> &ExclusiveGate {
        &self.gate
    }

    /// Whether the interrupt polling loop is still running
    pub fn is_polling(&self) -> bool {
        self.interrupt.is_in_flight()
    }

    pub fn bulk_in_packet_size(&self) -> usize {
        self.bulk_in.max_packet_size()
    }

    pub fn bulk_out_packet_size(&self) -> usize {
        self.bulk_out.max_packet_size()
    }

    pub fn summary(&self) -> DeviceSummary {
        let (bus_number, device_address) = self.location();
        DeviceSummary {
            id: self.id,
            node_name: self.node_name.clone(),
            bus_number,
            device_address,
            switches: self.status(),
            live: self.is_live(),
        }
    }

    fn submit_interrupt(self: &Arc<Self>) -> Result<()> {
        let context = Arc::clone(self);
        self.interrupt
            .submit(format!("osrfx2-{}-int", self.id), move |mut buffer, cancel| {
                context.poll_interrupt(&mut buffer, cancel);
                buffer
            })
    }

    /// Body of the interrupt request: wait for a completion, hand it to the
    /// completion handler, resubmit while the handler asks for it
    fn poll_interrupt(&self, buffer: &mut [u8], cancel: &AtomicBool) {
        let endpoint = self.interrupt.address();

        loop {
            if cancel.load(Ordering::Acquire) {
                self.interrupt_complete(CompletionStatus::Cancelled, &[]);
                return;
            }

            let (status, len) =
                match self
                    .backend
                    .read_interrupt(endpoint, buffer, self.settings.interrupt_poll)
                {
                    Ok(len) => (CompletionStatus::Success, len.min(buffer.len())),
                    // Still pending
                    Err(rusb::Error::Timeout) => continue,
                    Err(e) => (CompletionStatus::from_rusb(e), 0),
                };

            if !self.interrupt_complete(status, &buffer[..len]) {
                return;
            }
        }
    }

    /// Interrupt completion handler
    ///
    /// Returns whether the request should be resubmitted. Any non-success
    /// status stops the polling loop for good; status updates resume only
    /// with the next attach.
    pub(crate) fn interrupt_complete(&self, status: CompletionStatus, payload: &[u8]) -> bool {
        match status {
            CompletionStatus::Success => {
                if let Some(&state) = payload.first() {
                    self.switches.store(state, Ordering::Release);
                    self.events.send_replace(state);
                    debug!("Device {} switches: {}", self.id, SwitchState(state));
                }
                true
            }
            status if status.is_benign() => {
                debug!("Interrupt request on device {} ended: {:?}", self.id, status);
                false
            }
            status => {
                error!(
                    "Non-zero interrupt status on device {}: {:?}, switch updates stopped",
                    self.id, status
                );
                false
            }
        }
    }

    /// Synchronous bulk-in read of up to `min(wMaxPacketSize, buf.len())`
    /// bytes
    pub(crate) fn read_bulk(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.is_live() {
            return Err(Error::NoSuchDevice);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let endpoint = self.bulk_in.address();
        let timeout = self.settings.read_timeout;

        let received = self.bulk_in.with_buffer(|bounce| {
            let want = bounce.len().min(buf.len());
            let n = self
                .backend
                .read_bulk(endpoint, &mut bounce[..want], timeout)
                .map_err(|e| {
                    debug!("Bulk read on device {} failed: {}", self.id, e);
                    map_rusb_error(e)
                })?;

            let data = bounce.get(..n).ok_or(Error::Fault)?;
            buf.get_mut(..n).ok_or(Error::Fault)?.copy_from_slice(data);
            Ok(n)
        })?;

        let _ = self
            .pending_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                Some(p.saturating_sub(received))
            });

        trace!("Bulk read of {} bytes on device {}", received, self.id);
        Ok(received)
    }

    /// Queue an asynchronous bulk-out write; returns once it is submitted
    pub(crate) fn write_bulk(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        if !self.is_live() {
            return Err(Error::NoSuchDevice);
        }

        let mut buffer = alloc_buffer(data.len())?;
        buffer.copy_from_slice(data);
        // Raced with retire: the queue is already closed
        self.bulk_out
            .submit(WriteRequest { buffer })
            .map_err(|e| if self.is_live() { e } else { Error::NoSuchDevice })?;

        self.pending_bytes.fetch_add(data.len(), Ordering::AcqRel);
        trace!("Queued bulk write of {} bytes on device {}", data.len(), self.id);
        Ok(data.len())
    }

    /// Best-effort reset of the stream state behind freshly acquired slots
    pub(crate) fn reset_streams(&self, slots: GateSlots) {
        if slots.write {
            self.reset_stream(self.bulk_out.address());
        }
        if slots.read {
            self.reset_stream(self.bulk_in.address());
        }
    }

    fn reset_stream(&self, endpoint: u8) {
        if let Err(e) = self.backend.clear_halt(endpoint) {
            warn!(
                "Failed to reset endpoint {:#04x} on device {}: {}",
                endpoint, self.id, e
            );
        }
    }

    /// Retire the context: no new I/O, hardware channels quiesced
    ///
    /// Blocks only until the interrupt request has confirmed cancellation
    /// and the write pump has stopped. Reads already waiting on the hardware
    /// are left to finish on their own. Open sessions keep their reference.
    pub(crate) fn retire(&self) {
        if !self.live.swap(false, Ordering::AcqRel) {
            return;
        }

        self.interrupt.cancel_sync();
        self.bulk_out.shutdown();

        // Wake waiters so they notice the retirement
        self.events.send_modify(|_| {});
        debug!("Device {} retired", self.id);
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        debug!(
            "Destroying context for device {} ({} bytes still advisory-pending)",
            self.id,
            self.pending_bytes.load(Ordering::Acquire)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockBackend, fast_settings, wait_until};
    use std::time::Duration;

    fn context(backend: &Arc<MockBackend>) -> Arc<DeviceContext> {
        DeviceContext::create(
            DeviceId(192),
            "osrfx2_0".to_string(),
            backend.clone(),
            fast_settings(),
        )
        .unwrap()
    }

    #[test]
    fn test_create_starts_polling() {
        let backend = Arc::new(MockBackend::osrfx2());
        let ctx = context(&backend);

        assert!(ctx.is_live());
        assert!(ctx.is_polling());
        assert_eq!(ctx.status(), "00000000");
        assert_eq!(ctx.bulk_in_packet_size(), 512);
        assert_eq!(ctx.bulk_out_packet_size(), 512);
        assert_eq!(ctx.bulk_out.buffer_len(), Some(512));
        // Interrupt buffer is one byte even though the endpoint reports more
        assert!(wait_until(Duration::from_secs(2), || backend.interrupt_reads() > 0));
        assert_eq!(backend.last_interrupt_len(), Some(1));

        ctx.retire();
    }

    #[test]
    fn test_interrupt_completion_updates_switches() {
        let backend = Arc::new(MockBackend::osrfx2());
        let ctx = context(&backend);

        backend.push_interrupt(vec![0xA5]);
        assert!(wait_until(Duration::from_secs(2), || ctx.status() == "10100101"));

        // Loop resubmitted: a second completion lands too
        backend.push_interrupt(vec![0x3C]);
        assert!(wait_until(Duration::from_secs(2), || ctx.switches() == SwitchState(0x3C)));
        assert!(ctx.is_polling());

        ctx.retire();
    }

    #[test]
    fn test_interrupt_error_stops_polling() {
        let backend = Arc::new(MockBackend::osrfx2());
        let ctx = context(&backend);

        backend.push_interrupt(vec![0x01]);
        backend.push_interrupt_error(rusb::Error::Pipe);
        backend.push_interrupt(vec![0xFF]);

        assert!(wait_until(Duration::from_secs(2), || !ctx.is_polling()));
        // The byte queued after the error is never consumed
        assert_eq!(ctx.status(), "00000001");
        assert_eq!(backend.pending_interrupts(), 1);
        // The request no longer holds a reference
        assert!(wait_until(Duration::from_secs(2), || Arc::strong_count(&ctx) == 1));
    }

    #[test]
    fn test_completion_handler_dispositions() {
        let backend = Arc::new(MockBackend::osrfx2());
        let ctx = context(&backend);
        ctx.retire();

        assert!(ctx.interrupt_complete(CompletionStatus::Success, &[0x80]));
        assert_eq!(ctx.status(), "10000000");
        assert!(ctx.interrupt_complete(CompletionStatus::Success, &[]));
        assert_eq!(ctx.status(), "10000000");
        assert!(!ctx.interrupt_complete(CompletionStatus::Cancelled, &[]));
        assert!(!ctx.interrupt_complete(CompletionStatus::Shutdown, &[]));
        assert!(!ctx.interrupt_complete(
            CompletionStatus::Failed(rusb::Error::Overflow),
            &[0x01]
        ));
        assert_eq!(ctx.status(), "10000000");
    }

    #[test]
    fn test_retire_cancels_and_blocks_io() {
        let backend = Arc::new(MockBackend::osrfx2());
        let ctx = context(&backend);
        let weak = Arc::downgrade(&ctx);

        ctx.retire();
        assert!(!ctx.is_live());
        assert!(!ctx.is_polling());
        assert!(matches!(ctx.write_bulk(&[1]), Err(Error::NoSuchDevice)));
        let mut buf = [0u8; 4];
        assert!(matches!(ctx.read_bulk(&mut buf), Err(Error::NoSuchDevice)));

        // Retiring twice is harmless
        ctx.retire();

        drop(ctx);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_retire_does_not_wait_for_blocked_read() {
        let backend = Arc::new(MockBackend::osrfx2());
        let settings = TransferSettings {
            read_timeout: Duration::from_secs(2),
            ..fast_settings()
        };
        let ctx = DeviceContext::create(DeviceId(192), "osrfx2_0".to_string(), backend, settings)
            .unwrap();

        let reader = {
            let ctx = Arc::clone(&ctx);
            std::thread::spawn(move || {
                let mut buf = [0u8; 8];
                ctx.read_bulk(&mut buf)
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        let start = std::time::Instant::now();
        assert!(ctx.is_live());
        assert_eq!(ctx.write_bulk(&[1]).unwrap(), 1);
        ctx.retire();
        assert!(!ctx.is_live());
        assert!(matches!(ctx.write_bulk(&[2]), Err(Error::NoSuchDevice)));
        assert!(start.elapsed() < Duration::from_secs(1));

        // The read finishes on its own timeout
        assert!(matches!(reader.join().unwrap(), Err(Error::Timeout)));
    }

    #[test]
    fn test_pending_bytes_bookkeeping() {
        let backend = Arc::new(MockBackend::osrfx2());
        let ctx = context(&backend);

        assert_eq!(ctx.write_bulk(&[0u8; 10]).unwrap(), 10);
        assert_eq!(ctx.pending_bytes(), 10);

        backend.push_bulk_in(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 64];
        assert_eq!(ctx.read_bulk(&mut buf).unwrap(), 4);
        assert_eq!(ctx.pending_bytes(), 6);

        // Never wraps below zero
        backend.push_bulk_in(vec![0u8; 32]);
        assert_eq!(ctx.read_bulk(&mut buf).unwrap(), 32);
        assert_eq!(ctx.pending_bytes(), 0);

        ctx.retire();
    }

    #[test]
    fn test_overreported_read_is_fault() {
        let backend = Arc::new(MockBackend::osrfx2());
        let ctx = context(&backend);

        backend.push_bulk_in_overreport(8);
        let mut buf = [0u8; 4];
        assert!(matches!(ctx.read_bulk(&mut buf), Err(Error::Fault)));

        ctx.retire();
    }

    #[test]
    fn test_unsupported_layout_discards_context() {
        let backend = Arc::new(MockBackend::with_endpoints(vec![
            crate::usb::backend::EndpointDescriptor::interrupt_in(1, 1, 1),
        ]));

        let result = DeviceContext::create(
            DeviceId(192),
            "osrfx2_0".to_string(),
            backend.clone(),
            fast_settings(),
        );
        assert!(matches!(result, Err(Error::Unsupported(_))));
        // Only our handle to the backend remains
        assert!(wait_until(Duration::from_secs(2), || Arc::strong_count(&backend) == 1));
    }
}
