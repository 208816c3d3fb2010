//! Transfer channels
//!
//! A [`TransferChannel`] wraps one endpoint and the buffer backing it. While
//! an asynchronous request is in flight the buffer is owned by the request's
//! executor thread and only comes back once the request has completed or
//! been cancelled, so a buffer can never be freed under a pending transfer.
//!
//! Bulk-out writes go through a [`WriteChannel`]. It keeps a standing
//! packet-sized buffer like every other channel, but each queued write owns
//! its own transfer buffer, which the completion handler releases.

use crate::usb::backend::{EndpointDescriptor, UsbBackend};
use crate::usb::transfers::{CompletionStatus, alloc_buffer};
use common::{DeviceId, Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Lock a mutex, recovering the guard if a holder panicked
///
/// All state guarded this way is valid at every instant, so a poisoned lock
/// carries nothing worth refusing.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An asynchronous request executing on a dedicated thread
///
/// Dropping an `InFlight` detaches the thread; use [`InFlight::cancel_sync`]
/// to wait for completion.
pub struct InFlight<T> {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<T>,
}

impl<T: Send + 'static> InFlight<T> {
    /// Submit `request`; it receives the cancellation flag and should return
    /// promptly once the flag is set
    pub fn spawn<F>(name: String, request: F) -> Result<Self>
    where
        F: FnOnce(&AtomicBool) -> T + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);

        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || request(&flag))
            .map_err(|e| Error::ResourceExhausted(format!("request thread: {}", e)))?;

        Ok(Self { cancel, thread })
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Request cancellation without waiting
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Request cancellation and block until the request has finished
    ///
    /// Returns `None` if the request panicked.
    pub fn cancel_sync(self) -> Option<T> {
        self.cancel.store(true, Ordering::Release);
        self.thread.join().ok()
    }
}

enum RequestSlot {
    /// Buffer is owned by the channel
    Idle(Vec<u8>),
    /// Buffer is owned by an in-flight request
    Submitted(InFlight<Vec<u8>>),
    /// Buffer was lost with a failed or panicked request
    Released,
}

/// One endpoint plus its owned buffer and optional in-flight request
pub struct TransferChannel {
    endpoint: EndpointDescriptor,
    slot: Mutex<RequestSlot>,
}

impl TransferChannel {
    /// Create a channel with a zeroed buffer of `buffer_len` bytes
    pub fn new(endpoint: EndpointDescriptor, buffer_len: usize) -> Result<Self> {
        Ok(Self {
            endpoint,
            slot: Mutex::new(RequestSlot::Idle(alloc_buffer(buffer_len)?)),
        })
    }

    pub fn address(&self) -> u8 {
        self.endpoint.address
    }

    pub fn max_packet_size(&self) -> usize {
        usize::from(self.endpoint.max_packet_size)
    }

    /// Length of the owned buffer, if the channel currently holds it
    pub fn buffer_len(&self) -> Option<usize> {
        match &*lock(&self.slot) {
            RequestSlot::Idle(buffer) => Some(buffer.len()),
            _ => None,
        }
    }

    /// Whether an asynchronous request is still executing
    pub fn is_in_flight(&self) -> bool {
        matches!(&*lock(&self.slot), RequestSlot::Submitted(req) if !req.is_finished())
    }

    /// Hand the buffer to an asynchronous request
    ///
    /// The request gets the buffer and the cancellation flag and must give
    /// the buffer back when it finishes.
    pub fn submit<F>(&self, name: String, request: F) -> Result<()>
    where
        F: FnOnce(Vec<u8>, &AtomicBool) -> Vec<u8> + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        let buffer = match std::mem::replace(&mut *slot, RequestSlot::Released) {
            RequestSlot::Idle(buffer) => buffer,
            other => {
                *slot = other;
                return Err(Error::TransportFailure(format!(
                    "endpoint {:#04x} has no idle buffer",
                    self.endpoint.address
                )));
            }
        };

        let in_flight = InFlight::spawn(name, move |cancel| request(buffer, cancel))?;
        *slot = RequestSlot::Submitted(in_flight);
        trace!("Submitted request on endpoint {:#04x}", self.endpoint.address);
        Ok(())
    }

    /// Cancel the in-flight request, if any, and wait for it to finish
    ///
    /// On return the buffer is back in the channel's hands.
    pub fn cancel_sync(&self) {
        let in_flight = {
            let mut slot = lock(&self.slot);
            match std::mem::replace(&mut *slot, RequestSlot::Released) {
                RequestSlot::Submitted(in_flight) => in_flight,
                other => {
                    *slot = other;
                    return;
                }
            }
        };

        // Joined outside the lock; the request never touches the slot.
        let returned = in_flight.cancel_sync();
        let mut slot = lock(&self.slot);
        match returned {
            Some(buffer) => *slot = RequestSlot::Idle(buffer),
            None => {
                error!(
                    "Request on endpoint {:#04x} panicked, buffer released",
                    self.endpoint.address
                );
            }
        }
        debug!("Cancelled request on endpoint {:#04x}", self.endpoint.address);
    }

    /// Run a synchronous transfer against the owned buffer
    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut [u8]) -> Result<R>) -> Result<R> {
        match &mut *lock(&self.slot) {
            RequestSlot::Idle(buffer) => f(buffer),
            _ => Err(Error::TransportFailure(format!(
                "endpoint {:#04x} buffer is in flight",
                self.endpoint.address
            ))),
        }
    }
}

/// One queued bulk-out transfer; owns its buffer until completion
#[derive(Debug)]
pub struct WriteRequest {
    pub buffer: Vec<u8>,
}

/// Bulk-out channel: a submission queue drained by a pump thread
pub struct WriteChannel {
    /// Endpoint plus its standing `wMaxPacketSize` buffer
    channel: TransferChannel,
    queue: async_channel::Sender<WriteRequest>,
    pump: Mutex<Option<InFlight<()>>>,
}

impl WriteChannel {
    pub fn new(
        device: DeviceId,
        endpoint: EndpointDescriptor,
        backend: Arc<dyn UsbBackend>,
        queue_depth: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let channel = TransferChannel::new(endpoint, usize::from(endpoint.max_packet_size))?;
        let (tx, rx) = async_channel::bounded::<WriteRequest>(queue_depth.max(1));
        let address = endpoint.address;

        let pump = InFlight::spawn(format!("osrfx2-{}-out", device), move |cancel| {
            while let Ok(request) = rx.recv_blocking() {
                let status = if cancel.load(Ordering::Acquire) {
                    CompletionStatus::Cancelled
                } else {
                    match backend.write_bulk(address, &request.buffer, timeout) {
                        Ok(written) if written == request.buffer.len() => CompletionStatus::Success,
                        Ok(written) => {
                            warn!(
                                "Short bulk write on device {} endpoint {:#04x}: {} of {} bytes",
                                device,
                                address,
                                written,
                                request.buffer.len()
                            );
                            CompletionStatus::Success
                        }
                        Err(e) => CompletionStatus::from_rusb(e),
                    }
                };
                write_complete(device, address, status, request);
            }
            trace!("Bulk-out pump for device {} stopped", device);
        })?;

        Ok(Self {
            channel,
            queue: tx,
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn address(&self) -> u8 {
        self.channel.address()
    }

    pub fn max_packet_size(&self) -> usize {
        self.channel.max_packet_size()
    }

    /// Length of the standing buffer
    pub fn buffer_len(&self) -> Option<usize> {
        self.channel.buffer_len()
    }

    /// Queue a write without waiting for the hardware
    pub fn submit(&self, request: WriteRequest) -> Result<()> {
        self.queue.try_send(request).map_err(|e| match e {
            async_channel::TrySendError::Full(_) => {
                Error::ResourceExhausted("bulk-out queue full".to_string())
            }
            async_channel::TrySendError::Closed(_) => {
                Error::TransportFailure("bulk-out channel shut down".to_string())
            }
        })
    }

    /// Stop accepting writes, complete queued ones as cancelled, and wait for
    /// the pump to exit
    pub fn shutdown(&self) {
        let pump = lock(&self.pump).take();
        if let Some(pump) = &pump {
            pump.cancel();
        }
        self.queue.close();
        if let Some(pump) = pump {
            pump.cancel_sync();
        }
    }
}

impl Drop for WriteChannel {
    fn drop(&mut self) {
        // The pump drains what is left and exits on its own.
        self.queue.close();
    }
}

/// Bulk-out completion handler
///
/// Runs on the pump thread. Cancellation and shutdown are expected during
/// teardown; anything else is logged. The request's buffer is released here
/// in every case.
fn write_complete(device: DeviceId, endpoint: u8, status: CompletionStatus, request: WriteRequest) {
    match status {
        CompletionStatus::Success => {
            trace!(
                "Bulk write of {} bytes completed on device {} endpoint {:#04x}",
                request.buffer.len(),
                device,
                endpoint
            );
        }
        status if status.is_benign() => {
            debug!(
                "Bulk write on device {} endpoint {:#04x} ended: {:?}",
                device, endpoint, status
            );
        }
        status => {
            error!(
                "Bulk write on device {} endpoint {:#04x} failed: {:?}",
                device, endpoint, status
            );
        }
    }
    drop(request);
}
