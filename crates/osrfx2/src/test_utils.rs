//! Test utilities for osrfx2
//!
//! [`MockBackend`] stands in for a real board: tests script what the
//! interrupt and bulk-in endpoints deliver and inspect what was written or
//! reset.
//!
//! Built only for the crate's own tests or with the `test-utils` feature.
//!
//! # Example
//!
//! ```
//! use osrfx2::test_utils::{MockBackend, fast_settings};
//! use osrfx2::usb::{DeviceRegistry, LifecycleController};
//! use std::sync::Arc;
//!
//! let controller = LifecycleController::new(DeviceRegistry::new(192, 4), fast_settings());
//! let id = controller.attach(Arc::new(MockBackend::osrfx2())).unwrap();
//! assert_eq!(controller.status(id).unwrap(), "00000000");
//! ```

use crate::config::TransferSettings;
use crate::usb::backend::{EndpointDescriptor, UsbBackend};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Endpoint addresses of the OSR FX2 firmware
pub const OSRFX2_INT_IN: u8 = 0x81;
pub const OSRFX2_BULK_OUT: u8 = 0x06;
pub const OSRFX2_BULK_IN: u8 = 0x88;

/// Transfer settings with short timeouts so tests finish quickly
pub fn fast_settings() -> TransferSettings {
    TransferSettings {
        read_timeout: Duration::from_millis(200),
        write_timeout: Duration::from_millis(200),
        interrupt_poll: Duration::from_millis(5),
        write_queue_depth: 8,
    }
}

/// Poll `condition` until it holds or `timeout` expires
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

enum Scripted {
    Data(Vec<u8>),
    Error(rusb::Error),
    /// Report `n` more bytes than the caller's buffer holds
    Overreport(usize),
}

#[derive(Default)]
struct State {
    interrupts: VecDeque<Scripted>,
    bulk_in: VecDeque<Scripted>,
    written: Vec<Vec<u8>>,
    write_failures: VecDeque<rusb::Error>,
    write_delay: Duration,
    cleared_halts: Vec<u8>,
    fail_clear_halt: bool,
    interrupt_reads: usize,
    last_interrupt_len: Option<usize>,
    unplugged: bool,
}

/// Scripted in-memory board
pub struct MockBackend {
    location: (u8, u8),
    endpoints: Vec<EndpointDescriptor>,
    state: Mutex<State>,
    ready: Condvar,
}

impl MockBackend {
    /// A board with the standard OSR FX2 endpoint layout
    pub fn osrfx2() -> Self {
        Self::with_endpoints(vec![
            EndpointDescriptor::interrupt_in(OSRFX2_INT_IN, 2, 1),
            EndpointDescriptor::bulk_out(OSRFX2_BULK_OUT, 512),
            EndpointDescriptor::bulk_in(OSRFX2_BULK_IN, 512),
        ])
    }

    pub fn with_endpoints(endpoints: Vec<EndpointDescriptor>) -> Self {
        Self {
            location: (1, 2),
            endpoints,
            state: Mutex::new(State::default()),
            ready: Condvar::new(),
        }
    }

    pub fn with_location(mut self, bus: u8, address: u8) -> Self {
        self.location = (bus, address);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn push(&self, f: impl FnOnce(&mut State)) {
        f(&mut self.state());
        self.ready.notify_all();
    }

    /// Queue one interrupt completion carrying `payload`
    pub fn push_interrupt(&self, payload: Vec<u8>) {
        self.push(|s| s.interrupts.push_back(Scripted::Data(payload)));
    }

    /// Queue an interrupt completion that fails with `err`
    pub fn push_interrupt_error(&self, err: rusb::Error) {
        self.push(|s| s.interrupts.push_back(Scripted::Error(err)));
    }

    /// Interrupt completions queued but not yet consumed
    pub fn pending_interrupts(&self) -> usize {
        self.state().interrupts.len()
    }

    /// Number of interrupt reads issued, including ones that timed out
    pub fn interrupt_reads(&self) -> usize {
        self.state().interrupt_reads
    }

    /// Buffer length of the most recent interrupt read
    pub fn last_interrupt_len(&self) -> Option<usize> {
        self.state().last_interrupt_len
    }

    pub fn push_bulk_in(&self, data: Vec<u8>) {
        self.push(|s| s.bulk_in.push_back(Scripted::Data(data)));
    }

    pub fn push_bulk_in_error(&self, err: rusb::Error) {
        self.push(|s| s.bulk_in.push_back(Scripted::Error(err)));
    }

    /// Queue a bulk-in completion that claims `extra` bytes beyond the buffer
    pub fn push_bulk_in_overreport(&self, extra: usize) {
        self.push(|s| s.bulk_in.push_back(Scripted::Overreport(extra)));
    }

    /// Everything that reached the bulk-out endpoint, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    /// Fail the next bulk-out transfer with `err`
    pub fn fail_next_write(&self, err: rusb::Error) {
        self.push(|s| s.write_failures.push_back(err));
    }

    /// Make every bulk-out transfer take `delay`
    pub fn set_write_delay(&self, delay: Duration) {
        self.push(|s| s.write_delay = delay);
    }

    /// Endpoints whose halt/toggle state was reset, in order
    pub fn cleared_halts(&self) -> Vec<u8> {
        self.state().cleared_halts.clone()
    }

    pub fn fail_clear_halt(&self, fail: bool) {
        self.push(|s| s.fail_clear_halt = fail);
    }

    /// Simulate the board being pulled: every later transfer fails with
    /// `NoDevice`
    pub fn unplug(&self) {
        self.push(|s| s.unplugged = true);
    }

    /// Wait up to `timeout` for a scripted completion on the queue `pick`
    /// selects
    fn next(
        &self,
        timeout: Duration,
        pick: impl Fn(&mut State) -> &mut VecDeque<Scripted>,
    ) -> rusb::Result<Scripted> {
        let guard = self.state();
        let (mut guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |s| !s.unplugged && pick(s).is_empty())
            .unwrap_or_else(|p| p.into_inner());

        if guard.unplugged {
            return Err(rusb::Error::NoDevice);
        }
        pick(&mut guard).pop_front().ok_or(rusb::Error::Timeout)
    }
}

fn deliver(scripted: Scripted, buf: &mut [u8]) -> rusb::Result<usize> {
    match scripted {
        Scripted::Data(data) => {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok(n)
        }
        Scripted::Error(err) => Err(err),
        Scripted::Overreport(extra) => Ok(buf.len() + extra),
    }
}

impl UsbBackend for MockBackend {
    fn location(&self) -> (u8, u8) {
        self.location
    }

    fn endpoints(&self) -> rusb::Result<Vec<EndpointDescriptor>> {
        Ok(self.endpoints.clone())
    }

    fn read_interrupt(&self, _endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        {
            let mut state = self.state();
            state.interrupt_reads += 1;
            state.last_interrupt_len = Some(buf.len());
        }
        let scripted = self.next(timeout, |s| &mut s.interrupts)?;
        deliver(scripted, buf)
    }

    fn read_bulk(&self, _endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        let scripted = self.next(timeout, |s| &mut s.bulk_in)?;
        deliver(scripted, buf)
    }

    fn write_bulk(&self, _endpoint: u8, buf: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        let delay = {
            let mut state = self.state();
            if state.unplugged {
                return Err(rusb::Error::NoDevice);
            }
            if let Some(err) = state.write_failures.pop_front() {
                return Err(err);
            }
            state.write_delay
        };

        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.state().written.push(buf.to_vec());
        Ok(buf.len())
    }

    fn clear_halt(&self, endpoint: u8) -> rusb::Result<()> {
        let mut state = self.state();
        if state.fail_clear_halt {
            return Err(rusb::Error::Pipe);
        }
        state.cleared_halts.push(endpoint);
        Ok(())
    }
}
