//! Exclusive-access gate
//!
//! Each bulk direction carries hardware-held stream state (data toggles,
//! partial packets), so at most one session may own it at a time. The gate
//! arbitrates at open-mode granularity: a read-write open needs both slots,
//! and a failed acquire leaves the gate exactly as it found it.

use common::{AccessMode, Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// Slots held by one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateSlots {
    pub read: bool,
    pub write: bool,
}

impl GateSlots {
    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

/// Two independent binary slots, read and write
#[derive(Debug, Default)]
pub struct ExclusiveGate {
    read: AtomicBool,
    write: AtomicBool,
}

impl ExclusiveGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every slot `mode` needs, or none of them
    ///
    /// Never blocks. Fails with [`Error::DeviceBusy`] if any required slot is
    /// already held.
    pub fn acquire(&self, mode: AccessMode) -> Result<GateSlots> {
        let mut slots = GateSlots::default();

        if mode.is_write() {
            if !take(&self.write) {
                return Err(Error::DeviceBusy);
            }
            slots.write = true;
        }

        if mode.is_read() {
            if !take(&self.read) {
                self.release(slots);
                return Err(Error::DeviceBusy);
            }
            slots.read = true;
        }

        trace!("Gate acquired {:?} for {} open", slots, mode);
        Ok(slots)
    }

    /// Return exactly the slots a previous [`acquire`](Self::acquire) handed out
    pub fn release(&self, slots: GateSlots) {
        if slots.write {
            let held = self.write.swap(false, Ordering::AcqRel);
            debug_assert!(held, "released a write slot that was not held");
        }
        if slots.read {
            let held = self.read.swap(false, Ordering::AcqRel);
            debug_assert!(held, "released a read slot that was not held");
        }
    }

    pub fn read_held(&self) -> bool {
        self.read.load(Ordering::Acquire)
    }

    pub fn write_held(&self) -> bool {
        self.write.load(Ordering::Acquire)
    }
}

fn take(slot: &AtomicBool) -> bool {
    slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_modes() {
        let gate = ExclusiveGate::new();

        let read = gate.acquire(AccessMode::Read).unwrap();
        assert_eq!(read, GateSlots { read: true, write: false });
        assert!(gate.read_held());
        assert!(!gate.write_held());

        let write = gate.acquire(AccessMode::Write).unwrap();
        assert_eq!(write, GateSlots { read: false, write: true });
        assert!(gate.write_held());

        gate.release(read);
        gate.release(write);
        assert!(!gate.read_held());
        assert!(!gate.write_held());
    }

    #[test]
    fn test_second_reader_busy() {
        let gate = ExclusiveGate::new();
        let _first = gate.acquire(AccessMode::Read).unwrap();
        assert!(matches!(gate.acquire(AccessMode::Read), Err(Error::DeviceBusy)));
        assert!(gate.read_held());
    }

    #[test]
    fn test_read_write_rolls_back_on_busy_read() {
        let gate = ExclusiveGate::new();
        let reader = gate.acquire(AccessMode::Read).unwrap();

        // Write slot is free but read is not: nothing may stay taken
        assert!(matches!(
            gate.acquire(AccessMode::ReadWrite),
            Err(Error::DeviceBusy)
        ));
        assert!(!gate.write_held());
        assert!(gate.read_held());

        gate.release(reader);
        let both = gate.acquire(AccessMode::ReadWrite).unwrap();
        assert_eq!(both, GateSlots { read: true, write: true });
    }

    #[test]
    fn test_read_write_busy_on_write() {
        let gate = ExclusiveGate::new();
        let _writer = gate.acquire(AccessMode::Write).unwrap();
        assert!(matches!(
            gate.acquire(AccessMode::ReadWrite),
            Err(Error::DeviceBusy)
        ));
        assert!(!gate.read_held());
    }

    #[test]
    fn test_release_empty_slots() {
        let gate = ExclusiveGate::new();
        gate.release(GateSlots::default());
        assert!(GateSlots::default().is_empty());
        assert!(!gate.read_held());
    }

    #[test]
    fn test_concurrent_writers_only_one_wins() {
        let gate = std::sync::Arc::new(ExclusiveGate::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.acquire(AccessMode::Write).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
