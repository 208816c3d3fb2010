//! Control logic for the OSR FX2 USB learning board
//!
//! Attach/detach lifecycle, exclusive per-direction sessions, bulk I/O and
//! switch-state notifications, on top of a pluggable [`usb::UsbBackend`].

pub mod config;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb;

pub use config::DriverConfig;
