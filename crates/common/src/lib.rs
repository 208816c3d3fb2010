//! Common utilities for osrfx2-rs
//!
//! This crate provides shared functionality between the driver library and
//! its daemon, including the error taxonomy, logging setup, shared USB types,
//! and the async channel bridge for USB thread communication.

pub mod channel;
pub mod error;
pub mod logging;
pub mod usb_types;

pub use channel::{DriverBridge, DriverCommand, DriverEvent, DriverWorker, create_driver_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{AccessMode, DeviceId, DeviceSummary, SwitchState};
