//! USB subsystem
//!
//! The driver core (backend, channel, gate, context, session, lifecycle) is
//! independent of libusb and runs against any [`UsbBackend`]. The manager
//! and worker bind it to real hardware: enumeration and hot-plug on a
//! dedicated thread, bridged to the Tokio runtime.

pub mod backend;
pub mod channel;
pub mod context;
pub mod device;
pub mod gate;
pub mod lifecycle;
pub mod manager;
pub mod session;
pub mod transfers;
pub mod worker;

pub use backend::{EndpointDescriptor, EndpointLayout, TransferKind, UsbBackend};
pub use context::DeviceContext;
pub use device::UsbDevice;
pub use gate::{ExclusiveGate, GateSlots};
pub use lifecycle::{DeviceRegistry, LifecycleController};
pub use manager::DeviceManager;
pub use session::Session;
pub use transfers::{CompletionStatus, map_rusb_error};
pub use worker::{UsbWorkerThread, spawn_usb_worker};
