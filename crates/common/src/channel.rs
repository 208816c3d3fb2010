//! Async channel bridge between Tokio runtime and USB thread

use crate::usb_types::{DeviceId, DeviceSummary};
use async_channel::{Receiver, Sender, bounded};

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum DriverCommand {
    /// List all attached boards
    ListDevices {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<DeviceSummary>>,
    },

    /// Shutdown the USB thread gracefully, retiring every attached board
    Shutdown,
}

/// Lifecycle events from the USB thread
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A board was attached and published
    DeviceAttached {
        id: DeviceId,
        /// Character device node name
        node_name: String,
        /// Subscription to the board's switch-change notifications
        switches: tokio::sync::watch::Receiver<u8>,
    },

    /// A matching board could not be attached
    AttachFailed {
        bus_number: u8,
        device_address: u8,
        reason: String,
    },

    /// A board was retired
    DeviceDetached { id: DeviceId },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct DriverBridge {
    cmd_tx: Sender<DriverCommand>,
    event_rx: Receiver<DriverEvent>,
}

impl DriverBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: DriverCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<DriverEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for USB thread (blocking)
pub struct DriverWorker {
    pub(crate) cmd_rx: Receiver<DriverCommand>,
    /// Event sender (public for USB worker thread to access)
    pub event_tx: Sender<DriverEvent>,
}

impl DriverWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<DriverCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<DriverCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Whether every bridge handle on the Tokio side is gone
    pub fn is_disconnected(&self) -> bool {
        self.cmd_rx.is_closed()
    }

    /// Send an event to Tokio runtime without blocking the USB thread
    ///
    /// Events are dropped when nobody drains the bridge.
    pub fn send_event(&self, event: DriverEvent) -> crate::Result<()> {
        self.event_tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (DriverBridge for Tokio, DriverWorker for USB thread)
pub fn create_driver_bridge() -> (DriverBridge, DriverWorker) {
    let (cmd_tx, cmd_rx) = bounded(64);
    let (event_tx, event_rx) = bounded(256);

    (
        DriverBridge { cmd_tx, event_rx },
        DriverWorker { cmd_rx, event_tx },
    )
}
