//! USB worker thread
//!
//! Dedicated thread that owns the libusb context and the device manager.
//! It runs the libusb event loop (which delivers hot-plug callbacks) and
//! serves commands from the Tokio runtime over the driver bridge.

use crate::config::DriverConfig;
use crate::usb::lifecycle::{DeviceRegistry, LifecycleController};
use crate::usb::manager::DeviceManager;
use common::{DriverCommand, DriverWorker};
use rusb::UsbContext;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long one `handle_events` call may block
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Rescan interval when libusb cannot deliver hot-plug callbacks
const RESCAN_INTERVAL: Duration = Duration::from_secs(1);

pub struct UsbWorkerThread {
    manager: DeviceManager,
    worker: DriverWorker,
}

impl UsbWorkerThread {
    pub fn new(worker: DriverWorker, config: &DriverConfig) -> Result<Self, rusb::Error> {
        let registry = DeviceRegistry::new(config.usb.minor_base, config.usb.max_devices);
        let controller = LifecycleController::new(registry, config.transfers);

        let mut manager = DeviceManager::new(
            controller,
            worker.event_tx.clone(),
            config.usb.filters.clone(),
        )?;
        manager.initialize()?;

        Ok(Self { manager, worker })
    }

    /// Run until a Shutdown command arrives or the bridge is dropped
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB worker thread started");
        let mut last_rescan = Instant::now();

        loop {
            match self.worker.try_recv_command() {
                Some(DriverCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None if self.worker.is_disconnected() => {
                    info!("Driver bridge closed, USB worker shutting down");
                    break;
                }
                None => {}
            }

            match self.manager.context().handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_TIMEOUT);
                }
            }

            self.manager.process_hotplug_events();

            if !self.manager.has_hotplug() && last_rescan.elapsed() >= RESCAN_INTERVAL {
                if let Err(e) = self.manager.rescan() {
                    warn!("USB rescan failed: {}", e);
                }
                last_rescan = Instant::now();
            }
        }

        self.manager.shutdown();
        info!("USB worker thread stopped");
        Ok(())
    }

    fn handle_command(&mut self, cmd: DriverCommand) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: DriverCommand) {
        match cmd {
            DriverCommand::ListDevices { response } => {
                let devices = self.manager.list_devices();
                debug!("Listing {} devices", devices.len());
                let _ = response.send(devices);
            }
            DriverCommand::Shutdown => {
                // Handled by the run loop
            }
        }
    }
}

/// Spawn the USB worker thread
///
/// The thread runs until a Shutdown command is received or an error occurs.
pub fn spawn_usb_worker(
    worker: DriverWorker,
    config: DriverConfig,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let worker_thread = UsbWorkerThread::new(worker, &config)?;
            worker_thread.run()
        })
}
