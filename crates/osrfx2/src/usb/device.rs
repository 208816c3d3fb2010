//! rusb-backed hardware access
//!
//! [`UsbDevice`] owns an open handle to one board with interface 0 claimed.
//! It is the production [`UsbBackend`]; dropping it releases the interface
//! and hands the board back to any kernel driver we displaced.

use crate::usb::backend::{EndpointDescriptor, TransferKind, UsbBackend};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, warn};

/// The board exposes all three endpoints on interface 0, alternate setting 0
const INTERFACE: u8 = 0;

pub struct UsbDevice {
    device: Device<Context>,
    handle: DeviceHandle<Context>,
    descriptor: DeviceDescriptor,
    kernel_driver_detached: bool,
}

impl UsbDevice {
    /// Open `device` and claim its interface
    ///
    /// A kernel driver bound to the interface is detached first and
    /// reattached on drop.
    pub fn open(device: Device<Context>) -> rusb::Result<Self> {
        let descriptor = device.device_descriptor()?;
        let handle = device.open().map_err(|e| {
            warn!(
                "Failed to open device on bus {:03} address {:03}: {}",
                device.bus_number(),
                device.address(),
                e
            );
            e
        })?;

        let kernel_driver_detached = match handle.kernel_driver_active(INTERFACE) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", INTERFACE);
                match handle.detach_kernel_driver(INTERFACE) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            INTERFACE, e
                        );
                        false
                    }
                }
            }
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    INTERFACE, e
                );
                false
            }
        };

        if let Err(e) = handle.claim_interface(INTERFACE) {
            warn!("Failed to claim interface {}: {}", INTERFACE, e);
            if kernel_driver_detached {
                let _ = handle.attach_kernel_driver(INTERFACE);
            }
            return Err(e);
        }
        debug!(
            "Claimed interface {} on bus {:03} address {:03}",
            INTERFACE,
            device.bus_number(),
            device.address()
        );

        Ok(Self {
            device,
            handle,
            descriptor,
            kernel_driver_detached,
        })
    }

    /// Product string, if the board reports one
    pub fn product(&self) -> Option<String> {
        self.descriptor
            .product_string_index()
            .and_then(|idx| self.handle.read_string_descriptor_ascii(idx).ok())
    }
}

impl UsbBackend for UsbDevice {
    fn location(&self) -> (u8, u8) {
        (self.device.bus_number(), self.device.address())
    }

    fn endpoints(&self) -> rusb::Result<Vec<EndpointDescriptor>> {
        let config = self.device.active_config_descriptor()?;
        let interface = config
            .interfaces()
            .find(|i| i.number() == INTERFACE)
            .ok_or(rusb::Error::NotFound)?;
        let setting = interface
            .descriptors()
            .find(|d| d.setting_number() == 0)
            .ok_or(rusb::Error::NotFound)?;

        Ok(setting
            .endpoint_descriptors()
            .map(|ep| EndpointDescriptor {
                address: ep.address(),
                kind: map_transfer_type(ep.transfer_type()),
                max_packet_size: ep.max_packet_size(),
                interval: ep.interval(),
            })
            .collect())
    }

    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.read_interrupt(endpoint, buf, timeout)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.read_bulk(endpoint, buf, timeout)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, buf, timeout)
    }

    fn clear_halt(&self, endpoint: u8) -> rusb::Result<()> {
        self.handle.clear_halt(endpoint)
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(INTERFACE) {
            // Expected once the board is unplugged
            debug!("Failed to release interface {}: {}", INTERFACE, e);
        }

        if self.kernel_driver_detached {
            match self.handle.attach_kernel_driver(INTERFACE) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", INTERFACE),
                Err(e) => debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    INTERFACE, e
                ),
            }
        }
    }
}

/// Read the VID:PID of a device without opening it
pub fn device_ids<T: UsbContext>(device: &Device<T>) -> rusb::Result<(u16, u16)> {
    let descriptor = device.device_descriptor()?;
    Ok((descriptor.vendor_id(), descriptor.product_id()))
}

fn map_transfer_type(kind: rusb::TransferType) -> TransferKind {
    match kind {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
}
