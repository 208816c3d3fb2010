//! Hardware seam
//!
//! The driver core talks to the board exclusively through [`UsbBackend`].
//! The production implementation is [`crate::usb::device::UsbDevice`] (rusb);
//! tests use [`crate::test_utils::MockBackend`].

use common::{Error, Result};
use std::time::Duration;

/// Endpoint transfer type (bits 0..1 of `bmAttributes`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint descriptor fields the driver cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// `bEndpointAddress`, bit 7 set for IN endpoints
    pub address: u8,
    pub kind: TransferKind,
    /// `wMaxPacketSize`
    pub max_packet_size: u16,
    /// `bInterval`
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn interrupt_in(address: u8, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address: address | 0x80,
            kind: TransferKind::Interrupt,
            max_packet_size,
            interval,
        }
    }

    pub fn bulk_in(address: u8, max_packet_size: u16) -> Self {
        Self {
            address: address | 0x80,
            kind: TransferKind::Bulk,
            max_packet_size,
            interval: 0,
        }
    }

    pub fn bulk_out(address: u8, max_packet_size: u16) -> Self {
        Self {
            address: address & 0x7f,
            kind: TransferKind::Bulk,
            max_packet_size,
            interval: 0,
        }
    }

    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    pub fn is_int_in(&self) -> bool {
        self.kind == TransferKind::Interrupt && self.is_in()
    }

    pub fn is_bulk_in(&self) -> bool {
        self.kind == TransferKind::Bulk && self.is_in()
    }

    pub fn is_bulk_out(&self) -> bool {
        self.kind == TransferKind::Bulk && !self.is_in()
    }
}

/// The three endpoints an OSR FX2 interface must expose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointLayout {
    pub interrupt_in: EndpointDescriptor,
    pub bulk_in: EndpointDescriptor,
    pub bulk_out: EndpointDescriptor,
}

impl EndpointLayout {
    /// Match an interface's endpoints against the supported layout
    ///
    /// Exactly one interrupt-in, one bulk-in and one bulk-out endpoint, and
    /// nothing else.
    pub fn from_descriptors(endpoints: &[EndpointDescriptor]) -> Result<Self> {
        let pick = |pred: fn(&EndpointDescriptor) -> bool, what: &str| {
            let mut found = endpoints.iter().filter(|ep| pred(ep));
            match (found.next(), found.next()) {
                (Some(ep), None) => Ok(*ep),
                (None, _) => Err(Error::Unsupported(format!("no {} endpoint", what))),
                (Some(_), Some(_)) => Err(Error::Unsupported(format!(
                    "more than one {} endpoint",
                    what
                ))),
            }
        };

        let layout = Self {
            interrupt_in: pick(EndpointDescriptor::is_int_in, "interrupt-in")?,
            bulk_in: pick(EndpointDescriptor::is_bulk_in, "bulk-in")?,
            bulk_out: pick(EndpointDescriptor::is_bulk_out, "bulk-out")?,
        };

        if endpoints.len() != 3 {
            return Err(Error::Unsupported(format!(
                "{} endpoints, expected 3",
                endpoints.len()
            )));
        }

        Ok(layout)
    }
}

/// Transport operations on one claimed interface
///
/// Every call is synchronous and bounded by `timeout`. A `rusb::Error::Timeout`
/// from [`read_interrupt`](UsbBackend::read_interrupt) means the request is
/// still pending; callers poll again.
pub trait UsbBackend: Send + Sync {
    /// (bus number, device address)
    fn location(&self) -> (u8, u8);

    /// Endpoint descriptors of the claimed interface's current alt setting
    fn endpoints(&self) -> rusb::Result<Vec<EndpointDescriptor>>;

    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration)
    -> rusb::Result<usize>;

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;

    /// Clear a halt/stall and reset the endpoint's data toggle
    fn clear_halt(&self, endpoint: u8) -> rusb::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn osrfx2_endpoints() -> Vec<EndpointDescriptor> {
        vec![
            EndpointDescriptor::interrupt_in(0x01, 1, 1),
            EndpointDescriptor::bulk_out(0x06, 512),
            EndpointDescriptor::bulk_in(0x08, 512),
        ]
    }

    #[test]
    fn test_endpoint_direction() {
        assert!(EndpointDescriptor::interrupt_in(0x01, 1, 1).is_int_in());
        assert!(EndpointDescriptor::bulk_in(0x08, 512).is_bulk_in());
        assert!(EndpointDescriptor::bulk_out(0x86, 512).is_bulk_out());
        assert_eq!(EndpointDescriptor::bulk_out(0x86, 512).address, 0x06);
        assert_eq!(EndpointDescriptor::bulk_in(0x08, 512).address, 0x88);
    }

    #[test]
    fn test_layout_matches_osrfx2() {
        let layout = EndpointLayout::from_descriptors(&osrfx2_endpoints()).unwrap();
        assert_eq!(layout.interrupt_in.address, 0x81);
        assert_eq!(layout.bulk_in.address, 0x88);
        assert_eq!(layout.bulk_out.address, 0x06);
        assert_eq!(layout.bulk_in.max_packet_size, 512);
    }

    #[test]
    fn test_layout_order_independent() {
        let mut endpoints = osrfx2_endpoints();
        endpoints.reverse();
        assert!(EndpointLayout::from_descriptors(&endpoints).is_ok());
    }

    #[test]
    fn test_layout_missing_endpoint() {
        let endpoints = vec![
            EndpointDescriptor::interrupt_in(0x01, 1, 1),
            EndpointDescriptor::bulk_in(0x08, 512),
        ];
        let err = EndpointLayout::from_descriptors(&endpoints).unwrap_err();
        assert!(matches!(err, Error::Unsupported(msg) if msg.contains("bulk-out")));
    }

    #[test]
    fn test_layout_duplicate_endpoint() {
        let mut endpoints = osrfx2_endpoints();
        endpoints.push(EndpointDescriptor::bulk_in(0x02, 64));
        let err = EndpointLayout::from_descriptors(&endpoints).unwrap_err();
        assert!(matches!(err, Error::Unsupported(msg) if msg.contains("more than one bulk-in")));
    }

    #[test]
    fn test_layout_extra_endpoint() {
        let mut endpoints = osrfx2_endpoints();
        endpoints.push(EndpointDescriptor {
            address: 0x83,
            kind: TransferKind::Isochronous,
            max_packet_size: 1024,
            interval: 1,
        });
        assert!(matches!(
            EndpointLayout::from_descriptors(&endpoints),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_layout_empty() {
        assert!(matches!(
            EndpointLayout::from_descriptors(&[]),
            Err(Error::Unsupported(_))
        ));
    }
}
