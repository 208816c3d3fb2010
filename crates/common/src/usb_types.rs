//! USB type abstractions shared by the driver and its daemon

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device id (the minor number handed out at attach)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access mode requested at open time
///
/// Mirrors the `O_RDONLY` / `O_WRONLY` / `O_RDWR` access-mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    /// Whether this mode may drive the bulk-in channel
    pub fn is_read(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    /// Whether this mode may drive the bulk-out channel
    pub fn is_write(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }

    /// Decode the low two access-mode bits of an open(2) flags word
    ///
    /// Returns `None` for the reserved value `3`.
    pub fn from_open_flags(flags: i32) -> Option<Self> {
        match flags & 0o3 {
            0 => Some(AccessMode::Read),
            1 => Some(AccessMode::Write),
            2 => Some(AccessMode::ReadWrite),
            _ => None,
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => write!(f, "read"),
            AccessMode::Write => write!(f, "write"),
            AccessMode::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// DIP switch state as reported by the interrupt endpoint
///
/// Bit 7 is the leftmost switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchState(pub u8);

impl SwitchState {
    /// Whether switch `index` (0 = rightmost) is on
    pub fn is_on(self, index: u8) -> bool {
        index < 8 && self.0 & (1 << index) != 0
    }
}

impl fmt::Display for SwitchState {
    /// Eight `'0'`/`'1'` characters, most-significant bit first
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08b}", self.0)
    }
}

impl From<u8> for SwitchState {
    fn from(value: u8) -> Self {
        SwitchState(value)
    }
}

/// Snapshot of one attached board, as listed by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    /// Character device node name, e.g. `osrfx2_0`
    pub node_name: String,
    pub bus_number: u8,
    pub device_address: u8,
    pub switches: String,
    pub live: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_state_format() {
        assert_eq!(SwitchState(0xA5).to_string(), "10100101");
        assert_eq!(SwitchState(0x01).to_string(), "00000001");
        assert_eq!(SwitchState(0x00).to_string(), "00000000");
        assert_eq!(SwitchState(0xFF).to_string(), "11111111");
        assert_eq!(SwitchState(0x80).to_string(), "10000000");
    }

    #[test]
    fn test_switch_state_is_on() {
        let state = SwitchState(0b1000_0010);
        assert!(state.is_on(1));
        assert!(state.is_on(7));
        assert!(!state.is_on(0));
        assert!(!state.is_on(8));
    }

    #[test]
    fn test_access_mode_directions() {
        assert!(AccessMode::Read.is_read());
        assert!(!AccessMode::Read.is_write());
        assert!(AccessMode::Write.is_write());
        assert!(!AccessMode::Write.is_read());
        assert!(AccessMode::ReadWrite.is_read());
        assert!(AccessMode::ReadWrite.is_write());
    }

    #[test]
    fn test_access_mode_from_open_flags() {
        assert_eq!(AccessMode::from_open_flags(0), Some(AccessMode::Read));
        assert_eq!(AccessMode::from_open_flags(1), Some(AccessMode::Write));
        assert_eq!(AccessMode::from_open_flags(2), Some(AccessMode::ReadWrite));
        assert_eq!(AccessMode::from_open_flags(3), None);
        // O_NONBLOCK and friends don't affect the access mode
        assert_eq!(AccessMode::from_open_flags(0o4002), Some(AccessMode::ReadWrite));
    }
}
