//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The device context is not published or no longer live
    #[error("No such device")]
    NoSuchDevice,

    /// A required exclusive-access slot is held by another session
    #[error("Device busy")]
    DeviceBusy,

    /// Endpoint layout does not match the supported configuration
    #[error("No matching device configuration: {0}")]
    Unsupported(String),

    /// Buffer, request or id allocation failed
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Transfer submission or completion error
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Bulk transfer exceeded its timeout bound
    #[error("Transfer timed out")]
    Timeout,

    /// Copy to or from caller memory failed
    #[error("Bad address")]
    Fault,

    /// Session was not opened for this transfer direction
    #[error("Session not opened for {0}")]
    AccessDenied(&'static str),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Conventional errno for a file-interface adapter to hand back verbatim
    pub fn errno(&self) -> i32 {
        match self {
            Error::NoSuchDevice | Error::Unsupported(_) => 19, // ENODEV
            Error::DeviceBusy => 16,                           // EBUSY
            Error::ResourceExhausted(_) => 12,                 // ENOMEM
            Error::Timeout => 110,                             // ETIMEDOUT
            Error::Fault => 14,                                // EFAULT
            Error::AccessDenied(_) => 9,                       // EBADF
            Error::Config(_) => 22,                            // EINVAL
            Error::Io(e) => e.raw_os_error().unwrap_or(5),
            Error::TransportFailure(_) | Error::Channel(_) => 5, // EIO
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
