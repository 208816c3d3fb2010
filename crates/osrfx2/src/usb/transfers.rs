//! Transfer completion statuses and error mapping
//!
//! Asynchronous requests report back through a [`CompletionStatus`]; the
//! synchronous paths convert `rusb::Error` into the driver's error taxonomy
//! with [`map_rusb_error`].

use common::Error;

/// How an asynchronous request finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// Request was cancelled by its submitter (unlink / kill)
    Cancelled,
    /// Device or endpoint went away under the request
    Shutdown,
    Failed(rusb::Error),
}

impl CompletionStatus {
    /// Statuses produced by client-initiated cancellation or device shutdown
    pub fn is_benign(self) -> bool {
        matches!(self, CompletionStatus::Cancelled | CompletionStatus::Shutdown)
    }

    pub fn from_rusb(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Interrupted => CompletionStatus::Cancelled,
            rusb::Error::NoDevice => CompletionStatus::Shutdown,
            e => CompletionStatus::Failed(e),
        }
    }
}

/// Map rusb::Error to the driver's error taxonomy
pub fn map_rusb_error(err: rusb::Error) -> Error {
    match err {
        rusb::Error::Timeout => Error::Timeout,
        rusb::Error::NoDevice => Error::NoSuchDevice,
        rusb::Error::NoMem => Error::ResourceExhausted(err.to_string()),
        rusb::Error::Busy => Error::DeviceBusy,
        _ => Error::TransportFailure(err.to_string()),
    }
}

/// Allocate a zeroed transfer buffer without aborting on allocation failure
pub fn alloc_buffer(len: usize) -> common::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|e| Error::ResourceExhausted(format!("{} byte transfer buffer: {}", len, e)))?;
    buffer.resize(len, 0);
    Ok(buffer)
}
