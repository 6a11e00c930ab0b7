use crate::{BufferHandle, Device};

/// Errors raised by accelerator memory operations.
#[derive(Debug, thiserror::Error)]
pub enum KoreError {
    #[error("out of memory on {device}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        device: Device,
        requested: usize,
        available: usize,
    },

    #[error("unknown buffer handle {0}")]
    InvalidHandle(BufferHandle),

    #[error("access of {len} bytes at offset {offset} exceeds {handle} ({size} bytes)")]
    OutOfBounds {
        handle: BufferHandle,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("device {0} is not supported by this accelerator")]
    UnsupportedDevice(Device),

    #[error("device error: {0}")]
    Device(String),
}

impl KoreError {
    /// Whether this error is an allocation failure.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, KoreError::OutOfMemory { .. })
    }
}
