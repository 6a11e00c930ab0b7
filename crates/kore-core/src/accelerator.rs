//! The accelerator collaborator interface.
//!
//! Everything above this layer moves bytes only through these calls, so the
//! same store and engine drive a simulated device in tests and a real one
//! behind the `cuda` feature.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{BufferHandle, Device, Result};

/// Allocation strategy for host-side destinations.
///
/// Pinned (page-locked) memory speeds up device round-trips; it is a
/// performance policy only and never changes the bytes that land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostAlloc {
    #[default]
    Pinned,
    Pageable,
}

impl HostAlloc {
    /// Policy from a `pin_memory` flag.
    pub fn from_pin_memory(pin: bool) -> Self {
        if pin {
            HostAlloc::Pinned
        } else {
            HostAlloc::Pageable
        }
    }
}

/// Raw memory operations a device backend must provide.
///
/// All operations are blocking: when a call returns, the bytes have landed.
pub trait Accelerator: Send + Sync + fmt::Debug {
    /// Allocate `nbytes` on `device`. Fails with `OutOfMemory` when the
    /// device cannot satisfy the request.
    fn allocate(&self, nbytes: usize, device: Device) -> Result<BufferHandle>;

    /// Allocate page-locked host memory. Backends without pinned memory
    /// fall back to a plain host allocation.
    fn allocate_pinned(&self, nbytes: usize) -> Result<BufferHandle> {
        self.allocate(nbytes, Device::Cpu)
    }

    /// Allocate on `device`, honouring `host` when the device is the host.
    fn allocate_on(&self, nbytes: usize, device: Device, host: HostAlloc) -> Result<BufferHandle> {
        match (device, host) {
            (Device::Cpu, HostAlloc::Pinned) => self.allocate_pinned(nbytes),
            _ => self.allocate(nbytes, device),
        }
    }

    /// Release an allocation.
    fn free(&self, handle: BufferHandle) -> Result<()>;

    /// Copy the first `nbytes` of `src` into the start of `dst`.
    fn copy(&self, src: BufferHandle, dst: BufferHandle, nbytes: usize) -> Result<()>;

    /// Write `bytes` into `dst` starting at `offset`.
    fn write(&self, dst: BufferHandle, offset: usize, bytes: &[u8]) -> Result<()>;

    /// Read `len` bytes of `src` starting at `offset`.
    fn read(&self, src: BufferHandle, offset: usize, len: usize) -> Result<Vec<u8>>;

    /// Device an allocation lives on.
    fn device_of(&self, handle: BufferHandle) -> Result<Device>;

    /// Bytes currently allocated on `device`.
    fn bytes_in_use(&self, device: Device) -> usize;
}
