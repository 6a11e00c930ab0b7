//! Host-backed accelerator simulation.
//!
//! Every device is backed by ordinary heap memory, but allocations are
//! accounted per device so memory savings are observable exactly as on a
//! real GPU. Capacity limits and one-shot allocation faults make the
//! out-of-memory paths testable.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::storage::IdGen;
use crate::{Accelerator, BufferHandle, Device, KoreError, Result};

/// Allocation counters for leak and policy checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// Allocation requests, including failed ones.
    pub attempts: u64,
    /// Successful allocations.
    pub allocations: u64,
    /// Successful frees.
    pub frees: u64,
    /// Allocation requests that failed.
    pub failed: u64,
    /// Successful pinned host allocations.
    pub pinned: u64,
    /// Handles currently alive.
    pub live: usize,
}

#[derive(Debug)]
struct Block {
    device: Device,
    data: Vec<u8>,
    pinned: bool,
}

#[derive(Debug, Clone, Copy)]
struct FaultPlan {
    device: Device,
    /// Allocations on `device` that still succeed before the fault fires.
    remaining: usize,
}

#[derive(Debug, Default)]
struct SimInner {
    blocks: HashMap<BufferHandle, Block>,
    capacity: HashMap<Device, usize>,
    in_use: HashMap<Device, usize>,
    peak: HashMap<Device, usize>,
    fault: Option<FaultPlan>,
    stats: AllocStats,
}

/// In-process accelerator with per-device accounting.
#[derive(Debug, Default)]
pub struct SimAccelerator {
    ids: IdGen,
    inner: Mutex<SimInner>,
}

impl SimAccelerator {
    /// Unlimited memory on every device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: cap the bytes that may be live on `device`.
    pub fn with_capacity(self, device: Device, bytes: usize) -> Self {
        self.set_capacity(device, Some(bytes));
        self
    }

    /// Set or clear the capacity limit for `device`.
    pub fn set_capacity(&self, device: Device, bytes: Option<usize>) {
        let mut inner = self.inner.lock();
        match bytes {
            Some(b) => inner.capacity.insert(device, b),
            None => inner.capacity.remove(&device),
        };
    }

    /// Let the next `n` allocations on `device` succeed, then fail the one
    /// after with `OutOfMemory`. The fault fires once.
    pub fn fail_allocation_after(&self, device: Device, n: usize) {
        self.inner.lock().fault = Some(FaultPlan { device, remaining: n });
    }

    /// Snapshot of allocation counters.
    pub fn stats(&self) -> AllocStats {
        self.inner.lock().stats
    }

    /// Highest `bytes_in_use` observed on `device`.
    pub fn peak_bytes(&self, device: Device) -> usize {
        self.inner.lock().peak.get(&device).copied().unwrap_or(0)
    }

    /// Whether `handle` is a pinned host allocation.
    pub fn is_pinned(&self, handle: BufferHandle) -> bool {
        self.inner
            .lock()
            .blocks
            .get(&handle)
            .map(|b| b.pinned)
            .unwrap_or(false)
    }

    fn alloc_block(&self, nbytes: usize, device: Device, pinned: bool) -> Result<BufferHandle> {
        let mut inner = self.inner.lock();
        inner.stats.attempts += 1;

        if let Some(plan) = inner.fault.as_mut() {
            if plan.device == device {
                if plan.remaining == 0 {
                    inner.fault = None;
                    inner.stats.failed += 1;
                    let available = available(&inner, device);
                    tracing::debug!("sim: injected allocation failure on {device} ({nbytes} bytes)");
                    return Err(KoreError::OutOfMemory { device, requested: nbytes, available });
                }
                plan.remaining -= 1;
            }
        }

        let available = available(&inner, device);
        if nbytes > available {
            inner.stats.failed += 1;
            return Err(KoreError::OutOfMemory { device, requested: nbytes, available });
        }

        let handle = BufferHandle::from_raw(self.ids.next_raw());
        inner.blocks.insert(handle, Block { device, data: vec![0u8; nbytes], pinned });
        let used = inner.in_use.entry(device).or_insert(0);
        *used += nbytes;
        let used = *used;
        let peak = inner.peak.entry(device).or_insert(0);
        *peak = (*peak).max(used);
        inner.stats.allocations += 1;
        inner.stats.live += 1;
        if pinned {
            inner.stats.pinned += 1;
        }
        Ok(handle)
    }
}

fn available(inner: &SimInner, device: Device) -> usize {
    match inner.capacity.get(&device) {
        Some(cap) => cap.saturating_sub(inner.in_use.get(&device).copied().unwrap_or(0)),
        None => usize::MAX,
    }
}

fn check_bounds(handle: BufferHandle, size: usize, offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(KoreError::OutOfBounds { handle, offset, len, size }),
    }
}

impl Accelerator for SimAccelerator {
    fn allocate(&self, nbytes: usize, device: Device) -> Result<BufferHandle> {
        self.alloc_block(nbytes, device, false)
    }

    fn allocate_pinned(&self, nbytes: usize) -> Result<BufferHandle> {
        self.alloc_block(nbytes, Device::Cpu, true)
    }

    fn free(&self, handle: BufferHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let block = inner.blocks.remove(&handle).ok_or(KoreError::InvalidHandle(handle))?;
        if let Some(used) = inner.in_use.get_mut(&block.device) {
            *used = used.saturating_sub(block.data.len());
        }
        inner.stats.frees += 1;
        inner.stats.live -= 1;
        Ok(())
    }

    fn copy(&self, src: BufferHandle, dst: BufferHandle, nbytes: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if src == dst {
            let size = inner.blocks.get(&src).ok_or(KoreError::InvalidHandle(src))?.data.len();
            return check_bounds(src, size, 0, nbytes);
        }
        // Take the destination out so both blocks can be borrowed at once.
        let mut dst_block = inner.blocks.remove(&dst).ok_or(KoreError::InvalidHandle(dst))?;
        let result = match inner.blocks.get(&src) {
            None => Err(KoreError::InvalidHandle(src)),
            Some(src_block) => check_bounds(src, src_block.data.len(), 0, nbytes)
                .and_then(|_| check_bounds(dst, dst_block.data.len(), 0, nbytes))
                .map(|_| dst_block.data[..nbytes].copy_from_slice(&src_block.data[..nbytes])),
        };
        inner.blocks.insert(dst, dst_block);
        result
    }

    fn write(&self, dst: BufferHandle, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let block = inner.blocks.get_mut(&dst).ok_or(KoreError::InvalidHandle(dst))?;
        check_bounds(dst, block.data.len(), offset, bytes.len())?;
        block.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, src: BufferHandle, offset: usize, len: usize) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let block = inner.blocks.get(&src).ok_or(KoreError::InvalidHandle(src))?;
        check_bounds(src, block.data.len(), offset, len)?;
        Ok(block.data[offset..offset + len].to_vec())
    }

    fn device_of(&self, handle: BufferHandle) -> Result<Device> {
        let inner = self.inner.lock();
        inner
            .blocks
            .get(&handle)
            .map(|b| b.device)
            .ok_or(KoreError::InvalidHandle(handle))
    }

    fn bytes_in_use(&self, device: Device) -> usize {
        self.inner.lock().in_use.get(&device).copied().unwrap_or(0)
    }
}
