//! CUDA accelerator backed by `cudarc`.
//!
//! Device blocks are `CudaSlice<u8>`; host blocks are plain `Vec<u8>`.
//! cudarc's safe API has no page-locked allocator, so pinned requests fall
//! back to pageable host memory.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaSlice, DeviceSlice};
use parking_lot::Mutex;

use crate::storage::IdGen;
use crate::{Accelerator, BufferHandle, Device, KoreError, Result};

enum Block {
    Host(Vec<u8>),
    Cuda { idx: usize, slice: CudaSlice<u8> },
}

impl Block {
    fn len(&self) -> usize {
        match self {
            Block::Host(v) => v.len(),
            Block::Cuda { slice, .. } => slice.len(),
        }
    }

    fn device(&self) -> Device {
        match self {
            Block::Host(_) => Device::Cpu,
            Block::Cuda { idx, .. } => Device::Cuda(*idx),
        }
    }
}

#[derive(Default)]
struct CudaInner {
    devices: HashMap<usize, Arc<CudaDevice>>,
    blocks: HashMap<BufferHandle, Block>,
    in_use: HashMap<Device, usize>,
}

/// Accelerator over real CUDA devices.
#[derive(Default)]
pub struct CudaAccelerator {
    ids: IdGen,
    inner: Mutex<CudaInner>,
}

impl fmt::Debug for CudaAccelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CudaAccelerator")
            .field("devices", &inner.devices.len())
            .field("blocks", &inner.blocks.len())
            .finish()
    }
}

fn driver_err(what: &str, e: impl fmt::Display) -> KoreError {
    KoreError::Device(format!("{what}: {e}"))
}

impl CudaAccelerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn device(inner: &mut CudaInner, idx: usize) -> Result<Arc<CudaDevice>> {
        if let Some(dev) = inner.devices.get(&idx) {
            return Ok(Arc::clone(dev));
        }
        let dev = CudaDevice::new(idx).map_err(|e| driver_err(&format!("CUDA device init {idx}"), e))?;
        inner.devices.insert(idx, Arc::clone(&dev));
        Ok(dev)
    }

    fn insert(&self, inner: &mut CudaInner, block: Block) -> BufferHandle {
        let handle = BufferHandle::from_raw(self.ids.next_raw());
        *inner.in_use.entry(block.device()).or_insert(0) += block.len();
        inner.blocks.insert(handle, block);
        handle
    }
}

impl Accelerator for CudaAccelerator {
    fn allocate(&self, nbytes: usize, device: Device) -> Result<BufferHandle> {
        let mut inner = self.inner.lock();
        let block = match device {
            Device::Cpu => Block::Host(vec![0u8; nbytes]),
            Device::Cuda(idx) => {
                let dev = Self::device(&mut inner, idx)?;
                let slice = dev.alloc_zeros::<u8>(nbytes).map_err(|e| {
                    tracing::debug!("CUDA alloc of {nbytes} bytes on {device} failed: {e}");
                    KoreError::OutOfMemory { device, requested: nbytes, available: 0 }
                })?;
                Block::Cuda { idx, slice }
            }
        };
        Ok(self.insert(&mut inner, block))
    }

    fn free(&self, handle: BufferHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let block = inner.blocks.remove(&handle).ok_or(KoreError::InvalidHandle(handle))?;
        if let Some(used) = inner.in_use.get_mut(&block.device()) {
            *used = used.saturating_sub(block.len());
        }
        Ok(())
    }

    fn copy(&self, src: BufferHandle, dst: BufferHandle, nbytes: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut dst_block = inner.blocks.remove(&dst).ok_or(KoreError::InvalidHandle(dst))?;
        let result = copy_blocks(&mut inner, src, &mut dst_block, dst, nbytes);
        inner.blocks.insert(dst, dst_block);
        result
    }

    fn write(&self, dst: BufferHandle, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let size = inner.blocks.get(&dst).ok_or(KoreError::InvalidHandle(dst))?.len();
        if offset + bytes.len() > size {
            return Err(KoreError::OutOfBounds { handle: dst, offset, len: bytes.len(), size });
        }
        let idx = match inner.blocks.get(&dst) {
            Some(Block::Cuda { idx, .. }) => Some(*idx),
            _ => None,
        };
        let dev = idx.map(|i| Self::device(&mut inner, i)).transpose()?;
        match (inner.blocks.get_mut(&dst), dev) {
            (Some(Block::Host(v)), _) => {
                v[offset..offset + bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
            (Some(Block::Cuda { slice, .. }), Some(dev)) => {
                let mut view = slice.slice_mut(offset..offset + bytes.len());
                dev.htod_sync_copy_into(bytes, &mut view)
                    .map_err(|e| driver_err("H2D write", e))
            }
            _ => Err(KoreError::InvalidHandle(dst)),
        }
    }

    fn read(&self, src: BufferHandle, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        let size = inner.blocks.get(&src).ok_or(KoreError::InvalidHandle(src))?.len();
        if offset + len > size {
            return Err(KoreError::OutOfBounds { handle: src, offset, len, size });
        }
        let idx = match inner.blocks.get(&src) {
            Some(Block::Cuda { idx, .. }) => Some(*idx),
            _ => None,
        };
        let dev = idx.map(|i| Self::device(&mut inner, i)).transpose()?;
        match (inner.blocks.get(&src), dev) {
            (Some(Block::Host(v)), _) => Ok(v[offset..offset + len].to_vec()),
            (Some(Block::Cuda { slice, .. }), Some(dev)) => {
                let mut out = vec![0u8; len];
                dev.dtoh_sync_copy_into(&slice.slice(offset..offset + len), &mut out)
                    .map_err(|e| driver_err("D2H read", e))?;
                Ok(out)
            }
            _ => Err(KoreError::InvalidHandle(src)),
        }
    }

    fn device_of(&self, handle: BufferHandle) -> Result<Device> {
        let inner = self.inner.lock();
        inner
            .blocks
            .get(&handle)
            .map(Block::device)
            .ok_or(KoreError::InvalidHandle(handle))
    }

    fn bytes_in_use(&self, device: Device) -> usize {
        self.inner.lock().in_use.get(&device).copied().unwrap_or(0)
    }
}

fn copy_blocks(
    inner: &mut CudaInner,
    src: BufferHandle,
    dst_block: &mut Block,
    dst: BufferHandle,
    nbytes: usize,
) -> Result<()> {
    let src_len = inner.blocks.get(&src).ok_or(KoreError::InvalidHandle(src))?.len();
    if nbytes > src_len {
        return Err(KoreError::OutOfBounds { handle: src, offset: 0, len: nbytes, size: src_len });
    }
    if nbytes > dst_block.len() {
        return Err(KoreError::OutOfBounds { handle: dst, offset: 0, len: nbytes, size: dst_block.len() });
    }
    // Any CUDA endpoint's device context drives the transfer.
    let ctx_idx = match (inner.blocks.get(&src), &*dst_block) {
        (Some(Block::Cuda { idx, .. }), _) | (_, Block::Cuda { idx, .. }) => Some(*idx),
        _ => None,
    };
    let dev = ctx_idx.map(|i| CudaAccelerator::device(inner, i)).transpose()?;

    match (inner.blocks.get(&src), dst_block, dev) {
        (Some(Block::Host(s)), Block::Host(d), _) => {
            d[..nbytes].copy_from_slice(&s[..nbytes]);
            Ok(())
        }
        (Some(Block::Host(s)), Block::Cuda { slice, .. }, Some(dev)) => {
            let mut view = slice.slice_mut(0..nbytes);
            dev.htod_sync_copy_into(&s[..nbytes], &mut view)
                .map_err(|e| driver_err("H2D copy", e))
        }
        (Some(Block::Cuda { slice, .. }), Block::Host(d), Some(dev)) => dev
            .dtoh_sync_copy_into(&slice.slice(0..nbytes), &mut d[..nbytes])
            .map_err(|e| driver_err("D2H copy", e)),
        (Some(Block::Cuda { slice: s, .. }), Block::Cuda { slice: d, .. }, Some(dev)) => {
            let mut view = d.slice_mut(0..nbytes);
            dev.dtod_copy(&s.slice(0..nbytes), &mut view)
                .map_err(|e| driver_err("D2D copy", e))
        }
        _ => Err(KoreError::InvalidHandle(src)),
    }
}
