//! Contiguous working buffers and the views aliased into them.
//!
//! A contiguous buffer batches many per-parameter tensors (typically the
//! gradient reduction bucket) into one allocation so they can be reduced
//! and moved as a group. Each parameter sees its slot through a [`View`]
//! carved out of the buffer at an aligned byte offset.
//!
//! [`View`]: crate::View

use std::collections::{BTreeMap, HashMap};

use kore_core::{BufferHandle, DType, Device, HostAlloc, Shape, StorageId, ViewId};
use parking_lot::Mutex;

use crate::{Result, StoreError, TensorStore};

/// Byte alignment of every carved slot.
pub const SLOT_ALIGN: usize = 16;

/// Alias layout of a buffer: each view's byte offset from the buffer base.
pub type AliasMap = BTreeMap<ViewId, usize>;

#[derive(Debug)]
struct ContiguousBuffer {
    dtype: DType,
    capacity: usize,
    cursor: usize,
    aliases: Vec<ViewId>,
}

/// Manager for the contiguous buffers of one worker.
///
/// The physical allocation belongs to the [`TensorStore`]; the manager
/// tracks the carve cursor and which views alias each buffer.
#[derive(Debug, Default)]
pub struct BufferManager {
    buffers: Mutex<HashMap<StorageId, ContiguousBuffer>>,
}

impl BufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a contiguous buffer of `numel` elements on `device`.
    pub fn create(
        &self,
        store: &TensorStore,
        label: impl Into<String>,
        dtype: DType,
        numel: usize,
        device: Device,
    ) -> Result<StorageId> {
        let id = store.allocate(label, dtype, numel, device)?;
        self.buffers.lock().insert(
            id,
            ContiguousBuffer {
                dtype,
                capacity: dtype.storage_bytes(numel),
                cursor: 0,
                aliases: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Whether `id` is a buffer managed here.
    pub fn contains(&self, id: StorageId) -> bool {
        self.buffers.lock().contains_key(&id)
    }

    /// Carve the next aligned slot of `shape` out of `buffer`.
    pub fn carve(&self, store: &TensorStore, buffer: StorageId, shape: Shape, label: impl Into<String>) -> Result<ViewId> {
        let mut buffers = self.buffers.lock();
        let buf = buffers.get_mut(&buffer).ok_or(StoreError::NotABuffer(buffer))?;
        let offset = align_up(buf.cursor, SLOT_ALIGN);
        let needed = buf.dtype.storage_bytes(shape.numel());
        if offset + needed > buf.capacity {
            return Err(StoreError::BufferExhausted {
                buffer,
                needed,
                remaining: buf.capacity.saturating_sub(offset),
            });
        }
        let view = store.create_view(buffer, offset, shape, buf.dtype, label)?;
        buf.cursor = offset + needed;
        buf.aliases.push(view);
        Ok(view)
    }

    /// Bytes still available for carving in `buffer`.
    pub fn remaining(&self, buffer: StorageId) -> Result<usize> {
        let buffers = self.buffers.lock();
        let buf = buffers.get(&buffer).ok_or(StoreError::NotABuffer(buffer))?;
        Ok(buf.capacity.saturating_sub(align_up(buf.cursor, SLOT_ALIGN)))
    }

    /// Views carved out of `buffer`, in carve order.
    pub fn aliases(&self, buffer: StorageId) -> Result<Vec<ViewId>> {
        let buffers = self.buffers.lock();
        let buf = buffers.get(&buffer).ok_or(StoreError::NotABuffer(buffer))?;
        Ok(buf.aliases.clone())
    }

    /// Capture the current alias layout of `buffer`.
    ///
    /// Every alias is resolved through the store, so a view that no longer
    /// points into this buffer (or whose storage was freed) is reported as
    /// alias corruption.
    pub fn snapshot_aliasing(&self, store: &TensorStore, buffer: StorageId) -> Result<AliasMap> {
        let aliases = self.aliases(buffer)?;
        let base = store.info(buffer)?.handle;
        let mut map = AliasMap::new();
        for view in aliases {
            let r = store.resolve(view)?;
            if r.storage != buffer || r.handle != base {
                return Err(StoreError::AliasMismatch {
                    storage: buffer,
                    detail: format!("{view} resolves to {} via {}", r.storage, r.handle),
                });
            }
            map.insert(view, r.byte_offset);
        }
        Ok(map)
    }

    /// Relocate `buffer` to `destination` and re-derive every alias against
    /// the new base.
    ///
    /// Atomic in the same sense as [`TensorStore::relocate_many`]. Returns
    /// the new handle and the alias map observed after the move, which is
    /// guaranteed equal to the one observed before it.
    pub fn relocate_with_aliases(
        &self,
        store: &TensorStore,
        buffer: StorageId,
        destination: Device,
        host: HostAlloc,
    ) -> Result<(BufferHandle, AliasMap)> {
        let before = self.snapshot_aliasing(store, buffer)?;
        let handle = store.relocate(buffer, destination, host)?;
        let after = self.snapshot_aliasing(store, buffer)?;
        if after != before {
            tracing::error!("alias layout of {buffer} changed during relocation to {destination}");
            return Err(StoreError::AliasMismatch {
                storage: buffer,
                detail: format!("{} aliases before, {} after", before.len(), after.len()),
            });
        }
        Ok((handle, after))
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}
