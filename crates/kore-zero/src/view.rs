use kore_core::{BufferHandle, DType, Device, Shape, StorageId, ViewId};

use crate::ShardSpec;

/// A non-owning logical view into a storage.
///
/// Views never hold a buffer handle. They name the storage by its stable
/// [`StorageId`] plus a byte offset and are resolved through the store's
/// indirection table on every access, so relocating the storage re-points
/// every view at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub id: ViewId,
    pub storage: StorageId,
    /// Byte offset from the start of the storage.
    pub byte_offset: usize,
    pub shape: Shape,
    pub dtype: DType,
    pub label: String,
    /// The logical shard this view exposes, for per-parameter shard views.
    pub shard: Option<ShardSpec>,
}

impl View {
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn nbytes(&self) -> usize {
        self.dtype.storage_bytes(self.numel())
    }
}

/// A view resolved against the indirection table at one instant.
///
/// Only valid until the next relocation of `storage`; do not cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedView {
    pub view: ViewId,
    pub storage: StorageId,
    pub handle: BufferHandle,
    pub device: Device,
    pub byte_offset: usize,
    pub nbytes: usize,
}
