use kore_core::{KoreError, StorageId, ViewId};

use crate::TensorId;

/// Errors raised by the partitioned tensor store and buffer manager.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Device(#[from] KoreError),

    #[error("unknown storage {0}")]
    UnknownStorage(StorageId),

    #[error("unknown view {0}")]
    UnknownView(ViewId),

    #[error("{view} points at storage {storage}, which has been freed")]
    AliasCorruption { view: ViewId, storage: StorageId },

    #[error("alias layout of {storage} changed across relocation: {detail}")]
    AliasMismatch { storage: StorageId, detail: String },

    #[error("storage {storage} has {leases} outstanding view lease(s); quiesce users before relocating")]
    ViewsInFlight { storage: StorageId, leases: usize },

    #[error("view of {len} bytes at offset {offset} does not fit in {storage} ({size} bytes)")]
    ViewOutOfBounds {
        storage: StorageId,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("contiguous buffer {buffer} is exhausted: need {needed} bytes, {remaining} remaining")]
    BufferExhausted {
        buffer: StorageId,
        needed: usize,
        remaining: usize,
    },

    #[error("{0} is not a contiguous buffer")]
    NotABuffer(StorageId),

    #[error("shards of {tensor} do not tile its {numel} elements: {detail}")]
    InvalidPartition {
        tensor: TensorId,
        numel: usize,
        detail: String,
    },
}

impl StoreError {
    /// Whether the failure was a destination allocation running out of memory.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, StoreError::Device(e) if e.is_out_of_memory())
    }

    /// Whether a view was found dangling or re-pointed inconsistently.
    pub fn is_alias_corruption(&self) -> bool {
        matches!(self, StoreError::AliasCorruption { .. } | StoreError::AliasMismatch { .. })
    }
}
