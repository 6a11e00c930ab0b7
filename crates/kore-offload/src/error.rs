use kore_core::Device;
use kore_zero::StoreError;

use crate::{ConfigError, StateCategory};

/// Errors surfaced by the offload/restore engine.
#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    #[error("state category {category} is not available: {reason}")]
    CategoryUnavailable {
        category: StateCategory,
        reason: String,
    },

    #[error("state category {0} is already offloaded; restore it first")]
    AlreadyOffloaded(StateCategory),

    #[error("nothing to restore: no state categories are offloaded")]
    NothingToRestore,

    #[error("out of memory while relocating {category}")]
    OutOfMemory {
        category: StateCategory,
        #[source]
        source: StoreError,
    },

    /// A view was found pointing at freed or foreign storage. Continuing
    /// risks silent numeric corruption; the training process should abort.
    #[error("alias corruption in {category}: {detail}")]
    AliasCorruption {
        category: StateCategory,
        detail: String,
    },

    #[error("cannot offload to {0}: only host memory is a supported target")]
    UnsupportedTarget(Device),

    #[error("relocation of {category} failed")]
    Relocation {
        category: StateCategory,
        #[source]
        source: StoreError,
    },

    #[error("failed to set up training state")]
    Setup(#[source] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OffloadError {
    /// Attach category context to a store failure.
    pub fn from_store(category: StateCategory, source: StoreError) -> Self {
        if source.is_out_of_memory() {
            OffloadError::OutOfMemory { category, source }
        } else if source.is_alias_corruption() {
            OffloadError::AliasCorruption { category, detail: source.to_string() }
        } else {
            OffloadError::Relocation { category, source }
        }
    }

    /// Unrecoverable: the process must not keep training.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OffloadError::AliasCorruption { .. })
    }

    /// A no-op signal rather than a failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, OffloadError::NothingToRestore)
    }

    /// The category the error is about, if any.
    pub fn category(&self) -> Option<StateCategory> {
        match self {
            OffloadError::CategoryUnavailable { category, .. }
            | OffloadError::OutOfMemory { category, .. }
            | OffloadError::AliasCorruption { category, .. }
            | OffloadError::Relocation { category, .. } => Some(*category),
            OffloadError::AlreadyOffloaded(category) => Some(*category),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kore_core::{KoreError, StorageId, ViewId};

    #[test]
    fn test_store_errors_gain_category_context() {
        let oom = StoreError::Device(KoreError::OutOfMemory { device: Device::Cpu, requested: 8, available: 0 });
        let err = OffloadError::from_store(StateCategory::LpGrads, oom);
        assert!(matches!(err, OffloadError::OutOfMemory { category: StateCategory::LpGrads, .. }));
        assert!(!err.is_fatal());

        let alias = StoreError::AliasCorruption { view: ViewId::from_raw(1), storage: StorageId::from_raw(2) };
        let err = OffloadError::from_store(StateCategory::ContiguousGradBuffer, alias);
        assert!(err.is_fatal());
        assert_eq!(err.category(), Some(StateCategory::ContiguousGradBuffer));

        let other = StoreError::UnknownStorage(StorageId::from_raw(3));
        let err = OffloadError::from_store(StateCategory::HpParams, other);
        assert!(matches!(err, OffloadError::Relocation { .. }));
    }

    #[test]
    fn test_benign() {
        assert!(OffloadError::NothingToRestore.is_benign());
        assert!(!OffloadError::NothingToRestore.is_fatal());
        assert!(!OffloadError::AlreadyOffloaded(StateCategory::HpParams).is_benign());
        assert_eq!(OffloadError::NothingToRestore.category(), None);
    }
}
