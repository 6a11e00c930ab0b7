//! Maps each state category to the storage that currently backs it.
//!
//! The registry only records identities (storage and view ids). Where the
//! bytes live right now is always read fresh from the [`TensorStore`], since
//! the engine moves them between calls.

use std::collections::BTreeMap;

use kore_core::{Device, StorageId, ViewId};
use kore_zero::{StorageInfo, StoreError, TensorStore, View};

use crate::{OffloadError, Result, StateCategory, StorageLayout};

/// Identities of the storage backing one category.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CategoryStorage {
    /// Storages owned by the category, in relocation order.
    pub storages: Vec<StorageId>,
    /// Views into those storages held by other subsystems.
    pub views: Vec<ViewId>,
    /// Set when the category is a single contiguous buffer.
    pub buffer: Option<StorageId>,
}

impl CategoryStorage {
    pub fn flat(storages: Vec<StorageId>) -> Self {
        Self { storages, ..Default::default() }
    }

    pub fn with_views(storage: StorageId, views: Vec<ViewId>) -> Self {
        Self { storages: vec![storage], views, buffer: None }
    }

    pub fn buffer(buffer: StorageId, aliases: Vec<ViewId>) -> Self {
        Self { storages: vec![buffer], views: aliases, buffer: Some(buffer) }
    }
}

/// A category's storage as it stands at the moment of the query.
#[derive(Debug, Clone)]
pub struct Located {
    pub category: StateCategory,
    pub layout: StorageLayout,
    pub storages: Vec<StorageInfo>,
    pub views: Vec<View>,
    pub buffer: Option<StorageId>,
}

impl Located {
    /// Total bytes across the category's storages.
    pub fn nbytes(&self) -> usize {
        self.storages.iter().map(|s| s.nbytes).sum()
    }

    /// Current device of each storage.
    pub fn devices(&self) -> Vec<Device> {
        self.storages.iter().map(|s| s.device).collect()
    }

    pub fn storage_ids(&self) -> Vec<StorageId> {
        self.storages.iter().map(|s| s.id).collect()
    }
}

/// Per-worker registry of state categories.
#[derive(Debug, Default)]
pub struct StateRegistry {
    entries: BTreeMap<StateCategory, CategoryStorage>,
    unavailable: BTreeMap<StateCategory, String>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `category` as backed by `storage`.
    pub fn register(&mut self, category: StateCategory, storage: CategoryStorage) {
        self.unavailable.remove(&category);
        self.entries.insert(category, storage);
    }

    /// Record why `category` does not apply to this training configuration.
    pub fn mark_unavailable(&mut self, category: StateCategory, reason: impl Into<String>) {
        self.entries.remove(&category);
        self.unavailable.insert(category, reason.into());
    }

    /// Categories currently tracked, in relocation order.
    pub fn tracked(&self) -> Vec<StateCategory> {
        self.entries.keys().copied().collect()
    }

    pub fn is_tracked(&self, category: StateCategory) -> bool {
        self.entries.contains_key(&category)
    }

    /// Identities registered for `category`.
    pub fn storage(&self, category: StateCategory) -> Result<&CategoryStorage> {
        self.entries.get(&category).ok_or_else(|| self.unavailable_error(category))
    }

    /// Locate the live storage behind `category`.
    ///
    /// Fails with `CategoryUnavailable` when the category does not apply to
    /// the current training configuration, and with `AliasCorruption` when a
    /// registered storage no longer exists.
    pub fn locate(&self, category: StateCategory, store: &TensorStore) -> Result<Located> {
        let entry = self.storage(category)?;
        let storages = entry
            .storages
            .iter()
            .map(|id| store.info(*id))
            .collect::<kore_zero::Result<Vec<_>>>()
            .map_err(|e| OffloadError::from_store(category, registered_gone(e)))?;
        let views = entry
            .views
            .iter()
            .map(|id| store.view(*id))
            .collect::<kore_zero::Result<Vec<_>>>()
            .map_err(|e| OffloadError::from_store(category, e))?;
        Ok(Located {
            category,
            layout: category.layout(),
            storages,
            views,
            buffer: entry.buffer,
        })
    }

    fn unavailable_error(&self, category: StateCategory) -> OffloadError {
        let reason = self
            .unavailable
            .get(&category)
            .cloned()
            .unwrap_or_else(|| "not registered for this training configuration".into());
        OffloadError::CategoryUnavailable { category, reason }
    }
}

/// A registered storage missing from the store was freed behind the
/// registry's back.
fn registered_gone(err: StoreError) -> StoreError {
    match err {
        StoreError::UnknownStorage(storage) => StoreError::AliasMismatch {
            storage,
            detail: "registered storage was freed".into(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kore_core::{DType, HostAlloc, Shape, SimAccelerator};

    #[test]
    fn test_locate_reflects_current_device() {
        let store = TensorStore::new(Arc::new(SimAccelerator::new()));
        let flat = store.allocate("lp", DType::BF16, 8, Device::Cuda(0)).unwrap();
        let v = store.create_view(flat, 0, Shape::flat(8), DType::BF16, "w").unwrap();

        let mut reg = StateRegistry::new();
        reg.register(StateCategory::LpParams, CategoryStorage::with_views(flat, vec![v]));

        let loc = reg.locate(StateCategory::LpParams, &store).unwrap();
        assert_eq!(loc.devices(), vec![Device::Cuda(0)]);
        assert_eq!(loc.nbytes(), 16);
        assert_eq!(loc.layout, StorageLayout::PerParamViews);
        assert_eq!(loc.views.len(), 1);

        store.relocate(flat, Device::Cpu, HostAlloc::Pageable).unwrap();
        let loc = reg.locate(StateCategory::LpParams, &store).unwrap();
        assert_eq!(loc.devices(), vec![Device::Cpu]);
    }

    #[test]
    fn test_unavailable_categories() {
        let store = TensorStore::new(Arc::new(SimAccelerator::new()));
        let mut reg = StateRegistry::new();
        reg.mark_unavailable(StateCategory::OptimStates, "no optimizer attached");

        match reg.locate(StateCategory::OptimStates, &store) {
            Err(OffloadError::CategoryUnavailable { category, reason }) => {
                assert_eq!(category, StateCategory::OptimStates);
                assert_eq!(reason, "no optimizer attached");
            }
            other => panic!("expected CategoryUnavailable, got {other:?}"),
        }
        assert!(matches!(
            reg.locate(StateCategory::HpParams, &store),
            Err(OffloadError::CategoryUnavailable { .. })
        ));
        assert!(reg.tracked().is_empty());
    }

    #[test]
    fn test_tracked_order() {
        let mut reg = StateRegistry::new();
        let id = StorageId::from_raw(1);
        reg.register(StateCategory::LpGrads, CategoryStorage::flat(vec![id]));
        reg.register(StateCategory::HpParams, CategoryStorage::flat(vec![id]));
        assert_eq!(reg.tracked(), vec![StateCategory::HpParams, StateCategory::LpGrads]);
        assert!(reg.is_tracked(StateCategory::LpGrads));
    }
}
