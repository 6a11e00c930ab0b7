//! Offload/restore engine.
//!
//! The engine is an explicit per-session context object: it holds one
//! [`RelocationRecord`] per offloaded category and nothing else. Callers
//! pass the [`ZeroState`] to every call, so two sessions in one process
//! never share bookkeeping.
//!
//! # Contract
//!
//! - `offload(S, host)` followed by `restore()` leaves every byte and every
//!   device placement of every category in `S` exactly as it was.
//! - Source device allocations are really freed on offload, so accelerator
//!   memory in use drops by the bytes moved.
//! - A category cannot be offloaded twice without a restore in between.
//! - If category *k* of a batch fails, categories before it stay offloaded
//!   and nothing after it is attempted.
//!
//! Callers must quiesce every user of a category's views before offloading
//! it. Views held through a [`ViewLease`](kore_zero::ViewLease) are
//! detected and refuse the move; unleased use is not.

use std::collections::BTreeMap;

use kore_core::{BufferHandle, Device, HostAlloc, StorageId, ViewId};
use kore_zero::{AliasMap, StoreError, TensorStore};

use crate::registry::Located;
use crate::{CategorySelection, OffloadError, Result, StateCategory, StorageLayout, ZeroState};

/// Tunables for relocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffloadOptions {
    /// Allocation strategy for host destinations.
    pub host_alloc: HostAlloc,
}

/// One storage moved by an offload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovedStorage {
    pub storage: StorageId,
    pub from_device: Device,
    pub from_handle: BufferHandle,
    /// Handle the storage was moved to; restore expects to find it there.
    pub to_handle: BufferHandle,
    pub nbytes: usize,
}

/// What an offload did to one category, enough to undo it exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationRecord {
    pub category: StateCategory,
    pub layout: StorageLayout,
    pub target: Device,
    pub storages: Vec<MovedStorage>,
    /// Storage and byte offset of every view into the category.
    pub views: BTreeMap<ViewId, (StorageId, usize)>,
    /// Alias layout of the contiguous buffer, when the category is one.
    pub aliases: Option<(StorageId, AliasMap)>,
}

impl RelocationRecord {
    pub fn nbytes(&self) -> usize {
        self.storages.iter().map(|s| s.nbytes).sum()
    }

    /// Devices the category's storages lived on before the offload.
    pub fn original_devices(&self) -> Vec<Device> {
        self.storages.iter().map(|s| s.from_device).collect()
    }
}

/// Result of a successful `offload`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffloadReport {
    pub categories: Vec<StateCategory>,
    pub bytes: usize,
}

/// Result of a successful `restore`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub categories: Vec<StateCategory>,
    pub bytes: usize,
}

/// Per-worker offload/restore bookkeeping.
#[derive(Debug, Default)]
pub struct OffloadEngine {
    options: OffloadOptions,
    records: BTreeMap<StateCategory, RelocationRecord>,
}

impl OffloadEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: OffloadOptions) -> Self {
        Self { options, records: BTreeMap::new() }
    }

    pub fn options(&self) -> OffloadOptions {
        self.options
    }

    /// Whether `category` is currently offloaded.
    pub fn is_offloaded(&self, category: StateCategory) -> bool {
        self.records.contains_key(&category)
    }

    /// Offloaded categories, in restore order.
    pub fn offloaded(&self) -> Vec<StateCategory> {
        self.records.keys().copied().collect()
    }

    pub fn record(&self, category: StateCategory) -> Option<&RelocationRecord> {
        self.records.get(&category)
    }

    /// Move the selected categories of `state` to `target`.
    ///
    /// `include` is a [`CategorySelection`]; `CategorySelection::All` (or
    /// `None`) means every category the registry tracks. An empty selection
    /// is a no-op.
    ///
    /// Selection errors (`AlreadyOffloaded`, `CategoryUnavailable`) are
    /// raised before any byte moves. A relocation failure for one category
    /// leaves earlier categories offloaded, leaves the failing category on
    /// its original device, and skips the rest.
    pub fn offload(
        &mut self,
        state: &ZeroState,
        include: impl Into<CategorySelection>,
        target: Device,
    ) -> Result<OffloadReport> {
        if !target.is_cpu() {
            return Err(OffloadError::UnsupportedTarget(target));
        }

        let categories = include.into().resolve(&state.registry().tracked());
        if categories.is_empty() {
            tracing::debug!("rank {}: offload called with an empty selection", state.rank());
            return Ok(OffloadReport::default());
        }

        let mut batch = Vec::with_capacity(categories.len());
        for &category in &categories {
            if self.records.contains_key(&category) {
                return Err(OffloadError::AlreadyOffloaded(category));
            }
            batch.push(state.registry().locate(category, state.store())?);
        }

        let mut report = OffloadReport::default();
        for located in batch {
            let category = located.category;
            let record = self
                .relocate_out(state, &located, target)
                .map_err(|e| OffloadError::from_store(category, e))?;
            tracing::info!(
                "rank {}: offloaded {} ({:.2} MB) to {}",
                state.rank(),
                category,
                record.nbytes() as f64 / (1024.0 * 1024.0),
                target,
            );
            report.bytes += record.nbytes();
            report.categories.push(category);
            self.records.insert(category, record);
        }
        Ok(report)
    }

    fn relocate_out(&self, state: &ZeroState, located: &Located, target: Device) -> kore_zero::Result<RelocationRecord> {
        let store = state.store();
        let views: BTreeMap<ViewId, (StorageId, usize)> =
            located.views.iter().map(|v| (v.id, (v.storage, v.byte_offset))).collect();
        check_views(store, &views)?;

        let (handles, aliases) = match located.buffer {
            Some(buffer) => {
                let (handle, map) =
                    state.buffers().relocate_with_aliases(store, buffer, target, self.options.host_alloc)?;
                (vec![handle], Some((buffer, map)))
            }
            None => (
                store.relocate_many(&located.storage_ids(), target, self.options.host_alloc)?,
                None,
            ),
        };

        let storages = located
            .storages
            .iter()
            .zip(handles)
            .map(|(info, to_handle)| MovedStorage {
                storage: info.id,
                from_device: info.device,
                from_handle: info.handle,
                to_handle,
                nbytes: info.nbytes,
            })
            .collect();

        check_views(store, &views)?;

        Ok(RelocationRecord {
            category: located.category,
            layout: located.layout,
            target,
            storages,
            views,
            aliases,
        })
    }

    /// Move every offloaded category back to its original device.
    ///
    /// Categories are restored in the fixed [`StateCategory`] order,
    /// whatever order they were offloaded in. Each record is checked
    /// against the store first; a storage that moved behind the engine's
    /// back, or a view that no longer resolves to its recorded offset, is
    /// reported as fatal `AliasCorruption`.
    ///
    /// With nothing offloaded this returns the benign `NothingToRestore`
    /// and touches nothing. If one category fails to come back, it and the
    /// categories after it keep their records so the call can be retried.
    pub fn restore(&mut self, state: &ZeroState) -> Result<RestoreReport> {
        if self.records.is_empty() {
            return Err(OffloadError::NothingToRestore);
        }

        let mut report = RestoreReport::default();
        let categories: Vec<StateCategory> = self.records.keys().copied().collect();
        for category in categories {
            let Some(record) = self.records.get(&category) else {
                continue;
            };
            if let Err(e) = self.relocate_back(state, record) {
                let err = OffloadError::from_store(category, e);
                if err.is_fatal() {
                    tracing::error!("rank {}: {err}", state.rank());
                }
                return Err(err);
            }
            let nbytes = record.nbytes();
            tracing::info!(
                "rank {}: restored {} ({:.2} MB)",
                state.rank(),
                category,
                nbytes as f64 / (1024.0 * 1024.0),
            );
            self.records.remove(&category);
            report.bytes += nbytes;
            report.categories.push(category);
        }
        Ok(report)
    }

    fn relocate_back(&self, state: &ZeroState, record: &RelocationRecord) -> kore_zero::Result<()> {
        let store = state.store();

        for moved in &record.storages {
            let info = match store.info(moved.storage) {
                Ok(info) => info,
                Err(StoreError::UnknownStorage(id)) => {
                    return Err(StoreError::AliasMismatch {
                        storage: id,
                        detail: "storage was freed while offloaded".into(),
                    })
                }
                Err(e) => return Err(e),
            };
            if info.handle != moved.to_handle {
                return Err(StoreError::AliasMismatch {
                    storage: moved.storage,
                    detail: format!(
                        "expected it at {} on {}, found {} on {}",
                        moved.to_handle, record.target, info.handle, info.device
                    ),
                });
            }
        }
        check_views(store, &record.views)?;

        match &record.aliases {
            Some((buffer, expected)) => {
                let device = record.storages.first().map_or(Device::Cpu, |m| m.from_device);
                let (_, aliases) =
                    state.buffers().relocate_with_aliases(store, *buffer, device, self.options.host_alloc)?;
                if &aliases != expected {
                    return Err(StoreError::AliasMismatch {
                        storage: *buffer,
                        detail: "alias offsets differ from those recorded at offload".into(),
                    });
                }
            }
            None => {
                // Storages of one category may come from different devices.
                let mut by_device: BTreeMap<Device, Vec<StorageId>> = BTreeMap::new();
                for moved in &record.storages {
                    by_device.entry(moved.from_device).or_default().push(moved.storage);
                }
                for (device, ids) in by_device {
                    store.relocate_many(&ids, device, self.options.host_alloc)?;
                }
            }
        }

        check_views(store, &record.views)
    }
}

impl Drop for OffloadEngine {
    fn drop(&mut self) {
        if !self.records.is_empty() {
            tracing::warn!(
                "offload engine dropped with {} categories still offloaded: {:?}",
                self.records.len(),
                self.offloaded(),
            );
        }
    }
}

/// Every view must still resolve into its recorded storage at its recorded
/// offset.
fn check_views(store: &TensorStore, views: &BTreeMap<ViewId, (StorageId, usize)>) -> kore_zero::Result<()> {
    for (&view, &(storage, offset)) in views {
        let r = match store.resolve(view) {
            Ok(r) => r,
            Err(StoreError::UnknownView(_)) => {
                return Err(StoreError::AliasMismatch {
                    storage,
                    detail: format!("{view} was dropped while its storage was relocated"),
                })
            }
            Err(e) => return Err(e),
        };
        if r.storage != storage || r.byte_offset != offset {
            return Err(StoreError::AliasMismatch {
                storage,
                detail: format!("{view} now resolves to {} at byte {}", r.storage, r.byte_offset),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kore_core::{Accelerator, SimAccelerator};

    const GPU: Device = Device::Cuda(0);

    fn state(sim: &Arc<SimAccelerator>) -> ZeroState {
        ZeroState::builder(sim.clone())
            .device(GPU)
            .param("embed.weight", &[64, 16])
            .param("fc.weight", &[16, 16])
            .param("fc.bias", &[16])
            .seed(11)
            .build()
            .unwrap()
    }

    #[test]
    fn test_offload_restore_roundtrip_all() {
        let sim = Arc::new(SimAccelerator::new());
        let state = state(&sim);
        let before: Vec<_> = StateCategory::ALL.iter().map(|c| state.category_bytes(*c).unwrap()).collect();
        let gpu_before = sim.bytes_in_use(GPU);

        let mut engine = OffloadEngine::new();
        let report = engine.offload(&state, CategorySelection::All, Device::Cpu).unwrap();
        assert_eq!(report.categories, StateCategory::ALL.to_vec());
        assert_eq!(sim.bytes_in_use(GPU), gpu_before - report.bytes);
        let optim = engine.record(StateCategory::OptimStates).unwrap();
        assert_eq!(optim.original_devices(), vec![GPU, GPU]);
        assert_eq!(optim.layout, StorageLayout::FlatShard);
        for c in StateCategory::ALL {
            assert!(engine.is_offloaded(c));
            assert!(state.category_devices(c).unwrap().iter().all(Device::is_cpu));
        }

        let restored = engine.restore(&state).unwrap();
        assert_eq!(restored.bytes, report.bytes);
        assert!(engine.offloaded().is_empty());
        assert_eq!(sim.bytes_in_use(GPU), gpu_before);
        assert_eq!(sim.bytes_in_use(Device::Cpu), 0);
        for (c, bytes) in StateCategory::ALL.iter().zip(&before) {
            assert_eq!(&state.category_bytes(*c).unwrap(), bytes);
            assert!(state.category_devices(*c).unwrap().iter().all(|d| *d == GPU));
        }
    }

    #[test]
    fn test_double_offload_is_rejected_without_side_effects() {
        let sim = Arc::new(SimAccelerator::new());
        let state = state(&sim);
        let mut engine = OffloadEngine::new();
        engine.offload(&state, StateCategory::LpGrads, Device::Cpu).unwrap();
        let gpu = sim.bytes_in_use(GPU);

        let err = engine
            .offload(&state, [StateCategory::HpParams, StateCategory::LpGrads], Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, OffloadError::AlreadyOffloaded(StateCategory::LpGrads)));
        assert_eq!(sim.bytes_in_use(GPU), gpu);
        assert!(!engine.is_offloaded(StateCategory::HpParams));
        engine.restore(&state).unwrap();
    }

    #[test]
    fn test_restore_with_nothing_offloaded() {
        let sim = Arc::new(SimAccelerator::new());
        let state = state(&sim);
        let mut engine = OffloadEngine::new();
        let allocs = sim.stats().allocations;
        let err = engine.restore(&state).unwrap_err();
        assert!(err.is_benign());
        assert_eq!(sim.stats().allocations, allocs);
    }

    #[test]
    fn test_unsupported_target() {
        let sim = Arc::new(SimAccelerator::new());
        let state = state(&sim);
        let mut engine = OffloadEngine::new();
        let err = engine.offload(&state, CategorySelection::All, Device::Cuda(1)).unwrap_err();
        assert!(matches!(err, OffloadError::UnsupportedTarget(Device::Cuda(1))));
        assert!(engine.offloaded().is_empty());
    }

    #[test]
    fn test_pinned_policy_is_honoured() {
        let sim = Arc::new(SimAccelerator::new());
        let state = state(&sim);

        let mut pageable = OffloadEngine::with_options(OffloadOptions { host_alloc: HostAlloc::Pageable });
        pageable.offload(&state, StateCategory::HpParams, Device::Cpu).unwrap();
        assert_eq!(sim.stats().pinned, 0);
        pageable.restore(&state).unwrap();

        let mut pinned = OffloadEngine::new();
        pinned.offload(&state, StateCategory::HpParams, Device::Cpu).unwrap();
        let record = pinned.record(StateCategory::HpParams).unwrap();
        assert!(sim.is_pinned(record.storages[0].to_handle));
        pinned.restore(&state).unwrap();
    }

    #[test]
    fn test_storage_moved_behind_engine_is_fatal() {
        let sim = Arc::new(SimAccelerator::new());
        let state = state(&sim);
        let mut engine = OffloadEngine::new();
        engine.offload(&state, StateCategory::HpParams, Device::Cpu).unwrap();

        let id = engine.record(StateCategory::HpParams).unwrap().storages[0].storage;
        state.store().relocate(id, GPU, HostAlloc::Pageable).unwrap();

        let err = engine.restore(&state).unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert!(engine.is_offloaded(StateCategory::HpParams));
    }

    #[test]
    fn test_freed_buffer_is_alias_corruption() {
        let sim = Arc::new(SimAccelerator::new());
        let state = state(&sim);
        let mut engine = OffloadEngine::new();
        engine.offload(&state, StateCategory::ContiguousGradBuffer, Device::Cpu).unwrap();

        let buffer = engine.record(StateCategory::ContiguousGradBuffer).unwrap().storages[0].storage;
        state.store().release(buffer).unwrap();

        let err = engine.restore(&state).unwrap_err();
        assert!(matches!(
            err,
            OffloadError::AliasCorruption { category: StateCategory::ContiguousGradBuffer, .. }
        ));
    }

    #[test]
    fn test_freed_storage_fails_offload_as_corruption() {
        let sim = Arc::new(SimAccelerator::new());
        let state = state(&sim);
        let lp = state.registry().storage(StateCategory::LpParams).unwrap().storages[0];
        state.store().release(lp).unwrap();

        let mut engine = OffloadEngine::new();
        let err = engine.offload(&state, StateCategory::LpParams, Device::Cpu).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, OffloadError::AliasCorruption { category: StateCategory::LpParams, .. }));
        assert!(engine.offloaded().is_empty());
    }

    #[test]
    fn test_leased_view_blocks_offload() {
        let sim = Arc::new(SimAccelerator::new());
        let state = state(&sim);
        let view = state.registry().storage(StateCategory::LpGrads).unwrap().views[0];
        let lease = state.store().lease(view).unwrap();

        let mut engine = OffloadEngine::new();
        let err = engine.offload(&state, StateCategory::LpGrads, Device::Cpu).unwrap_err();
        assert!(matches!(
            err,
            OffloadError::Relocation { source: StoreError::ViewsInFlight { .. }, .. }
        ));
        assert!(!engine.is_offloaded(StateCategory::LpGrads));
        drop(lease);
        engine.offload(&state, StateCategory::LpGrads, Device::Cpu).unwrap();
        engine.restore(&state).unwrap();
    }
}
