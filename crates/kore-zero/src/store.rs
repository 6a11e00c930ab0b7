//! Partitioned tensor store: owns shard storage and relocates it between
//! device and host without ever leaving a view dangling.
//!
//! Every storage has one entry in an indirection table mapping its stable
//! [`StorageId`] to the current physical [`BufferHandle`] and device. Views
//! resolve through that table, so a relocation is a single entry update
//! made under the table's write lock: no reader can observe the window
//! between "old buffer freed" and "views re-pointed".

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kore_core::storage::IdGen;
use kore_core::{Accelerator, BufferHandle, DType, Device, HostAlloc, Shape, StorageId, ViewId};
use parking_lot::RwLock;

use crate::{ResolvedView, Result, ShardSpec, StoreError, View};

struct StorageEntry {
    label: String,
    handle: BufferHandle,
    device: Device,
    dtype: DType,
    numel: usize,
    nbytes: usize,
    leases: Arc<AtomicUsize>,
}

impl StorageEntry {
    fn info(&self, id: StorageId) -> StorageInfo {
        StorageInfo {
            id,
            label: self.label.clone(),
            handle: self.handle,
            device: self.device,
            dtype: self.dtype,
            numel: self.numel,
            nbytes: self.nbytes,
            leases: self.leases.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time description of one storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub id: StorageId,
    pub label: String,
    pub handle: BufferHandle,
    pub device: Device,
    pub dtype: DType,
    pub numel: usize,
    pub nbytes: usize,
    /// Outstanding view leases at the time of the snapshot.
    pub leases: usize,
}

#[derive(Default)]
struct StoreInner {
    storages: HashMap<StorageId, StorageEntry>,
    views: HashMap<ViewId, View>,
}

/// A storage whose bytes have been copied to a fresh allocation but whose
/// table entry has not been switched yet.
struct PendingMove {
    id: StorageId,
    old: BufferHandle,
    new: BufferHandle,
    from: Device,
    nbytes: usize,
}

/// Owner of all shard and buffer storage for one worker.
pub struct TensorStore {
    accel: Arc<dyn Accelerator>,
    ids: IdGen,
    inner: RwLock<StoreInner>,
}

impl fmt::Debug for TensorStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("TensorStore")
            .field("storages", &inner.storages.len())
            .field("views", &inner.views.len())
            .finish()
    }
}

/// RAII marker that a view is in active use by some subsystem.
///
/// While any lease on a storage is alive, relocating that storage fails
/// with [`StoreError::ViewsInFlight`] instead of moving bytes out from
/// under the user.
#[derive(Debug)]
pub struct ViewLease {
    view: ViewId,
    storage: StorageId,
    count: Arc<AtomicUsize>,
}

impl ViewLease {
    pub fn view(&self) -> ViewId {
        self.view
    }

    pub fn storage(&self) -> StorageId {
        self.storage
    }
}

impl Drop for ViewLease {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TensorStore {
    pub fn new(accel: Arc<dyn Accelerator>) -> Self {
        Self {
            accel,
            ids: IdGen::new(),
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// The accelerator this store allocates from.
    pub fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.accel
    }

    // =========================================================================
    // Storage lifecycle
    // =========================================================================

    /// Allocate zeroed storage for `numel` elements of `dtype` on `device`.
    pub fn allocate(&self, label: impl Into<String>, dtype: DType, numel: usize, device: Device) -> Result<StorageId> {
        let label = label.into();
        let nbytes = dtype.storage_bytes(numel);
        let handle = self.accel.allocate(nbytes, device)?;
        let id = StorageId::from_raw(self.ids.next_raw());
        tracing::trace!("allocated {id} '{label}' ({nbytes} bytes) on {device}");
        self.inner.write().storages.insert(
            id,
            StorageEntry {
                label,
                handle,
                device,
                dtype,
                numel,
                nbytes,
                leases: Arc::new(AtomicUsize::new(0)),
            },
        );
        Ok(id)
    }

    /// Free a storage. Views over it are left in place and will resolve to
    /// [`StoreError::AliasCorruption`].
    pub fn release(&self, id: StorageId) -> Result<()> {
        let entry = self
            .inner
            .write()
            .storages
            .remove(&id)
            .ok_or(StoreError::UnknownStorage(id))?;
        self.accel.free(entry.handle)?;
        Ok(())
    }

    /// Snapshot of one storage's table entry.
    pub fn info(&self, id: StorageId) -> Result<StorageInfo> {
        let inner = self.inner.read();
        inner
            .storages
            .get(&id)
            .map(|e| e.info(id))
            .ok_or(StoreError::UnknownStorage(id))
    }

    /// Current device of a storage.
    pub fn device_of(&self, id: StorageId) -> Result<Device> {
        Ok(self.info(id)?.device)
    }

    /// Snapshot of every storage, ordered by id.
    pub fn storages(&self) -> Vec<StorageInfo> {
        let inner = self.inner.read();
        let mut all: Vec<StorageInfo> = inner.storages.iter().map(|(id, e)| e.info(*id)).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Bytes of storage this store currently holds on `device`.
    pub fn bytes_on(&self, device: Device) -> usize {
        let inner = self.inner.read();
        inner.storages.values().filter(|e| e.device == device).map(|e| e.nbytes).sum()
    }

    // =========================================================================
    // Byte access
    // =========================================================================

    /// Write `bytes` into a storage at `byte_offset`.
    pub fn write(&self, id: StorageId, byte_offset: usize, bytes: &[u8]) -> Result<()> {
        let inner = self.inner.read();
        let entry = inner.storages.get(&id).ok_or(StoreError::UnknownStorage(id))?;
        self.accel.write(entry.handle, byte_offset, bytes)?;
        Ok(())
    }

    /// Read the full contents of a storage, wherever it currently lives.
    pub fn read(&self, id: StorageId) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let entry = inner.storages.get(&id).ok_or(StoreError::UnknownStorage(id))?;
        Ok(self.accel.read(entry.handle, 0, entry.nbytes)?)
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Create a view of `shape`/`dtype` starting `byte_offset` bytes into
    /// `storage`.
    pub fn create_view(
        &self,
        storage: StorageId,
        byte_offset: usize,
        shape: Shape,
        dtype: DType,
        label: impl Into<String>,
    ) -> Result<ViewId> {
        self.insert_view(storage, byte_offset, shape, dtype, label.into(), None)
    }

    /// Create a flat view over this rank's `shard` of a logical tensor,
    /// stored `byte_offset` bytes into `storage`.
    pub fn create_shard_view(
        &self,
        storage: StorageId,
        byte_offset: usize,
        shard: ShardSpec,
        dtype: DType,
        label: impl Into<String>,
    ) -> Result<ViewId> {
        self.insert_view(storage, byte_offset, Shape::flat(shard.len), dtype, label.into(), Some(shard))
    }

    fn insert_view(
        &self,
        storage: StorageId,
        byte_offset: usize,
        shape: Shape,
        dtype: DType,
        label: String,
        shard: Option<ShardSpec>,
    ) -> Result<ViewId> {
        let mut inner = self.inner.write();
        let entry = inner.storages.get(&storage).ok_or(StoreError::UnknownStorage(storage))?;
        let len = dtype.storage_bytes(shape.numel());
        if byte_offset + len > entry.nbytes {
            return Err(StoreError::ViewOutOfBounds { storage, offset: byte_offset, len, size: entry.nbytes });
        }
        let id = ViewId::from_raw(self.ids.next_raw());
        inner.views.insert(
            id,
            View { id, storage, byte_offset, shape, dtype, label, shard },
        );
        Ok(id)
    }

    /// The logical description of a view.
    pub fn view(&self, id: ViewId) -> Result<View> {
        self.inner.read().views.get(&id).cloned().ok_or(StoreError::UnknownView(id))
    }

    /// All views over `storage`, ordered by id.
    pub fn views_of(&self, storage: StorageId) -> Vec<View> {
        let inner = self.inner.read();
        let mut views: Vec<View> = inner.views.values().filter(|v| v.storage == storage).cloned().collect();
        views.sort_by_key(|v| v.id);
        views
    }

    /// Resolve a view through the indirection table.
    pub fn resolve(&self, id: ViewId) -> Result<ResolvedView> {
        let inner = self.inner.read();
        resolve_in(&inner, id)
    }

    pub fn read_view(&self, id: ViewId) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let r = resolve_in(&inner, id)?;
        Ok(self.accel.read(r.handle, r.byte_offset, r.nbytes)?)
    }

    pub fn write_view(&self, id: ViewId, bytes: &[u8]) -> Result<()> {
        let inner = self.inner.read();
        let r = resolve_in(&inner, id)?;
        if bytes.len() != r.nbytes {
            return Err(StoreError::ViewOutOfBounds {
                storage: r.storage,
                offset: r.byte_offset,
                len: bytes.len(),
                size: r.nbytes,
            });
        }
        self.accel.write(r.handle, r.byte_offset, bytes)?;
        Ok(())
    }

    /// Mark a view as in use. Relocation of its storage is refused until
    /// the lease is dropped.
    pub fn lease(&self, id: ViewId) -> Result<ViewLease> {
        let inner = self.inner.read();
        let r = resolve_in(&inner, id)?;
        let entry = inner.storages.get(&r.storage).ok_or(StoreError::UnknownStorage(r.storage))?;
        entry.leases.fetch_add(1, Ordering::AcqRel);
        Ok(ViewLease { view: id, storage: r.storage, count: Arc::clone(&entry.leases) })
    }

    // =========================================================================
    // Relocation
    // =========================================================================

    /// Move one storage to `destination`. See [`relocate_many`](Self::relocate_many).
    pub fn relocate(&self, id: StorageId, destination: Device, host: HostAlloc) -> Result<BufferHandle> {
        let handles = self.relocate_many(&[id], destination, host)?;
        handles.into_iter().next().ok_or(StoreError::UnknownStorage(id))
    }

    /// Move a set of storages to `destination`, all or nothing.
    ///
    /// Every destination buffer is allocated and filled before any table
    /// entry changes. If an allocation or copy fails, the fresh buffers are
    /// released and every storage stays on its original device with its
    /// original handle. On success the sources are freed and every view
    /// over the moved storages resolves to the new buffers; a source whose
    /// free fails is logged and leaked.
    ///
    /// Storages already on `destination` are left as they are. Returns the
    /// current handle of each requested storage, in request order.
    pub fn relocate_many(&self, ids: &[StorageId], destination: Device, host: HostAlloc) -> Result<Vec<BufferHandle>> {
        let mut inner = self.inner.write();

        let mut plan: Vec<(StorageId, BufferHandle, Device, usize)> = Vec::with_capacity(ids.len());
        for &id in ids {
            if plan.iter().any(|(seen, ..)| *seen == id) {
                continue;
            }
            let entry = inner.storages.get(&id).ok_or(StoreError::UnknownStorage(id))?;
            let leases = entry.leases.load(Ordering::Acquire);
            if leases > 0 {
                return Err(StoreError::ViewsInFlight { storage: id, leases });
            }
            plan.push((id, entry.handle, entry.device, entry.nbytes));
        }

        let mut pending: Vec<PendingMove> = Vec::with_capacity(plan.len());
        for &(id, old, from, nbytes) in &plan {
            if from == destination {
                continue;
            }
            match self.accel.allocate_on(nbytes, destination, host) {
                Ok(new) => pending.push(PendingMove { id, old, new, from, nbytes }),
                Err(e) => {
                    tracing::debug!("allocation of {nbytes} bytes on {destination} for {id} failed: {e}");
                    self.discard(&pending);
                    return Err(e.into());
                }
            }
        }

        for mv in &pending {
            if let Err(e) = self.accel.copy(mv.old, mv.new, mv.nbytes) {
                self.discard(&pending);
                return Err(e.into());
            }
        }

        for mv in &pending {
            if let Some(entry) = inner.storages.get_mut(&mv.id) {
                entry.handle = mv.new;
                entry.device = destination;
            }
            tracing::debug!("relocated {} ({} bytes) {} -> {}", mv.id, mv.nbytes, mv.from, destination);
        }

        // Committed. A source that fails to free is leaked.
        for mv in &pending {
            if let Err(e) = self.accel.free(mv.old) {
                tracing::error!("failed to free source buffer {} of {}: {e}", mv.old, mv.id);
            }
        }

        ids.iter()
            .map(|id| {
                inner
                    .storages
                    .get(id)
                    .map(|e| e.handle)
                    .ok_or(StoreError::UnknownStorage(*id))
            })
            .collect()
    }

    fn discard(&self, pending: &[PendingMove]) {
        for mv in pending {
            if let Err(e) = self.accel.free(mv.new) {
                tracing::warn!("failed to release staging buffer {} for {}: {e}", mv.new, mv.id);
            }
        }
    }
}

fn resolve_in(inner: &StoreInner, id: ViewId) -> Result<ResolvedView> {
    let view = inner.views.get(&id).ok_or(StoreError::UnknownView(id))?;
    let entry = inner
        .storages
        .get(&view.storage)
        .ok_or(StoreError::AliasCorruption { view: id, storage: view.storage })?;
    Ok(ResolvedView {
        view: id,
        storage: view.storage,
        handle: entry.handle,
        device: entry.device,
        byte_offset: view.byte_offset,
        nbytes: view.nbytes(),
    })
}

impl Drop for TensorStore {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for (id, entry) in inner.storages.drain() {
            if let Err(e) = self.accel.free(entry.handle) {
                tracing::warn!("failed to free {id} on teardown: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kore_core::SimAccelerator;

    const GPU: Device = Device::Cuda(0);

    fn store() -> (Arc<SimAccelerator>, TensorStore) {
        let sim = Arc::new(SimAccelerator::new());
        let store = TensorStore::new(sim.clone());
        (sim, store)
    }

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 31 + 7) as u8).collect()
    }

    #[test]
    fn test_relocate_is_byte_exact_and_frees_source() {
        let (sim, store) = store();
        let id = store.allocate("w", DType::F32, 16, GPU).unwrap();
        store.write(id, 0, &pattern(64)).unwrap();
        let old = store.info(id).unwrap().handle;

        let new = store.relocate(id, Device::Cpu, HostAlloc::Pinned).unwrap();
        assert_ne!(old, new);
        assert_eq!(sim.bytes_in_use(GPU), 0);
        assert_eq!(sim.bytes_in_use(Device::Cpu), 64);
        assert!(sim.is_pinned(new));
        assert_eq!(store.device_of(id).unwrap(), Device::Cpu);
        assert_eq!(store.read(id).unwrap(), pattern(64));

        store.relocate(id, GPU, HostAlloc::Pinned).unwrap();
        assert_eq!(sim.bytes_in_use(Device::Cpu), 0);
        assert_eq!(store.read(id).unwrap(), pattern(64));
    }

    #[test]
    fn test_views_follow_relocation() {
        let (_sim, store) = store();
        let id = store.allocate("flat", DType::F32, 8, GPU).unwrap();
        store.write(id, 0, &pattern(32)).unwrap();
        let v = store.create_view(id, 8, Shape::new(&[2, 2]), DType::F32, "p1").unwrap();
        let before = store.read_view(v).unwrap();

        let handle = store.relocate(id, Device::Cpu, HostAlloc::Pageable).unwrap();
        let r = store.resolve(v).unwrap();
        assert_eq!(r.handle, handle);
        assert_eq!(r.device, Device::Cpu);
        assert_eq!(r.byte_offset, 8);
        assert_eq!(store.read_view(v).unwrap(), before);
    }

    #[test]
    fn test_failed_relocation_leaves_everything_in_place() {
        let sim = Arc::new(SimAccelerator::new().with_capacity(Device::Cpu, 100));
        let store = TensorStore::new(sim.clone());
        let a = store.allocate("a", DType::U8, 60, GPU).unwrap();
        let b = store.allocate("b", DType::U8, 60, GPU).unwrap();
        store.write(a, 0, &pattern(60)).unwrap();
        let (ha, hb) = (store.info(a).unwrap().handle, store.info(b).unwrap().handle);

        let err = store.relocate_many(&[a, b], Device::Cpu, HostAlloc::Pageable).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(store.info(a).unwrap().handle, ha);
        assert_eq!(store.info(b).unwrap().handle, hb);
        assert_eq!(store.device_of(a).unwrap(), GPU);
        assert_eq!(sim.bytes_in_use(Device::Cpu), 0);
        assert_eq!(sim.bytes_in_use(GPU), 120);
        assert_eq!(store.read(a).unwrap(), pattern(60));
    }

    #[test]
    fn test_relocate_to_same_device_is_noop() {
        let (sim, store) = store();
        let id = store.allocate("w", DType::F32, 4, GPU).unwrap();
        let h = store.info(id).unwrap().handle;
        assert_eq!(store.relocate(id, GPU, HostAlloc::Pinned).unwrap(), h);
        assert_eq!(sim.stats().allocations, 1);
    }

    #[test]
    fn test_lease_blocks_relocation() {
        let (_sim, store) = store();
        let id = store.allocate("g", DType::BF16, 8, GPU).unwrap();
        let v = store.create_view(id, 0, Shape::flat(8), DType::BF16, "g").unwrap();
        let lease = store.lease(v).unwrap();
        assert_eq!(store.info(id).unwrap().leases, 1);
        match store.relocate(id, Device::Cpu, HostAlloc::Pinned) {
            Err(StoreError::ViewsInFlight { leases, .. }) => assert_eq!(leases, 1),
            other => panic!("expected ViewsInFlight, got {other:?}"),
        }
        drop(lease);
        assert!(store.relocate(id, Device::Cpu, HostAlloc::Pinned).is_ok());
    }

    #[test]
    fn test_released_storage_makes_views_corrupt() {
        let (sim, store) = store();
        let id = store.allocate("w", DType::F32, 4, GPU).unwrap();
        let v = store.create_view(id, 0, Shape::flat(4), DType::F32, "w").unwrap();
        store.release(id).unwrap();
        assert_eq!(sim.bytes_in_use(GPU), 0);
        let err = store.resolve(v).unwrap_err();
        assert!(err.is_alias_corruption());
    }

    #[test]
    fn test_view_bounds() {
        let (_sim, store) = store();
        let id = store.allocate("w", DType::F32, 4, GPU).unwrap();
        assert!(matches!(
            store.create_view(id, 4, Shape::flat(4), DType::F32, "x"),
            Err(StoreError::ViewOutOfBounds { .. })
        ));
        let v = store.create_view(id, 4, Shape::flat(3), DType::F32, "x").unwrap();
        assert!(store.write_view(v, &[0u8; 4]).is_err());
        store.write_view(v, &[1u8; 12]).unwrap();
        assert_eq!(&store.read(id).unwrap()[4..], &[1u8; 12]);
    }

    #[test]
    fn test_shard_views() {
        use crate::{partition, TensorId};

        let (_sim, store) = store();
        let shards = partition(TensorId(0), 10, 2);
        let flat = store.allocate("lp.flat", DType::BF16, shards[1].len, GPU).unwrap();
        let v = store.create_shard_view(flat, 0, shards[1], DType::BF16, "w").unwrap();
        let view = store.view(v).unwrap();
        assert_eq!(view.shard, Some(shards[1]));
        assert_eq!(view.nbytes(), 10);
        assert_eq!(store.views_of(flat), vec![view]);
    }

    #[test]
    fn test_drop_frees_allocations() {
        let sim = Arc::new(SimAccelerator::new());
        {
            let store = TensorStore::new(sim.clone());
            store.allocate("a", DType::F32, 10, GPU).unwrap();
            store.allocate("b", DType::F32, 10, Device::Cpu).unwrap();
        }
        assert_eq!(sim.stats().live, 0);
    }

    /// Accelerator whose `free` fails while `fail_frees` is set.
    #[derive(Debug)]
    struct StickyFree {
        inner: SimAccelerator,
        fail_frees: std::sync::atomic::AtomicBool,
    }

    impl Accelerator for StickyFree {
        fn allocate(&self, nbytes: usize, device: Device) -> kore_core::Result<BufferHandle> {
            self.inner.allocate(nbytes, device)
        }
        fn free(&self, handle: BufferHandle) -> kore_core::Result<()> {
            if self.fail_frees.load(Ordering::Acquire) {
                return Err(kore_core::KoreError::Device(format!("free of {handle} rejected")));
            }
            self.inner.free(handle)
        }
        fn copy(&self, src: BufferHandle, dst: BufferHandle, nbytes: usize) -> kore_core::Result<()> {
            self.inner.copy(src, dst, nbytes)
        }
        fn write(&self, dst: BufferHandle, offset: usize, bytes: &[u8]) -> kore_core::Result<()> {
            self.inner.write(dst, offset, bytes)
        }
        fn read(&self, src: BufferHandle, offset: usize, len: usize) -> kore_core::Result<Vec<u8>> {
            self.inner.read(src, offset, len)
        }
        fn device_of(&self, handle: BufferHandle) -> kore_core::Result<Device> {
            self.inner.device_of(handle)
        }
        fn bytes_in_use(&self, device: Device) -> usize {
            self.inner.bytes_in_use(device)
        }
    }

    #[test]
    fn test_failed_source_free_keeps_committed_move() {
        let accel = Arc::new(StickyFree {
            inner: SimAccelerator::new(),
            fail_frees: std::sync::atomic::AtomicBool::new(false),
        });
        let store = TensorStore::new(accel.clone());
        let a = store.allocate("a", DType::F32, 8, GPU).unwrap();
        let b = store.allocate("b", DType::F32, 8, GPU).unwrap();
        store.write(a, 0, &pattern(32)).unwrap();
        store.write(b, 0, &pattern(32)[..16]).unwrap();

        accel.fail_frees.store(true, Ordering::Release);
        let handles = store.relocate_many(&[a, b], Device::Cpu, HostAlloc::Pageable).unwrap();
        accel.fail_frees.store(false, Ordering::Release);

        assert_eq!(handles.len(), 2);
        assert_eq!(store.info(a).unwrap().device, Device::Cpu);
        assert_eq!(store.info(b).unwrap().device, Device::Cpu);
        assert_eq!(store.info(a).unwrap().handle, handles[0]);
        assert_eq!(store.read(a).unwrap(), pattern(32));
        assert_eq!(&store.read(b).unwrap()[..16], &pattern(32)[..16]);
        // Sources leaked on the device.
        assert_eq!(accel.bytes_in_use(GPU), 64);
    }
}
