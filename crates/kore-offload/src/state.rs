//! One worker's ZeRO stage-3 training state.
//!
//! [`ZeroStateBuilder`] partitions a list of named parameters across the
//! data-parallel group and materialises this rank's share of every
//! offloadable category on the accelerator, registering each with a
//! [`StateRegistry`].

use std::sync::Arc;

use kore_core::{Accelerator, DType, Device, Shape, StorageId, ViewId};
use kore_zero::{padded_shard_len, partition, verify_partition, BufferManager, ShardSpec, StoreError, TensorId, TensorStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::registry::{CategoryStorage, Located, StateRegistry};
use crate::{ConfigError, OffloadError, Result, StateCategory, TrainingConfig};

/// A named logical parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Shape,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, shape: &[usize]) -> Self {
        Self { name: name.into(), shape: Shape::new(shape) }
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }
}

/// Partitioned training state of one rank.
#[derive(Debug)]
pub struct ZeroState {
    rank: usize,
    world_size: usize,
    device: Device,
    compute_dtype: DType,
    params: Vec<ParamSpec>,
    shards: Vec<ShardSpec>,
    store: TensorStore,
    buffers: BufferManager,
    registry: StateRegistry,
}

impl ZeroState {
    pub fn builder(accel: Arc<dyn Accelerator>) -> ZeroStateBuilder {
        ZeroStateBuilder::new(accel)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Accelerator device the state was built on.
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    pub fn store(&self) -> &TensorStore {
        &self.store
    }

    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    pub fn registry(&self) -> &StateRegistry {
        &self.registry
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// This rank's shard of each parameter, in parameter order.
    pub fn param_shards(&self) -> &[ShardSpec] {
        &self.shards
    }

    pub fn locate(&self, category: StateCategory) -> Result<Located> {
        self.registry.locate(category, &self.store)
    }

    /// Raw bytes of each storage backing `category`.
    pub fn category_bytes(&self, category: StateCategory) -> Result<Vec<Vec<u8>>> {
        self.locate(category)?
            .storages
            .iter()
            .map(|s| self.store.read(s.id).map_err(|e| OffloadError::from_store(category, e)))
            .collect()
    }

    /// Current device of each storage backing `category`.
    pub fn category_devices(&self, category: StateCategory) -> Result<Vec<Device>> {
        Ok(self.locate(category)?.devices())
    }

    pub fn category_nbytes(&self, category: StateCategory) -> Result<usize> {
        Ok(self.locate(category)?.nbytes())
    }

    /// Bytes of this state resident on its accelerator device.
    pub fn device_bytes(&self) -> usize {
        self.store.bytes_on(self.device)
    }
}

/// Builder for [`ZeroState`].
#[derive(Debug)]
pub struct ZeroStateBuilder {
    accel: Arc<dyn Accelerator>,
    rank: usize,
    world_size: usize,
    device: Device,
    compute_dtype: DType,
    optimizer: bool,
    offload_optimizer: bool,
    reduce_bucket_size: usize,
    seed: u64,
    params: Vec<ParamSpec>,
}

impl ZeroStateBuilder {
    pub fn new(accel: Arc<dyn Accelerator>) -> Self {
        Self {
            accel,
            rank: 0,
            world_size: 1,
            device: Device::Cuda(0),
            compute_dtype: DType::BF16,
            optimizer: true,
            offload_optimizer: false,
            reduce_bucket_size: 500_000_000,
            seed: 0,
            params: Vec::new(),
        }
    }

    pub fn rank(mut self, rank: usize) -> Self { self.rank = rank; self }

    pub fn world_size(mut self, world_size: usize) -> Self { self.world_size = world_size; self }

    pub fn device(mut self, device: Device) -> Self { self.device = device; self }

    pub fn compute_dtype(mut self, dtype: DType) -> Self { self.compute_dtype = dtype; self }

    /// Whether an optimizer (and so `optim_states`) exists.
    pub fn optimizer(mut self, present: bool) -> Self { self.optimizer = present; self }

    /// Keep master weights and optimizer state on the host.
    pub fn offload_optimizer(mut self, offloaded: bool) -> Self { self.offload_optimizer = offloaded; self }

    /// Capacity of the contiguous gradient buffer, in elements.
    pub fn reduce_bucket_size(mut self, elems: usize) -> Self { self.reduce_bucket_size = elems; self }

    pub fn seed(mut self, seed: u64) -> Self { self.seed = seed; self }

    pub fn param(mut self, name: impl Into<String>, shape: &[usize]) -> Self {
        self.params.push(ParamSpec::new(name, shape));
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = ParamSpec>) -> Self {
        self.params.extend(params);
        self
    }

    /// Apply the state-shaping fields of a training config.
    pub fn from_config(mut self, config: &TrainingConfig) -> Self {
        self.compute_dtype = config.compute_dtype();
        self.optimizer = config.has_optimizer();
        self.offload_optimizer = config.optimizer_offloaded();
        self.reduce_bucket_size = config.zero_optimization.reduce_bucket_size;
        self
    }

    pub fn build(self) -> Result<ZeroState> {
        self.validate()?;

        let store = TensorStore::new(self.accel.clone());
        let buffers = BufferManager::new();
        let mut registry = StateRegistry::new();

        let mut shards = Vec::with_capacity(self.params.len());
        let mut full_values = Vec::with_capacity(self.params.len());
        for (i, spec) in self.params.iter().enumerate() {
            let tensor = TensorId(i);
            let all = partition(tensor, spec.numel(), self.world_size);
            verify_partition(tensor, spec.numel(), &all).map_err(OffloadError::Setup)?;
            shards.push(all[self.rank]);
            full_values.push(self.init_values(tensor, spec.numel(), 0.5));
        }
        let slots: Vec<usize> = self.params.iter().map(|p| padded_shard_len(p.numel(), self.world_size)).collect();
        let shard_numel: usize = slots.iter().sum();
        let mut hp = Vec::with_capacity(shard_numel);
        for ((s, full), slot) in shards.iter().zip(&full_values).zip(&slots) {
            hp.extend_from_slice(&full[s.offset..s.end()]);
            hp.resize(hp.len() + slot - s.len, 0.0);
        }

        let master_device = if self.offload_optimizer { Device::Cpu } else { self.device };

        // hp_params
        let hp_id = store
            .allocate("hp_params", DType::F32, shard_numel, master_device)
            .map_err(OffloadError::Setup)?;
        store.write(hp_id, 0, &encode(&hp, DType::F32)).map_err(OffloadError::Setup)?;

        // lp_params
        let lp_id = store
            .allocate("lp_params", self.compute_dtype, shard_numel, self.device)
            .map_err(OffloadError::Setup)?;
        store.write(lp_id, 0, &encode(&hp, self.compute_dtype)).map_err(OffloadError::Setup)?;
        let lp_views = self.shard_views(&store, lp_id, &shards, &slots, "lp").map_err(OffloadError::Setup)?;

        // optim_states
        let mut moments = Vec::new();
        if self.optimizer {
            let mut rng = self.rng(u64::MAX);
            let exp_avg: Vec<f32> = (0..shard_numel).map(|_| rng.gen_range(-1e-3f32..1e-3)).collect();
            let exp_avg_sq: Vec<f32> = (0..shard_numel).map(|_| rng.gen_range(0.0f32..1e-6)).collect();
            for (label, values) in [("exp_avg", exp_avg), ("exp_avg_sq", exp_avg_sq)] {
                let id = store.allocate(label, DType::F32, shard_numel, master_device).map_err(OffloadError::Setup)?;
                store.write(id, 0, &encode(&values, DType::F32)).map_err(OffloadError::Setup)?;
                moments.push(id);
            }
        }

        // lp_grads
        let grads: Vec<f32> = {
            let mut rng = self.rng(u64::MAX - 1);
            (0..shard_numel).map(|_| rng.gen_range(-1e-2f32..1e-2)).collect()
        };
        let grad_id = store
            .allocate("lp_grads", self.compute_dtype, shard_numel, self.device)
            .map_err(OffloadError::Setup)?;
        store.write(grad_id, 0, &encode(&grads, self.compute_dtype)).map_err(OffloadError::Setup)?;
        let grad_views = self.shard_views(&store, grad_id, &shards, &slots, "grad").map_err(OffloadError::Setup)?;

        // contiguous_grad_buffer
        let total: usize = self.params.iter().map(ParamSpec::numel).sum();
        let bucket_numel = self.reduce_bucket_size.min(total);
        let bucket = buffers
            .create(&store, "contiguous_grad_buffer", self.compute_dtype, bucket_numel, self.device)
            .map_err(OffloadError::Setup)?;
        let mut aliases = Vec::new();
        for spec in &self.params {
            let needed = self.compute_dtype.storage_bytes(spec.numel());
            if needed > buffers.remaining(bucket).map_err(OffloadError::Setup)? {
                break;
            }
            let alias = buffers
                .carve(&store, bucket, spec.shape.clone(), format!("bucket.{}", spec.name))
                .map_err(OffloadError::Setup)?;
            aliases.push(alias);
        }
        let bucket_values: Vec<f32> = {
            let mut rng = self.rng(u64::MAX - 2);
            (0..bucket_numel).map(|_| rng.gen_range(-1e-2f32..1e-2)).collect()
        };
        store.write(bucket, 0, &encode(&bucket_values, self.compute_dtype)).map_err(OffloadError::Setup)?;

        if self.offload_optimizer {
            let reason = "optimizer state and master weights are already offloaded to cpu";
            registry.mark_unavailable(StateCategory::HpParams, reason);
            registry.mark_unavailable(StateCategory::OptimStates, reason);
        } else {
            registry.register(StateCategory::HpParams, CategoryStorage::flat(vec![hp_id]));
            if self.optimizer {
                registry.register(StateCategory::OptimStates, CategoryStorage::flat(moments));
            }
        }
        if !self.optimizer {
            registry.mark_unavailable(StateCategory::OptimStates, "no optimizer is configured");
        }
        registry.register(StateCategory::LpParams, CategoryStorage::with_views(lp_id, lp_views));
        registry.register(StateCategory::LpGrads, CategoryStorage::with_views(grad_id, grad_views));
        registry.register(StateCategory::ContiguousGradBuffer, CategoryStorage::buffer(bucket, aliases));

        tracing::debug!(
            "rank {}/{}: built {} params ({} shard elements, {} bytes on {})",
            self.rank,
            self.world_size,
            self.params.len(),
            shard_numel,
            store.bytes_on(self.device),
            self.device,
        );

        Ok(ZeroState {
            rank: self.rank,
            world_size: self.world_size,
            device: self.device,
            compute_dtype: self.compute_dtype,
            params: self.params,
            shards,
            store,
            buffers,
            registry,
        })
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OffloadError::Config(ConfigError::Invalid(msg)));
        if self.world_size == 0 {
            return invalid("world_size must be positive".into());
        }
        if self.rank >= self.world_size {
            return invalid(format!("rank {} out of range for world_size {}", self.rank, self.world_size));
        }
        if !(self.compute_dtype.is_half() || self.compute_dtype == DType::F32) {
            return invalid(format!("compute dtype must be f32, bf16 or f16, got {}", self.compute_dtype));
        }
        if self.params.is_empty() {
            return invalid("at least one parameter is required".into());
        }
        if let Some(p) = self.params.iter().find(|p| p.numel() == 0) {
            return invalid(format!("parameter '{}' has no elements", p.name));
        }
        Ok(())
    }

    /// Same logical values on every rank; only the seed and tensor matter.
    fn init_values(&self, tensor: TensorId, numel: usize, scale: f32) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(self.seed ^ (tensor.0 as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        (0..numel).map(|_| rng.gen_range(-scale..scale)).collect()
    }

    fn rng(&self, stream: u64) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ stream ^ ((self.rank as u64) << 32))
    }

    fn shard_views(
        &self,
        store: &TensorStore,
        storage: StorageId,
        shards: &[ShardSpec],
        slots: &[usize],
        prefix: &str,
    ) -> std::result::Result<Vec<ViewId>, StoreError> {
        let mut views = Vec::with_capacity(shards.len());
        let mut offset = 0;
        for ((spec, shard), slot) in self.params.iter().zip(shards).zip(slots) {
            views.push(store.create_shard_view(
                storage,
                self.compute_dtype.storage_bytes(offset),
                *shard,
                self.compute_dtype,
                format!("{prefix}.{}", spec.name),
            )?);
            offset += slot;
        }
        Ok(views)
    }
}

/// Native-endian bytes of `values` cast to `dtype`.
fn encode(values: &[f32], dtype: DType) -> Vec<u8> {
    match dtype {
        DType::BF16 => {
            let v: Vec<half::bf16> = values.iter().map(|x| half::bf16::from_f32(*x)).collect();
            bytemuck::cast_slice(&v).to_vec()
        }
        DType::F16 => {
            let v: Vec<half::f16> = values.iter().map(|x| half::f16::from_f32(*x)).collect();
            bytemuck::cast_slice(&v).to_vec()
        }
        _ => bytemuck::cast_slice(values).to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kore_core::SimAccelerator;

    const GPU: Device = Device::Cuda(0);

    fn builder(sim: &Arc<SimAccelerator>) -> ZeroStateBuilder {
        ZeroState::builder(sim.clone())
            .device(GPU)
            .param("w1", &[8, 5])
            .param("b1", &[5])
            .seed(3)
    }

    #[test]
    fn test_layouts() {
        let sim = Arc::new(SimAccelerator::new());
        let state = builder(&sim).world_size(2).rank(1).build().unwrap();

        // 40 -> [20, 40), 5 -> [3, 5) padded to 3 slots
        let shards = state.param_shards();
        assert_eq!((shards[0].offset, shards[0].len), (20, 20));
        assert_eq!((shards[1].offset, shards[1].len), (3, 2));

        assert_eq!(state.category_nbytes(StateCategory::HpParams).unwrap(), 23 * 4);
        assert_eq!(state.category_nbytes(StateCategory::LpParams).unwrap(), 23 * 2);
        assert_eq!(state.category_nbytes(StateCategory::OptimStates).unwrap(), 2 * 23 * 4);
        assert_eq!(state.category_nbytes(StateCategory::LpGrads).unwrap(), 23 * 2);
        assert_eq!(state.category_nbytes(StateCategory::ContiguousGradBuffer).unwrap(), 45 * 2);

        let lp = state.locate(StateCategory::LpParams).unwrap();
        assert_eq!(lp.views.len(), 2);
        assert_eq!(lp.views[1].byte_offset, 40);
        assert_eq!(lp.views[1].shard, Some(shards[1]));

        let bucket = state.locate(StateCategory::ContiguousGradBuffer).unwrap();
        assert_eq!(bucket.views.len(), 2);
        assert_eq!(state.device_bytes(), sim.bytes_in_use(GPU));
    }

    #[test]
    fn test_lp_is_cast_of_hp() {
        let sim = Arc::new(SimAccelerator::new());
        let state = builder(&sim).build().unwrap();
        let hp = &state.category_bytes(StateCategory::HpParams).unwrap()[0];
        let lp = &state.category_bytes(StateCategory::LpParams).unwrap()[0];
        let hp: Vec<f32> = hp.chunks_exact(4).map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])).collect();
        let lp: Vec<half::bf16> = lp.chunks_exact(2).map(|b| half::bf16::from_ne_bytes([b[0], b[1]])).collect();
        for (h, l) in hp.iter().zip(&lp) {
            assert_eq!(half::bf16::from_f32(*h), *l);
        }
    }

    #[test]
    fn test_ranks_agree_on_logical_values() {
        let sim = Arc::new(SimAccelerator::new());
        let r0 = builder(&sim).world_size(2).rank(0).build().unwrap();
        let r1 = builder(&sim).world_size(2).rank(1).build().unwrap();
        let single = builder(&sim).build().unwrap();

        let hp = |s: &ZeroState| s.category_bytes(StateCategory::HpParams).unwrap().remove(0);
        let (a, b, full) = (hp(&r0), hp(&r1), hp(&single));
        // w1 is split 20/20, b1 3/2
        assert_eq!(&a[..80], &full[..80]);
        assert_eq!(&b[..80], &full[80..160]);
        assert_eq!(&a[80..], &full[160..172]);
        assert_eq!(&b[80..88], &full[172..]);
        assert_eq!(&b[88..], &[0u8; 4]);
    }

    #[test]
    fn test_short_param_is_padded_on_every_rank() {
        let sim = Arc::new(SimAccelerator::new());
        for rank in 0..4 {
            let state = ZeroState::builder(sim.clone())
                .device(GPU)
                .param("scale", &[1])
                .world_size(4)
                .rank(rank)
                .build()
                .unwrap();
            let shard = state.param_shards()[0];
            assert_eq!(shard.len, usize::from(rank == 0));
            assert_eq!(state.category_nbytes(StateCategory::HpParams).unwrap(), 4);
            assert_eq!(state.category_nbytes(StateCategory::OptimStates).unwrap(), 2 * 4);
            assert_eq!(state.category_nbytes(StateCategory::LpGrads).unwrap(), 2);

            let lp = state.locate(StateCategory::LpParams).unwrap();
            assert_eq!(lp.views[0].nbytes(), 2 * shard.len);
        }
    }

    #[test]
    fn test_bucket_smaller_than_params() {
        let sim = Arc::new(SimAccelerator::new());
        let state = builder(&sim).reduce_bucket_size(40).build().unwrap();
        let bucket = state.locate(StateCategory::ContiguousGradBuffer).unwrap();
        assert_eq!(bucket.nbytes(), 80);
        assert_eq!(bucket.views.len(), 1);
    }

    #[test]
    fn test_unavailable_categories() {
        let sim = Arc::new(SimAccelerator::new());
        let state = builder(&sim).optimizer(false).build().unwrap();
        assert!(matches!(
            state.locate(StateCategory::OptimStates),
            Err(OffloadError::CategoryUnavailable { category: StateCategory::OptimStates, .. })
        ));

        let state = builder(&sim).offload_optimizer(true).build().unwrap();
        assert!(!state.registry().is_tracked(StateCategory::HpParams));
        assert!(!state.registry().is_tracked(StateCategory::OptimStates));
        assert!(state.registry().is_tracked(StateCategory::LpParams));
        assert!(state.store().bytes_on(Device::Cpu) > 0);
    }

    #[test]
    fn test_from_config() {
        let config = TrainingConfig::from_json(
            r#"{ "fp16": { "enabled": true }, "zero_optimization": { "stage": 3, "reduce_bucket_size": 16 } }"#,
        )
        .unwrap();
        let sim = Arc::new(SimAccelerator::new());
        let state = builder(&sim).from_config(&config).build().unwrap();
        assert_eq!(state.compute_dtype(), DType::F16);
        assert!(!state.registry().is_tracked(StateCategory::OptimStates));
        assert_eq!(state.category_nbytes(StateCategory::ContiguousGradBuffer).unwrap(), 32);
    }

    #[test]
    fn test_invalid_builds() {
        let sim = Arc::new(SimAccelerator::new());
        assert!(matches!(builder(&sim).world_size(2).rank(2).build(), Err(OffloadError::Config(_))));
        assert!(matches!(builder(&sim).compute_dtype(DType::I32).build(), Err(OffloadError::Config(_))));
        assert!(matches!(ZeroState::builder(sim.clone()).build(), Err(OffloadError::Config(_))));
        assert!(matches!(builder(&sim).param("empty", &[0, 4]).build(), Err(OffloadError::Config(_))));
    }

    #[test]
    fn test_setup_out_of_memory() {
        let sim = Arc::new(SimAccelerator::new().with_capacity(GPU, 64));
        let err = builder(&sim).build().unwrap_err();
        assert!(matches!(err, OffloadError::Setup(ref e) if e.is_out_of_memory()));
    }
}
