//! Even partitioning of logical tensors across ranks.

use std::fmt;

use crate::{Result, StoreError};

/// Identity of a logical (unpartitioned) tensor, typically a parameter index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor#{}", self.0)
    }
}

/// The contiguous element range of one logical tensor owned by one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardSpec {
    pub tensor: TensorId,
    pub rank: usize,
    /// First element (inclusive) of the logical tensor held by this shard.
    pub offset: usize,
    /// Number of elements.
    pub len: usize,
}

impl ShardSpec {
    /// One past the last element.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Split `numel` elements of `tensor` across `world_size` ranks.
///
/// Rank `r` gets `[min(r*c, n), min((r+1)*c, n))` with `c = ceil(n / world)`.
/// Trailing ranks may receive empty shards when `n < world_size`.
pub fn partition(tensor: TensorId, numel: usize, world_size: usize) -> Vec<ShardSpec> {
    let world = world_size.max(1);
    let chunk = numel.div_ceil(world);
    (0..world)
        .map(|rank| {
            let start = (rank * chunk).min(numel);
            let end = ((rank + 1) * chunk).min(numel);
            ShardSpec { tensor, rank, offset: start, len: end - start }
        })
        .collect()
}

/// Elements every rank reserves for one tensor of `numel` elements.
///
/// Each rank holds `ceil(n / world)` slots so that no rank owns a zero-byte
/// slice; slots past a short or empty shard are zero padding.
pub fn padded_shard_len(numel: usize, world_size: usize) -> usize {
    numel.div_ceil(world_size.max(1))
}

/// Check that `shards` tile `[0, numel)` exactly: no gap, no overlap, one
/// shard per rank.
pub fn verify_partition(tensor: TensorId, numel: usize, shards: &[ShardSpec]) -> Result<()> {
    let invalid = |detail: String| StoreError::InvalidPartition { tensor, numel, detail };

    let mut sorted: Vec<&ShardSpec> = shards.iter().collect();
    sorted.sort_by_key(|s| (s.offset, s.rank));

    let mut cursor = 0;
    for (i, shard) in sorted.iter().enumerate() {
        if shard.tensor != tensor {
            return Err(invalid(format!("shard {i} belongs to {}", shard.tensor)));
        }
        if shard.is_empty() {
            continue;
        }
        if shard.offset != cursor {
            let kind = if shard.offset > cursor { "gap" } else { "overlap" };
            return Err(invalid(format!("{kind} at element {cursor} (rank {})", shard.rank)));
        }
        cursor = shard.end();
    }
    if cursor != numel {
        return Err(invalid(format!("shards end at element {cursor}")));
    }

    let mut ranks: Vec<usize> = shards.iter().map(|s| s.rank).collect();
    ranks.sort_unstable();
    ranks.dedup();
    if ranks.len() != shards.len() {
        return Err(invalid("duplicate rank".into()));
    }
    Ok(())
}
