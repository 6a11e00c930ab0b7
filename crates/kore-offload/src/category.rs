//! The closed taxonomy of offloadable training state.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// A class of training state eligible for offload.
///
/// The derived ordering is the fixed order in which categories are
/// relocated and restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateCategory {
    /// fp32 master copy of this rank's parameter partition.
    HpParams,
    /// Compute-dtype (bf16/fp16) parameter partition.
    LpParams,
    /// Optimizer moments (Adam `exp_avg`, `exp_avg_sq`).
    #[serde(alias = "opt_states")]
    OptimStates,
    /// Compute-dtype gradient partition.
    LpGrads,
    /// Contiguous bucket used to batch gradients for reduction.
    ContiguousGradBuffer,
}

/// How a category's storage is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageLayout {
    /// One or more flat partitioned shards with no outstanding views.
    FlatShard,
    /// A flat shard exposed through one view per parameter.
    PerParamViews,
    /// A single contiguous buffer with aliased per-parameter views.
    ContiguousBuffer,
}

impl StateCategory {
    /// Every category, in relocation order.
    pub const ALL: [StateCategory; 5] = [
        StateCategory::HpParams,
        StateCategory::LpParams,
        StateCategory::OptimStates,
        StateCategory::LpGrads,
        StateCategory::ContiguousGradBuffer,
    ];

    /// Stable identity, also the configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            StateCategory::HpParams => "hp_params",
            StateCategory::LpParams => "lp_params",
            StateCategory::OptimStates => "optim_states",
            StateCategory::LpGrads => "lp_grads",
            StateCategory::ContiguousGradBuffer => "contiguous_grad_buffer",
        }
    }

    pub fn layout(&self) -> StorageLayout {
        match self {
            StateCategory::HpParams | StateCategory::OptimStates => StorageLayout::FlatShard,
            StateCategory::LpParams | StateCategory::LpGrads => StorageLayout::PerParamViews,
            StateCategory::ContiguousGradBuffer => StorageLayout::ContiguousBuffer,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StateCategory::HpParams => "fp32 master parameter partition",
            StateCategory::LpParams => "compute-dtype parameter partition",
            StateCategory::OptimStates => "optimizer moment estimates",
            StateCategory::LpGrads => "compute-dtype gradient partition",
            StateCategory::ContiguousGradBuffer => "gradient reduction bucket",
        }
    }
}

impl fmt::Display for StateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for StorageLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageLayout::FlatShard => "flat shard",
            StorageLayout::PerParamViews => "per-param views",
            StorageLayout::ContiguousBuffer => "contiguous buffer",
        };
        f.write_str(s)
    }
}

impl FromStr for StateCategory {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "opt_states" {
            return Ok(StateCategory::OptimStates);
        }
        StateCategory::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown state category '{s}'")))
    }
}

/// Which categories an `offload` call covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CategorySelection {
    /// Every category the registry currently tracks.
    #[default]
    All,
    /// Exactly these categories. May be empty.
    Only(BTreeSet<StateCategory>),
}

impl CategorySelection {
    /// Empty selection: offloading it is a no-op.
    pub fn none() -> Self {
        CategorySelection::Only(BTreeSet::new())
    }

    /// Expand to a concrete list in relocation order.
    pub fn resolve(&self, tracked: &[StateCategory]) -> Vec<StateCategory> {
        match self {
            CategorySelection::All => {
                let mut all = tracked.to_vec();
                all.sort();
                all.dedup();
                all
            }
            CategorySelection::Only(set) => set.iter().copied().collect(),
        }
    }

    /// Parse a comma-separated list of category names; `all` selects all.
    pub fn parse_list(s: &str) -> Result<Self, ConfigError> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(CategorySelection::All);
        }
        s.split(',')
            .filter(|p| !p.trim().is_empty())
            .map(str::parse)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(CategorySelection::Only)
    }
}

impl From<StateCategory> for CategorySelection {
    fn from(c: StateCategory) -> Self {
        CategorySelection::Only(BTreeSet::from([c]))
    }
}

impl From<Option<StateCategory>> for CategorySelection {
    fn from(c: Option<StateCategory>) -> Self {
        c.map_or(CategorySelection::All, Into::into)
    }
}

impl<const N: usize> From<[StateCategory; N]> for CategorySelection {
    fn from(cs: [StateCategory; N]) -> Self {
        CategorySelection::Only(cs.into_iter().collect())
    }
}

impl From<Option<Vec<StateCategory>>> for CategorySelection {
    fn from(cs: Option<Vec<StateCategory>>) -> Self {
        cs.map_or(CategorySelection::All, |v| CategorySelection::Only(v.into_iter().collect()))
    }
}

impl FromIterator<StateCategory> for CategorySelection {
    fn from_iter<I: IntoIterator<Item = StateCategory>>(iter: I) -> Self {
        CategorySelection::Only(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_roundtrip() {
        for c in StateCategory::ALL {
            assert_eq!(c.name().parse::<StateCategory>().unwrap(), c);
            let json = serde_json::to_string(&c).unwrap();
            assert_eq!(json, format!("\"{}\"", c.name()));
        }
        assert_eq!("opt_states".parse::<StateCategory>().unwrap(), StateCategory::OptimStates);
        let c: StateCategory = serde_json::from_str("\"opt_states\"").unwrap();
        assert_eq!(c, StateCategory::OptimStates);
        assert!("activations".parse::<StateCategory>().is_err());
    }

    #[test]
    fn test_order_is_fixed() {
        let mut shuffled = vec![
            StateCategory::ContiguousGradBuffer,
            StateCategory::HpParams,
            StateCategory::LpGrads,
            StateCategory::OptimStates,
            StateCategory::LpParams,
        ];
        shuffled.sort();
        assert_eq!(shuffled, StateCategory::ALL.to_vec());
    }

    #[test]
    fn test_layouts() {
        assert_eq!(StateCategory::HpParams.layout(), StorageLayout::FlatShard);
        assert_eq!(StateCategory::LpGrads.layout(), StorageLayout::PerParamViews);
        assert_eq!(StateCategory::ContiguousGradBuffer.layout(), StorageLayout::ContiguousBuffer);
    }

    #[test]
    fn test_selection_resolve() {
        let tracked = [StateCategory::LpGrads, StateCategory::HpParams];
        assert_eq!(
            CategorySelection::All.resolve(&tracked),
            vec![StateCategory::HpParams, StateCategory::LpGrads]
        );
        let only: CategorySelection = [StateCategory::LpGrads, StateCategory::HpParams, StateCategory::OptimStates].into();
        assert_eq!(
            only.resolve(&tracked),
            vec![StateCategory::HpParams, StateCategory::OptimStates, StateCategory::LpGrads]
        );
        assert!(CategorySelection::none().resolve(&tracked).is_empty());
        assert_eq!(CategorySelection::from(None::<StateCategory>), CategorySelection::All);
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(CategorySelection::parse_list("all").unwrap(), CategorySelection::All);
        assert_eq!(
            CategorySelection::parse_list("lp_grads, hp_params").unwrap(),
            [StateCategory::HpParams, StateCategory::LpGrads].into()
        );
        assert_eq!(CategorySelection::parse_list("").unwrap(), CategorySelection::none());
        assert!(CategorySelection::parse_list("hp_params,bogus").is_err());
    }
}
