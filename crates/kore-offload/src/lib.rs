//! # kore-offload
//!
//! Transient relocation of ZeRO-partitioned training state from accelerator
//! memory to host memory, and exact restoration of it.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kore_core::{Device, SimAccelerator};
//! use kore_offload::{OffloadEngine, StateCategory, ZeroState};
//!
//! let accel = Arc::new(SimAccelerator::new());
//! let state = ZeroState::builder(accel)
//!     .device(Device::Cuda(0))
//!     .param("fc.weight", &[1024, 1024])
//!     .build()
//!     .unwrap();
//!
//! let mut engine = OffloadEngine::new();
//! engine.offload(&state, StateCategory::OptimStates, Device::Cpu).unwrap();
//! // ... device memory is free for other work ...
//! engine.restore(&state).unwrap();
//! ```
//!
//! Callers must quiesce every user of the selected state (optimizer,
//! gradient reduction, autograd) before `offload`, and typically bracket
//! both calls with a [`ProcessGroup::barrier`] so no rank is mid-relocation
//! while another expects a collective on the same state.

pub mod category;
pub mod config;
pub mod dist;
pub mod engine;
pub mod error;
pub mod registry;
pub mod state;

pub use category::{CategorySelection, StateCategory, StorageLayout};
pub use config::{ConfigError, TrainingConfig};
pub use dist::{ProcessGroup, ThreadGroup};
pub use engine::{OffloadEngine, OffloadOptions, OffloadReport, RelocationRecord, RestoreReport};
pub use error::OffloadError;
pub use registry::{CategoryStorage, Located, StateRegistry};
pub use state::{ParamSpec, ZeroState, ZeroStateBuilder};

pub type Result<T> = std::result::Result<T, OffloadError>;
