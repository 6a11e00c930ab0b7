//! # kore-core
//!
//! Device and memory primitives shared by the Kore training-state crates.
//!
//! Provides:
//! - [`Device`] and [`DType`] descriptors
//! - [`Shape`] for logical tensor layouts
//! - [`BufferHandle`] / [`StorageId`] identities for raw allocations
//! - The [`Accelerator`] trait: allocate, free, copy, query memory in use
//! - [`SimAccelerator`], a host-backed accelerator with capacity limits and
//!   fault injection, plus a CUDA accelerator behind the `cuda` feature

pub mod accelerator;
pub mod device;
pub mod dtype;
pub mod error;
pub mod shape;
pub mod sim;
pub mod storage;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use accelerator::{Accelerator, HostAlloc};
#[cfg(feature = "cuda")]
pub use cuda::CudaAccelerator;
pub use device::Device;
pub use dtype::DType;
pub use error::KoreError;
pub use shape::Shape;
pub use sim::{AllocStats, SimAccelerator};
pub use storage::{BufferHandle, StorageId, ViewId};

pub type Result<T> = std::result::Result<T, KoreError>;
